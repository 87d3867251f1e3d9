//! Parsers for the `/proc` tables the exporter reads.
//!
//! All parsers are line-tolerant: a line that does not have the expected shape
//! is skipped and the rest of the table is still returned.

/// Fixed sector size the kernel reports `/proc/diskstats` counters in.
pub const SECTOR_SIZE: u64 = 512;

// ============ Disk Stats Parser ============

/// Minimum fields per line: major, minor, name and 11 counters.
const DISKSTATS_MIN_FIELDS: usize = 14;
/// Discard counters appear from kernel 4.18.
const DISKSTATS_DISCARD_FIELDS: usize = 18;
/// Flush counters appear from kernel 5.5.
const DISKSTATS_FLUSH_FIELDS: usize = 20;

/// Parsed data from `/proc/diskstats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    /// Block device major number.
    pub major: u32,
    /// Block device minor number.
    pub minor: u32,
    /// Device name (sda, nvme0n1, etc.)
    pub device: String,
    /// Number of reads completed
    pub reads: u64,
    /// Number of read requests merged
    pub r_merged: u64,
    /// Number of sectors read
    pub read_sectors: u64,
    /// Time spent reading (ms)
    pub read_time: u64,
    /// Number of writes completed
    pub writes: u64,
    /// Number of write requests merged
    pub w_merged: u64,
    /// Number of sectors written
    pub write_sectors: u64,
    /// Time spent writing (ms)
    pub write_time: u64,
    /// Number of I/Os currently in progress
    pub io_in_progress: u64,
    /// Time spent doing I/Os (ms)
    pub io_time: u64,
    /// Weighted time spent doing I/Os (ms)
    pub io_weighted_time: u64,
    /// Number of discards completed (0 before 4.18)
    pub discards: u64,
    /// Number of discard requests merged
    pub d_merged: u64,
    /// Number of sectors discarded
    pub discard_sectors: u64,
    /// Time spent discarding (ms)
    pub discard_time: u64,
    /// Number of flush requests completed (0 before 5.5)
    pub flushes: u64,
    /// Time spent flushing (ms)
    pub flush_time: u64,
}

impl DiskStats {
    /// Kernel device id in `"major:minor"` form.
    pub fn device_id(&self) -> String {
        format!("{}:{}", self.major, self.minor)
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_sectors.saturating_mul(SECTOR_SIZE)
    }

    pub fn write_bytes(&self) -> u64 {
        self.write_sectors.saturating_mul(SECTOR_SIZE)
    }

    pub fn discard_bytes(&self) -> u64 {
        self.discard_sectors.saturating_mul(SECTOR_SIZE)
    }
}

/// Parses `/proc/diskstats` content.
///
/// Format: `major minor name reads r_merged r_sectors r_time writes w_merged
/// w_sectors w_time io_pending io_time w_io_time [discards d_merged d_sectors
/// d_time [flushes f_time]]`
///
/// Lines with fewer than 14 fields, or with a field that is not an unsigned
/// integer, are skipped. Optional counter groups default to zero when absent.
pub fn parse_diskstats(content: &str) -> Vec<DiskStats> {
    content.lines().filter_map(parse_diskstats_line).collect()
}

fn parse_diskstats_line(line: &str) -> Option<DiskStats> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < DISKSTATS_MIN_FIELDS {
        return None;
    }

    let major = parts[0].parse().ok()?;
    let minor = parts[1].parse().ok()?;

    let mut counters = [0u64; DISKSTATS_FLUSH_FIELDS - 3];
    for (slot, raw) in counters.iter_mut().zip(&parts[3..]) {
        *slot = raw.parse().ok()?;
    }
    if parts.len() < DISKSTATS_DISCARD_FIELDS {
        counters[11..].fill(0);
    } else if parts.len() < DISKSTATS_FLUSH_FIELDS {
        counters[15..].fill(0);
    }

    Some(DiskStats {
        major,
        minor,
        device: parts[2].to_string(),
        reads: counters[0],
        r_merged: counters[1],
        read_sectors: counters[2],
        read_time: counters[3],
        writes: counters[4],
        w_merged: counters[5],
        write_sectors: counters[6],
        write_time: counters[7],
        io_in_progress: counters[8],
        io_time: counters[9],
        io_weighted_time: counters[10],
        discards: counters[11],
        d_merged: counters[12],
        discard_sectors: counters[13],
        discard_time: counters[14],
        flushes: counters[15],
        flush_time: counters[16],
    })
}

// ============ Mount Table Parser ============

/// One line of `/proc/mounts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountEntry {
    /// Device spec as written in the table (`/dev/sda1`, `tmpfs`, ...).
    pub device: String,
    pub mount_point: String,
    pub fs_type: String,
    pub options: String,
}

/// Parses `/proc/mounts` content, preserving table order.
///
/// Lines with fewer than 4 fields are skipped. Fields are taken verbatim.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let device = parts.next()?;
            let mount_point = parts.next()?;
            let fs_type = parts.next()?;
            let options = parts.next()?;
            Some(MountEntry {
                device: device.to_string(),
                mount_point: mount_point.to_string(),
                fs_type: fs_type.to_string(),
                options: options.to_string(),
            })
        })
        .collect()
}

/// Returns the entry with the longest mount point that is a string prefix of
/// `path`. On equal length the earlier entry wins.
pub fn find_mount_by_path<'a>(
    entries: &'a [MountEntry],
    path: &str,
) -> Option<&'a MountEntry> {
    let mut best: Option<&MountEntry> = None;
    for entry in entries {
        if !path.starts_with(entry.mount_point.as_str()) {
            continue;
        }
        if best.is_none_or(|b| entry.mount_point.len() > b.mount_point.len()) {
            best = Some(entry);
        }
    }
    best
}

/// Returns the entry mounted exactly at `path`.
///
/// A covering ancestor such as `/` does not count, so a kubelet volume
/// directory that has no mount of its own yields `None`.
pub fn find_mount_at<'a>(entries: &'a [MountEntry], path: &str) -> Option<&'a MountEntry> {
    let path = path.trim_end_matches('/');
    find_mount_by_path(entries, path).filter(|m| m.mount_point.trim_end_matches('/') == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_diskstats() {
        let content = "\
   8       0 sda 1234 0 56789 100 5678 0 98765 200 0 150 300
   8       1 sda1 1000 0 50000 80 5000 0 90000 180 0 130 260 0 0 0 0
 259       0 nvme0n1 9999 0 123456 500 8888 0 654321 400 5 1000 2000 17 1 4096 9 311 42
";
        let disks = parse_diskstats(content);

        assert_eq!(disks.len(), 3);

        assert_eq!(disks[0].major, 8);
        assert_eq!(disks[0].minor, 0);
        assert_eq!(disks[0].device, "sda");
        assert_eq!(disks[0].reads, 1234);
        assert_eq!(disks[0].read_sectors, 56789);
        assert_eq!(disks[0].writes, 5678);
        assert_eq!(disks[0].write_sectors, 98765);
        assert_eq!(disks[0].io_time, 150);
        assert_eq!(disks[0].io_weighted_time, 300);
        assert_eq!(disks[0].discards, 0);
        assert_eq!(disks[0].flushes, 0);

        assert_eq!(disks[2].device_id(), "259:0");
        assert_eq!(disks[2].io_in_progress, 5);
        assert_eq!(disks[2].discards, 17);
        assert_eq!(disks[2].discard_sectors, 4096);
        assert_eq!(disks[2].discard_time, 9);
        assert_eq!(disks[2].flushes, 311);
        assert_eq!(disks[2].flush_time, 42);
    }

    #[test]
    fn test_parse_diskstats_byte_totals() {
        let disks = parse_diskstats("   8       1 sda1 100 0 800 50 20 0 160 30 0 70 80\n");
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].reads, 100);
        assert_eq!(disks[0].read_bytes(), 409_600);
        assert_eq!(disks[0].write_bytes(), 81_920);
        assert_eq!(disks[0].discard_bytes(), 0);
    }

    #[test]
    fn test_parse_diskstats_discards_without_flushes() {
        let disks =
            parse_diskstats("   8  16 sdb 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15\n");
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].discards, 12);
        assert_eq!(disks[0].d_merged, 13);
        assert_eq!(disks[0].discard_sectors, 14);
        assert_eq!(disks[0].discard_time, 15);
        assert_eq!(disks[0].flushes, 0);
    }

    #[test]
    fn test_parse_diskstats_skips_malformed_lines() {
        let content = "\
   8       0 sda 1 2 3
   8       1 sda1 100 0 800 50 20 0 160 30 0 70 80

   x       2 sda2 100 0 800 50 20 0 160 30 0 70 80
   8       3 sda3 100 0 800 -50 20 0 160 30 0 70 80
   8       4 sda4 100 0 800 50 20 0 160 30 0 70 80 bogus 0 0 0
";
        let disks = parse_diskstats(content);
        let names: Vec<&str> = disks.iter().map(|d| d.device.as_str()).collect();
        assert_eq!(names, vec!["sda1"]);
        assert!(disks.len() <= content.lines().count());
    }

    #[test]
    fn test_parse_mounts() {
        let content = "\
/dev/sda1 / ext4 rw,relatime 0 0
proc /proc proc rw,nosuid 0 0
broken line
/dev/nvme1n1 /var/lib/kubelet/pods/p/volumes/kubernetes.io~csi/v/mount xfs rw
";
        let mounts = parse_mounts(content);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].device, "/dev/sda1");
        assert_eq!(mounts[0].mount_point, "/");
        assert_eq!(mounts[1].fs_type, "proc");
        assert_eq!(mounts[2].options, "rw");
    }

    #[test]
    fn test_find_mount_by_path_longest_prefix() {
        let mounts = parse_mounts("/dev/sda1 /a ext4 rw\n/dev/sdb1 /a/b ext4 rw\n");
        let found = find_mount_by_path(&mounts, "/a/b/c").unwrap();
        assert_eq!(found.mount_point, "/a/b");

        // Table order does not matter.
        let mounts = parse_mounts("/dev/sdb1 /a/b ext4 rw\n/dev/sda1 /a ext4 rw\n");
        let found = find_mount_by_path(&mounts, "/a/b/c").unwrap();
        assert_eq!(found.device, "/dev/sdb1");

        assert!(find_mount_by_path(&mounts, "/other").is_none());
    }

    #[test]
    fn test_find_mount_at_ignores_covering_mounts() {
        let mounts = parse_mounts(
            "/dev/sda1 / ext4 rw 0 0\n/dev/nvme1n1 /var/lib/kubelet/pods/u/vol/mount xfs rw 0 0\n",
        );

        let found = find_mount_at(&mounts, "/var/lib/kubelet/pods/u/vol/mount/").unwrap();
        assert_eq!(found.device, "/dev/nvme1n1");

        // Only `/` covers this directory: it is not mounted.
        assert!(find_mount_at(&mounts, "/var/lib/kubelet/pods/u/other/mount").is_none());
        assert_eq!(
            find_mount_by_path(&mounts, "/var/lib/kubelet/pods/u/other/mount").unwrap().device,
            "/dev/sda1"
        );
    }

    #[test]
    fn test_find_mount_by_path_first_wins_on_tie() {
        let mounts = parse_mounts("/dev/sda1 /data ext4 rw\n/dev/sdb1 /data xfs rw\n");
        let found = find_mount_by_path(&mounts, "/data/x").unwrap();
        assert_eq!(found.device, "/dev/sda1");
    }
}
