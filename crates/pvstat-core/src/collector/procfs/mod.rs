//! Readers for the Linux `/proc` tables.
//!
//! Both tables are re-read on every scrape; nothing here caches.

pub mod parser;

use std::collections::HashMap;
use std::path::Path;

use crate::collector::error::CollectError;
use crate::collector::traits::FileSystem;

pub use parser::{
    DiskStats, MountEntry, find_mount_at, find_mount_by_path, parse_diskstats, parse_mounts,
};

/// `/proc/diskstats` snapshot indexed by device name and by device id.
#[derive(Debug, Clone, Default)]
pub struct DiskStatsIndex {
    disks: Vec<DiskStats>,
    by_name: HashMap<String, usize>,
    by_device_id: HashMap<String, usize>,
}

impl DiskStatsIndex {
    pub fn new(disks: Vec<DiskStats>) -> Self {
        let mut by_name = HashMap::with_capacity(disks.len());
        let mut by_device_id = HashMap::with_capacity(disks.len());
        for (i, disk) in disks.iter().enumerate() {
            by_name.insert(disk.device.clone(), i);
            by_device_id.insert(disk.device_id(), i);
        }
        Self {
            disks,
            by_name,
            by_device_id,
        }
    }

    pub fn by_name(&self, name: &str) -> Option<&DiskStats> {
        self.by_name.get(name).map(|&i| &self.disks[i])
    }

    pub fn by_device_id(&self, device_id: &str) -> Option<&DiskStats> {
        self.by_device_id.get(device_id).map(|&i| &self.disks[i])
    }

    /// Looks a volume up by device id first, then by device name.
    /// Empty keys never match.
    pub fn lookup(&self, device_id: &str, device_name: &str) -> Option<&DiskStats> {
        let by_id = (!device_id.is_empty())
            .then(|| self.by_device_id(device_id))
            .flatten();
        by_id.or_else(|| {
            (!device_name.is_empty())
                .then(|| self.by_name(device_name))
                .flatten()
        })
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiskStats> {
        self.disks.iter()
    }
}

/// Reads and indexes the diskstats table at `path`.
pub fn read_diskstats<F: FileSystem + ?Sized>(
    fs: &F,
    path: &Path,
) -> Result<DiskStatsIndex, CollectError> {
    let content = fs
        .read_to_string(path)
        .map_err(|e| CollectError::io(path, e))?;
    Ok(DiskStatsIndex::new(parse_diskstats(&content)))
}

/// Reads the mount table at `path`.
pub fn read_mounts<F: FileSystem + ?Sized>(
    fs: &F,
    path: &Path,
) -> Result<Vec<MountEntry>, CollectError> {
    let content = fs
        .read_to_string(path)
        .map_err(|e| CollectError::io(path, e))?;
    Ok(parse_mounts(&content))
}
