//! In-memory mock filesystem for testing readers and volume sources without
//! a real `/proc`, `/dev` or kubelet directory.

use crate::collector::device::make_device_number;
use crate::collector::traits::{FileSystem, FsUsage};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

/// In-memory filesystem for testing.
///
/// Besides files and directories it models the pieces of host state the
/// volume pipeline reads through [`FileSystem`]: symlinks under `/dev`,
/// the device number a mount point stats to, and statvfs results.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    /// Map from path to file contents.
    files: HashMap<PathBuf, String>,
    /// Set of directories (for read_dir support).
    directories: HashSet<PathBuf>,
    /// Map from link path to its (possibly relative) target.
    symlinks: HashMap<PathBuf, PathBuf>,
    /// Raw `st_dev` per path.
    device_numbers: HashMap<PathBuf, u64>,
    /// statvfs result per mount point.
    usage: HashMap<PathBuf, FsUsage>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file with the given content.
    ///
    /// Parent directories are automatically created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Adds a symbolic link. The target is stored verbatim.
    pub fn add_symlink(&mut self, link: impl AsRef<Path>, target: impl AsRef<Path>) {
        let link = link.as_ref().to_path_buf();
        self.add_parents(&link);
        self.symlinks.insert(link, target.as_ref().to_path_buf());
    }

    /// Makes `path` stat to the given device id.
    pub fn set_device_id(&mut self, path: impl AsRef<Path>, major: u32, minor: u32) {
        self.device_numbers
            .insert(path.as_ref().to_path_buf(), make_device_number(major, minor));
    }

    /// Sets the statvfs result for a mount point.
    pub fn set_usage(&mut self, path: impl AsRef<Path>, usage: FsUsage) {
        self.usage.insert(path.as_ref().to_path_buf(), usage);
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }
}

fn not_found(what: &str, path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found: {:?}", what, path),
    )
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found("file", path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
            || self.directories.contains(path)
            || self.symlinks.contains_key(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(not_found("directory", path));
        }

        let is_child = |p: &&PathBuf| p.parent().is_some_and(|parent| parent == path);

        let mut entries = HashSet::new();
        entries.extend(self.files.keys().filter(is_child).cloned());
        entries.extend(self.symlinks.keys().filter(is_child).cloned());
        entries.extend(
            self.directories
                .iter()
                .filter(|d| d.as_path() != path)
                .filter(is_child)
                .cloned(),
        );

        Ok(entries.into_iter().collect())
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        match self.symlinks.get(path) {
            Some(target) => Ok(target.clone()),
            None if self.exists(path) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symbolic link: {:?}", path),
            )),
            None => Err(not_found("path", path)),
        }
    }

    fn device_number(&self, path: &Path) -> io::Result<u64> {
        self.device_numbers
            .get(path)
            .copied()
            .ok_or_else(|| not_found("device for", path))
    }

    fn statvfs(&self, path: &Path) -> io::Result<FsUsage> {
        self.usage
            .get(path)
            .copied()
            .ok_or_else(|| not_found("filesystem at", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_add_file() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/mounts", "/dev/sda1 / ext4 rw 0 0\n");

        assert!(fs.exists(Path::new("/proc/mounts")));
        assert!(fs.exists(Path::new("/proc")));
        assert!(fs.is_dir(Path::new("/proc")));
        assert!(!fs.is_dir(Path::new("/proc/mounts")));

        let content = fs.read_to_string(Path::new("/proc/mounts")).unwrap();
        assert_eq!(content, "/dev/sda1 / ext4 rw 0 0\n");
    }

    #[test]
    fn test_mock_fs_read_dir() {
        let mut fs = MockFs::new();
        fs.add_dir("/var/lib/kubelet/pods/uid-1/volumes");
        fs.add_file("/var/lib/kubelet/pods/uid-2/etc-hosts", "127.0.0.1 localhost");
        fs.add_dir("/var/lib/kubelet/pods/uid-3");

        let pods = fs.read_dir(Path::new("/var/lib/kubelet/pods")).unwrap();
        assert_eq!(pods.len(), 3);

        let uid2 = fs.read_dir(Path::new("/var/lib/kubelet/pods/uid-2")).unwrap();
        assert_eq!(uid2.len(), 1);

        assert!(fs.read_dir(Path::new("/var/lib/missing")).is_err());
    }

    #[test]
    fn test_mock_fs_symlinks() {
        let mut fs = MockFs::new();
        fs.add_symlink("/dev/disk/by-uuid/abcd", "../../sdb1");
        fs.add_file("/dev/sdb1", "");

        assert!(fs.exists(Path::new("/dev/disk/by-uuid/abcd")));
        assert_eq!(
            fs.read_link(Path::new("/dev/disk/by-uuid/abcd")).unwrap(),
            PathBuf::from("../../sdb1")
        );

        let err = fs.read_link(Path::new("/dev/sdb1")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let entries = fs.read_dir(Path::new("/dev/disk/by-uuid")).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_mock_fs_device_and_usage() {
        let mut fs = MockFs::new();
        fs.set_device_id("/mnt/data", 8, 17);
        fs.set_usage(
            "/mnt/data",
            FsUsage {
                block_size: 4096,
                blocks: 100,
                blocks_free: 25,
                files: 64,
                files_free: 60,
            },
        );

        assert_eq!(
            fs.device_number(Path::new("/mnt/data")).unwrap(),
            make_device_number(8, 17)
        );
        assert_eq!(fs.statvfs(Path::new("/mnt/data")).unwrap().blocks_free, 25);
        assert!(fs.statvfs(Path::new("/mnt/other")).is_err());
    }
}
