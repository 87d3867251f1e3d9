//! Block device identity resolution.
//!
//! Volumes are joined against `/proc/diskstats` by kernel device identity.
//! Two forms are produced here:
//!
//! - the canonical device *name* (`nvme1n1`, `dm-3`), found by following the
//!   symlink chain of the device spec seen in the mount table, e.g.
//!   `/dev/disk/by-id/nvme-Amazon_EBS_vol0123 -> ../../nvme1n1`;
//! - the device *id* (`"259:1"`), read by stat'ing a mount point.
//!
//! Names are unstable across reboots and hot-plug, and ambiguous for mapped
//! devices, so the id is preferred wherever a mount point is available.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::collector::error::CollectError;
use crate::collector::traits::FileSystem;

/// Maximum number of symlinks followed before giving up.
pub const MAX_SYMLINK_HOPS: usize = 255;

/// Result of following a device path to its final target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedDevice {
    /// Fully resolved path (`/dev/nvme1n1`).
    pub path: String,
    /// Final path segment of `path` (`nvme1n1`).
    pub name: String,
}

impl ResolvedDevice {
    fn from_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: path.to_string_lossy().into_owned(),
            name,
        }
    }
}

/// Follows the symlink chain starting at `device_path`.
///
/// Relative link targets are resolved against the directory holding the
/// link. A chain longer than [`MAX_SYMLINK_HOPS`] (including a cycle) fails
/// closed: the unresolved input path is returned.
pub fn resolve_device<F: FileSystem + ?Sized>(fs: &F, device_path: &str) -> ResolvedDevice {
    let mut current = PathBuf::from(device_path);
    let mut hops = 0;

    loop {
        let Ok(target) = fs.read_link(&current) else {
            return ResolvedDevice::from_path(&current);
        };

        if hops == MAX_SYMLINK_HOPS {
            debug!(
                device = device_path,
                hops, "symlink chain too long, keeping unresolved device path"
            );
            return ResolvedDevice::from_path(Path::new(device_path));
        }
        hops += 1;

        current = if target.is_absolute() {
            normalize_lexically(&target)
        } else {
            let parent = current.parent().unwrap_or(Path::new("/"));
            normalize_lexically(&parent.join(target))
        };
    }
}

/// Returns the `"major:minor"` id of the device backing `path`.
pub fn device_id<F: FileSystem + ?Sized>(fs: &F, path: &Path) -> Result<String, CollectError> {
    let dev = fs
        .device_number(path)
        .map_err(|source| CollectError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
    let (major, minor) = split_device_number(dev);
    Ok(format!("{}:{}", major, minor))
}

/// Splits a raw `st_dev` into (major, minor) using the Linux encoding.
pub fn split_device_number(dev: u64) -> (u32, u32) {
    let major = (dev >> 8) & 0xfff;
    let minor = (dev & 0xff) | ((dev >> 12) & 0xfff00);
    (major as u32, minor as u32)
}

/// Inverse of [`split_device_number`].
pub fn make_device_number(major: u32, minor: u32) -> u64 {
    let major = u64::from(major);
    let minor = u64::from(minor);
    (minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12)
}

/// Collapses `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
