//! Filesystem capacity probing.

use std::path::Path;

use crate::collector::error::CollectError;
use crate::collector::traits::{FileSystem, FsUsage};

/// Space and inode usage of one mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
    pub free_inodes: u64,
}

impl Capacity {
    /// Derives byte and inode totals from a raw statvfs result.
    ///
    /// Used values are `total - free`; the kernel never reports them directly.
    pub fn from_usage(usage: FsUsage) -> Self {
        let total_bytes = usage.blocks.saturating_mul(usage.block_size);
        let free_bytes = usage.blocks_free.saturating_mul(usage.block_size);
        Self {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            free_bytes,
            total_inodes: usage.files,
            used_inodes: usage.files.saturating_sub(usage.files_free),
            free_inodes: usage.files_free,
        }
    }
}

/// Queries capacity of the filesystem mounted at `mount_point`.
pub fn probe_capacity<F: FileSystem + ?Sized>(
    fs: &F,
    mount_point: &Path,
) -> Result<Capacity, CollectError> {
    let usage = fs
        .statvfs(mount_point)
        .map_err(|source| CollectError::Statfs {
            path: mount_point.to_path_buf(),
            source,
        })?;
    Ok(Capacity::from_usage(usage))
}
