use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Error type for host readers and metric collectors.
#[derive(Debug, Error)]
pub enum CollectError {
    /// A host table or file could not be opened or read.
    #[error("failed to read {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },

    /// `stat` on a path failed.
    #[error("stat {}: {source}", .path.display())]
    Stat { path: PathBuf, source: io::Error },

    /// The space/inode usage query failed (not mounted, permission, stale handle).
    #[error("statvfs {}: {source}", .path.display())]
    Statfs { path: PathBuf, source: io::Error },

    /// Building or encoding the per-scrape registry failed.
    #[error("metric registry: {0}")]
    Registry(#[from] prometheus::Error),

    /// A blocking collector task panicked or was cancelled.
    #[error("collector task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A host table read once per scrape was unavailable.
    #[error(transparent)]
    Snapshot(Arc<CollectError>),
}

impl CollectError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CollectError::Io {
            path: path.into(),
            source,
        }
    }
}
