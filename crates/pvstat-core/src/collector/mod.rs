//! Host-side data collection for the exporter.
//!
//! This module provides:
//! - readers for `/proc/mounts` and `/proc/diskstats`
//! - the filesystem capacity prober and the block device identity resolver
//! - the scrape orchestrator and its per-volume collectors
//! - the `FileSystem` abstraction, with an in-memory mock for tests

pub mod capacity;
#[allow(clippy::module_inception)]
pub mod collector;
pub mod device;
pub mod error;
pub mod mock;
pub mod procfs;
pub mod traits;

pub use capacity::{Capacity, probe_capacity};
pub use collector::{
    CapacityCollector, DiskstatsCollector, ScrapeSnapshot, VolumeCollector, VolumeExporter,
    backfill_device_names,
};
pub use device::{ResolvedDevice, device_id, resolve_device};
pub use error::CollectError;
pub use mock::MockFs;
pub use procfs::{DiskStats, DiskStatsIndex, MountEntry};
pub use traits::{FileSystem, FsUsage, RealFs};
