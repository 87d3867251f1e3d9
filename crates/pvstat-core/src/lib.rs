//! pvstat-core: per-volume storage telemetry for Kubernetes nodes.
//!
//! Provides:
//! - `collector`: host readers (`/proc/diskstats`, `/proc/mounts`, statvfs),
//!   device identity resolution and the per-scrape exporter
//! - `discovery`: volume sources (kubelet directory scan, cluster API) and
//!   the multi-source resolver that merges them into one record per device
//! - `metrics`: metric catalog and the per-scrape Prometheus registry
//! - `config`: exporter configuration and host path detection

pub mod collector;
pub mod config;
pub mod discovery;
pub mod metrics;

/// Crate version with the git revision it was built from.
pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("PVSTAT_GIT_SHA"), ")");
