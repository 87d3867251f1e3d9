//! Metric catalog: which numbers are exported for a volume, under which
//! names and labels.
//!
//! The catalog is built once at startup and shared read-only by every
//! scrape. Kernel time counters are in milliseconds; they are converted to
//! seconds here and nowhere else.

pub mod registry;

pub use registry::ScrapeRegistry;

use crate::collector::capacity::Capacity;
use crate::collector::procfs::DiskStats;
use crate::discovery::VolumeRecord;

pub const METRIC_PREFIX: &str = "pvstat_";

/// Content type of the text exposition format.
pub const TEXT_CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Labels attached to every per-volume series, in this order.
pub const VOLUME_LABELS: [&str; 8] = [
    "device",
    "pvc",
    "namespace",
    "pv",
    "pod",
    "pod_namespace",
    "storage_class",
    "csi_driver",
];

/// Label values for `record`, ordered as [`VOLUME_LABELS`].
pub fn volume_labels(record: &VolumeRecord) -> [&str; 8] {
    [
        record.device_name.as_str(),
        record.pvc_name.as_str(),
        record.pvc_namespace.as_str(),
        record.pv_name.as_str(),
        record.pod_name.as_str(),
        record.pod_namespace.as_str(),
        record.storage_class.as_str(),
        record.csi_driver.as_str(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

/// One exported series family and how to compute its value from `T`.
#[derive(Debug, Clone)]
pub struct MetricDef<T> {
    /// Name without [`METRIC_PREFIX`].
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub value: fn(&T) -> f64,
}

impl<T> MetricDef<T> {
    pub fn full_name(&self) -> String {
        format!("{}{}", METRIC_PREFIX, self.name)
    }
}

fn counter<T>(name: &'static str, help: &'static str, value: fn(&T) -> f64) -> MetricDef<T> {
    MetricDef {
        name,
        help,
        kind: MetricKind::Counter,
        value,
    }
}

fn gauge<T>(name: &'static str, help: &'static str, value: fn(&T) -> f64) -> MetricDef<T> {
    MetricDef {
        name,
        help,
        kind: MetricKind::Gauge,
        value,
    }
}

fn ms_to_seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

/// All per-volume metric definitions.
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    pub diskstats: Vec<MetricDef<DiskStats>>,
    pub capacity: Vec<MetricDef<Capacity>>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        let diskstats = vec![
            counter(
                "reads_completed_total",
                "Total reads completed successfully.",
                |d: &DiskStats| d.reads as f64,
            ),
            counter(
                "reads_merged_total",
                "Total adjacent reads merged.",
                |d: &DiskStats| d.r_merged as f64,
            ),
            counter("read_bytes_total", "Total bytes read.", |d: &DiskStats| d.read_bytes() as f64),
            counter(
                "read_time_seconds_total",
                "Total seconds spent reading.",
                |d: &DiskStats| ms_to_seconds(d.read_time),
            ),
            counter(
                "writes_completed_total",
                "Total writes completed successfully.",
                |d: &DiskStats| d.writes as f64,
            ),
            counter(
                "writes_merged_total",
                "Total adjacent writes merged.",
                |d: &DiskStats| d.w_merged as f64,
            ),
            counter(
                "write_bytes_total",
                "Total bytes written.",
                |d: &DiskStats| d.write_bytes() as f64,
            ),
            counter(
                "write_time_seconds_total",
                "Total seconds spent writing.",
                |d: &DiskStats| ms_to_seconds(d.write_time),
            ),
            gauge(
                "io_in_progress",
                "I/Os currently in progress.",
                |d: &DiskStats| d.io_in_progress as f64,
            ),
            counter(
                "io_time_seconds_total",
                "Total seconds spent doing I/Os.",
                |d: &DiskStats| ms_to_seconds(d.io_time),
            ),
            counter(
                "weighted_io_time_seconds_total",
                "Total weighted seconds spent doing I/Os.",
                |d: &DiskStats| ms_to_seconds(d.io_weighted_time),
            ),
            counter(
                "discards_completed_total",
                "Total discards completed successfully.",
                |d: &DiskStats| d.discards as f64,
            ),
            counter(
                "discards_merged_total",
                "Total adjacent discards merged.",
                |d: &DiskStats| d.d_merged as f64,
            ),
            counter(
                "discard_bytes_total",
                "Total bytes discarded.",
                |d: &DiskStats| d.discard_bytes() as f64,
            ),
            counter(
                "discard_time_seconds_total",
                "Total seconds spent discarding.",
                |d: &DiskStats| ms_to_seconds(d.discard_time),
            ),
            counter(
                "flushes_completed_total",
                "Total flush requests completed successfully.",
                |d: &DiskStats| d.flushes as f64,
            ),
            counter(
                "flush_time_seconds_total",
                "Total seconds spent flushing.",
                |d: &DiskStats| ms_to_seconds(d.flush_time),
            ),
        ];

        let capacity = vec![
            gauge(
                "capacity_bytes_total",
                "Filesystem size in bytes.",
                |c: &Capacity| c.total_bytes as f64,
            ),
            gauge(
                "capacity_bytes_used",
                "Filesystem bytes in use.",
                |c: &Capacity| c.used_bytes as f64,
            ),
            gauge(
                "capacity_bytes_free",
                "Filesystem bytes free.",
                |c: &Capacity| c.free_bytes as f64,
            ),
            gauge(
                "capacity_inodes_total",
                "Filesystem inode count.",
                |c: &Capacity| c.total_inodes as f64,
            ),
            gauge(
                "capacity_inodes_used",
                "Filesystem inodes in use.",
                |c: &Capacity| c.used_inodes as f64,
            ),
            gauge(
                "capacity_inodes_free",
                "Filesystem inodes free.",
                |c: &Capacity| c.free_inodes as f64,
            ),
        ];

        Self {
            diskstats,
            capacity,
        }
    }
}

impl Default for MetricCatalog {
    fn default() -> Self {
        Self::new()
    }
}
