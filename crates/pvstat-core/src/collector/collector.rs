//! Scrape orchestration.
//!
//! One scrape: discover volumes, read the kernel device counters once, attach
//! kernel device names, then let every [`VolumeCollector`] emit its series
//! for the resulting [`ScrapeSnapshot`] into a fresh [`ScrapeRegistry`].
//! Collectors run in parallel and each fans out one task per volume;
//! everything is joined before the registry is handed back.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::collector::capacity::probe_capacity;
use crate::collector::error::CollectError;
use crate::collector::procfs::{DiskStatsIndex, read_diskstats};
use crate::collector::traits::FileSystem;
use crate::config::ExporterConfig;
use crate::discovery::{DiscoveryError, MultiSourceResolver, VolumeRecord};
use crate::metrics::{MetricCatalog, ScrapeRegistry};

/// Health label of the discovery phase.
pub const DISCOVERY_COLLECTOR: &str = "discovery";

/// Host state shared by all collectors of one scrape.
pub struct ScrapeSnapshot {
    pub volumes: Vec<VolumeRecord>,
    /// `/proc/diskstats`, read once so every consumer sees the same devices.
    pub diskstats: Result<DiskStatsIndex, Arc<CollectError>>,
}

/// Emits one family of per-volume series.
pub trait VolumeCollector: Send + Sync {
    /// Label value for the collector health series.
    fn name(&self) -> &'static str;

    /// Records series for the snapshot's volumes. Volumes this collector has
    /// nothing for are skipped; `Err` means the collector failed as a whole.
    fn update(
        &self,
        snapshot: &ScrapeSnapshot,
        registry: &ScrapeRegistry,
    ) -> Result<(), CollectError>;
}

/// Runs `task` for every volume on its own scoped thread and joins them all.
///
/// A task that panics contributes no result.
fn for_each_volume<R, T>(volumes: &[VolumeRecord], task: T) -> Vec<R>
where
    R: Send,
    T: Fn(&VolumeRecord) -> R + Sync,
{
    let task = &task;
    thread::scope(|s| {
        let handles: Vec<_> = volumes
            .iter()
            .map(|volume| s.spawn(move || task(volume)))
            .collect();
        volumes
            .iter()
            .zip(handles)
            .filter_map(|(volume, handle)| match handle.join() {
                Ok(result) => Some(result),
                Err(_) => {
                    warn!(
                        pv = %volume.pv_name,
                        device = %volume.device_name,
                        "per-volume task panicked"
                    );
                    None
                }
            })
            .collect()
    })
}

/// Per-volume I/O counters from `/proc/diskstats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskstatsCollector;

impl VolumeCollector for DiskstatsCollector {
    fn name(&self) -> &'static str {
        "diskstats"
    }

    fn update(
        &self,
        snapshot: &ScrapeSnapshot,
        registry: &ScrapeRegistry,
    ) -> Result<(), CollectError> {
        let index = snapshot
            .diskstats
            .as_ref()
            .map_err(|e| CollectError::Snapshot(Arc::clone(e)))?;

        let results = for_each_volume(&snapshot.volumes, |volume| {
            let Some(stats) = index.lookup(&volume.device_id, &volume.device_name) else {
                debug!(
                    device = %volume.device_name,
                    device_id = %volume.device_id,
                    "no diskstats entry for volume"
                );
                return Ok(false);
            };
            registry.record_diskstats(volume, stats).map(|()| true)
        });

        let mut matched = 0;
        for result in results {
            if result? {
                matched += 1;
            }
        }
        debug!(volumes = snapshot.volumes.len(), matched, "diskstats collected");
        Ok(())
    }
}

/// Per-volume space and inode usage.
pub struct CapacityCollector<F: ?Sized> {
    fs: Arc<F>,
}

impl<F: FileSystem + ?Sized> CapacityCollector<F> {
    pub fn new(fs: Arc<F>) -> Self {
        Self { fs }
    }
}

impl<F: FileSystem + ?Sized> VolumeCollector for CapacityCollector<F> {
    fn name(&self) -> &'static str {
        "capacity"
    }

    fn update(
        &self,
        snapshot: &ScrapeSnapshot,
        registry: &ScrapeRegistry,
    ) -> Result<(), CollectError> {
        let results = for_each_volume(&snapshot.volumes, |volume| {
            if volume.mount_path.is_empty() {
                return Ok(());
            }
            match probe_capacity(self.fs.as_ref(), Path::new(&volume.mount_path)) {
                Ok(capacity) => registry.record_capacity(volume, &capacity),
                Err(e) => {
                    debug!(error = %e, "skipping volume capacity");
                    Ok(())
                }
            }
        });

        for result in results {
            result?;
        }
        Ok(())
    }
}

/// Sets each volume's device name from the kernel's view of its device id.
///
/// Volumes without an id, or whose id is not in the index, keep their name.
pub fn backfill_device_names(volumes: &mut [VolumeRecord], index: &DiskStatsIndex) {
    for volume in volumes.iter_mut().filter(|v| !v.device_id.is_empty()) {
        if let Some(stats) = index.by_device_id(&volume.device_id) {
            volume.device_name.clone_from(&stats.device);
        }
    }
}

/// Builds a metrics snapshot on demand.
pub struct VolumeExporter<F: ?Sized> {
    fs: Arc<F>,
    resolver: MultiSourceResolver,
    collectors: Vec<Arc<dyn VolumeCollector>>,
    catalog: Arc<MetricCatalog>,
    diskstats_path: PathBuf,
    scrape_timeout: Option<Duration>,
}

impl<F: FileSystem + ?Sized + 'static> VolumeExporter<F> {
    /// Creates an exporter with the diskstats and capacity collectors.
    pub fn new(
        fs: Arc<F>,
        resolver: MultiSourceResolver,
        config: &ExporterConfig,
        catalog: Arc<MetricCatalog>,
    ) -> Self {
        let collectors: Vec<Arc<dyn VolumeCollector>> = vec![
            Arc::new(DiskstatsCollector),
            Arc::new(CapacityCollector::new(Arc::clone(&fs))),
        ];
        Self {
            fs,
            resolver,
            collectors,
            catalog,
            diskstats_path: config.diskstats_path(),
            scrape_timeout: config.scrape_timeout,
        }
    }

    /// Runs one full scrape.
    pub async fn scrape(&self) -> Result<Arc<ScrapeRegistry>, CollectError> {
        let registry = Arc::new(ScrapeRegistry::new(&self.catalog)?);
        let scrape_start = Instant::now();

        let discovery_start = Instant::now();
        let (mut volumes, discovered) = match self.discover().await {
            Ok(volumes) => (volumes, true),
            Err(e) => {
                warn!(error = %e, "volume discovery failed");
                (Vec::new(), false)
            }
        };
        registry.observe_collector(
            DISCOVERY_COLLECTOR,
            discovery_start.elapsed().as_secs_f64(),
            discovered,
        )?;
        registry.set_volumes_discovered(volumes.len());

        let diskstats = read_diskstats(self.fs.as_ref(), &self.diskstats_path).map_err(Arc::new);
        match &diskstats {
            Ok(index) => backfill_device_names(&mut volumes, index),
            Err(e) => debug!(error = %e, "device name backfill skipped"),
        }

        let snapshot = Arc::new(ScrapeSnapshot { volumes, diskstats });
        let mut handles = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            let collector = Arc::clone(collector);
            let snapshot = Arc::clone(&snapshot);
            let registry = Arc::clone(&registry);
            handles.push(tokio::task::spawn_blocking(move || {
                let start = Instant::now();
                let result = collector.update(&snapshot, &registry);
                (collector.name(), start.elapsed(), result)
            }));
        }

        for handle in handles {
            let (name, elapsed, result) = handle.await?;
            if let Err(e) = &result {
                warn!(collector = name, error = %e, "collector failed");
            }
            registry.observe_collector(name, elapsed.as_secs_f64(), result.is_ok())?;
        }

        info!(
            volumes = snapshot.volumes.len(),
            elapsed_ms = scrape_start.elapsed().as_millis() as u64,
            "scrape finished"
        );
        Ok(registry)
    }

    /// Runs one scrape and renders it in the Prometheus text format.
    pub async fn render(&self) -> Result<String, CollectError> {
        Ok(self.scrape().await?.encode()?)
    }

    async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        match self.scrape_timeout {
            Some(limit) => tokio::time::timeout(limit, self.resolver.discover())
                .await
                .unwrap_or(Err(DiscoveryError::Timeout(limit))),
            None => self.resolver.discover().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::device::{device_id, resolve_device};
    use crate::collector::mock::MockFs;
    use crate::collector::procfs::{parse_diskstats, read_mounts};
    use crate::collector::traits::FsUsage;
    use crate::discovery::{KubeletVolumeSource, VolumeSource};
    use async_trait::async_trait;
    use prometheus::proto::MetricFamily;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps a `MockFs`, stalling directory listings and counting table reads.
    struct InstrumentedFs {
        inner: MockFs,
        read_dir_delay: Duration,
        diskstats_reads: AtomicUsize,
    }

    impl InstrumentedFs {
        fn new(inner: MockFs, read_dir_delay: Duration) -> Self {
            Self {
                inner,
                read_dir_delay,
                diskstats_reads: AtomicUsize::new(0),
            }
        }
    }

    impl FileSystem for InstrumentedFs {
        fn read_to_string(&self, path: &Path) -> io::Result<String> {
            if path.ends_with("diskstats") {
                self.diskstats_reads.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.read_to_string(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.inner.is_dir(path)
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            thread::sleep(self.read_dir_delay);
            self.inner.read_dir(path)
        }

        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            self.inner.read_link(path)
        }

        fn device_number(&self, path: &Path) -> io::Result<u64> {
            self.inner.device_number(path)
        }

        fn statvfs(&self, path: &Path) -> io::Result<FsUsage> {
            self.inner.statvfs(path)
        }
    }

    /// Treats every mount table entry as a volume.
    struct MountTableSource {
        fs: Arc<MockFs>,
    }

    #[async_trait]
    impl VolumeSource for MountTableSource {
        fn name(&self) -> &'static str {
            "mounts"
        }

        async fn available(&self) -> bool {
            true
        }

        async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
            let mounts = read_mounts(self.fs.as_ref(), Path::new("/proc/mounts"))?;
            Ok(mounts
                .into_iter()
                .map(|m| {
                    let device = resolve_device(self.fs.as_ref(), &m.device);
                    VolumeRecord {
                        pvc_name: "pvc-1".to_string(),
                        device_id: device_id(self.fs.as_ref(), Path::new(&m.mount_point))
                            .unwrap_or_default(),
                        device_path: device.path,
                        device_name: device.name,
                        raw_device_path: m.device,
                        mount_path: m.mount_point,
                        ..Default::default()
                    }
                })
                .collect())
        }
    }

    struct HangingSource;

    #[async_trait]
    impl VolumeSource for HangingSource {
        fn name(&self) -> &'static str {
            "hanging"
        }

        async fn available(&self) -> bool {
            true
        }

        async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    fn config(timeout: Option<Duration>) -> ExporterConfig {
        ExporterConfig {
            host_proc_path: PathBuf::from("/proc"),
            kubelet_path: PathBuf::from("/var/lib/kubelet"),
            namespaces: Vec::new(),
            discovery: Vec::new(),
            node_name: None,
            scrape_timeout: timeout,
        }
    }

    fn exporter(
        fs: Arc<MockFs>,
        sources: Vec<Box<dyn VolumeSource>>,
        timeout: Option<Duration>,
    ) -> VolumeExporter<MockFs> {
        VolumeExporter::new(
            fs,
            MultiSourceResolver::new(sources),
            &config(timeout),
            Arc::new(MetricCatalog::new()),
        )
    }

    fn value(families: &[MetricFamily], name: &str, device: &str) -> Option<f64> {
        let family = families.iter().find(|f| f.get_name() == name)?;
        let metric = family.get_metric().iter().find(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == "device" && l.get_value() == device)
        })?;
        Some(if metric.has_counter() {
            metric.get_counter().get_value()
        } else {
            metric.get_gauge().get_value()
        })
    }

    fn health(families: &[MetricFamily], collector: &str) -> Option<f64> {
        let family = families.iter().find(|f| f.get_name() == "pvstat_scrape_success")?;
        family
            .get_metric()
            .iter()
            .find(|m| m.get_label()[0].get_value() == collector)
            .map(|m| m.get_gauge().get_value())
    }

    #[tokio::test]
    async fn test_scrape_single_disk_end_to_end() {
        let fs = Arc::new(MockFs::single_disk());
        let source = MountTableSource { fs: Arc::clone(&fs) };
        let exporter = exporter(fs, vec![Box::new(source)], None);

        let families = exporter.scrape().await.unwrap().gather();

        assert_eq!(value(&families, "pvstat_reads_completed_total", "sda1"), Some(100.0));
        assert_eq!(value(&families, "pvstat_read_bytes_total", "sda1"), Some(409_600.0));
        assert_eq!(value(&families, "pvstat_capacity_bytes_free", "sda1"), Some(400_000.0));
        assert_eq!(value(&families, "pvstat_capacity_bytes_used", "sda1"), Some(600_000.0));
        assert_eq!(value(&families, "pvstat_capacity_bytes_total", "sda1"), Some(1_000_000.0));

        assert_eq!(health(&families, "discovery"), Some(1.0));
        assert_eq!(health(&families, "diskstats"), Some(1.0));
        assert_eq!(health(&families, "capacity"), Some(1.0));
    }

    #[tokio::test]
    async fn test_scrape_kubelet_node() {
        let fs = Arc::new(MockFs::kubelet_node());
        let source = KubeletVolumeSource::new(Arc::clone(&fs), "/var/lib/kubelet", "/proc/mounts");
        let exporter = exporter(fs, vec![Box::new(source)], None);

        let text = exporter.render().await.unwrap();
        assert!(text.contains("pvstat_volumes_discovered 2"));

        let families = exporter.scrape().await.unwrap().gather();
        assert_eq!(value(&families, "pvstat_reads_completed_total", "nvme1n1"), Some(88_211.0));
        assert_eq!(value(&families, "pvstat_flushes_completed_total", "nvme1n1"), Some(1_820.0));
        assert_eq!(value(&families, "pvstat_writes_completed_total", "sdb"), Some(3_400.0));
        assert_eq!(
            value(&families, "pvstat_capacity_bytes_total", "sdb"),
            Some((262_144u64 * 4096) as f64)
        );
        // The root disk is not a volume.
        assert_eq!(value(&families, "pvstat_reads_completed_total", "sda1"), None);
    }

    #[tokio::test]
    async fn test_scrape_discovery_failure() {
        let fs = Arc::new(MockFs::single_disk());
        let exporter = exporter(fs, Vec::new(), None);

        let families = exporter.scrape().await.unwrap().gather();
        assert_eq!(health(&families, "discovery"), Some(0.0));
        assert_eq!(health(&families, "diskstats"), Some(1.0));
        assert!(!families.iter().any(|f| f.get_name() == "pvstat_reads_completed_total"));

        let discovered = families
            .iter()
            .find(|f| f.get_name() == "pvstat_volumes_discovered")
            .unwrap();
        assert_eq!(discovered.get_metric()[0].get_gauge().get_value(), 0.0);
    }

    #[tokio::test]
    async fn test_scrape_timeout_counts_as_discovery_failure() {
        let fs = Arc::new(MockFs::single_disk());
        let exporter = exporter(fs, vec![Box::new(HangingSource)], Some(Duration::from_millis(20)));

        let families = exporter.scrape().await.unwrap().gather();
        assert_eq!(health(&families, "discovery"), Some(0.0));
    }

    #[tokio::test]
    async fn test_scrape_timeout_interrupts_blocking_scan() {
        let fs = Arc::new(InstrumentedFs::new(
            MockFs::kubelet_node(),
            Duration::from_millis(1500),
        ));
        let source = KubeletVolumeSource::new(Arc::clone(&fs), "/var/lib/kubelet", "/proc/mounts");
        let exporter = VolumeExporter::new(
            fs,
            MultiSourceResolver::new(vec![Box::new(source)]),
            &config(Some(Duration::from_millis(50))),
            Arc::new(MetricCatalog::new()),
        );

        let start = Instant::now();
        let families = exporter.scrape().await.unwrap().gather();
        assert!(start.elapsed() < Duration::from_millis(1000));
        assert_eq!(health(&families, "discovery"), Some(0.0));
    }

    #[tokio::test]
    async fn test_scrape_reads_diskstats_once() {
        let fs = Arc::new(InstrumentedFs::new(MockFs::kubelet_node(), Duration::ZERO));
        let source = KubeletVolumeSource::new(Arc::clone(&fs), "/var/lib/kubelet", "/proc/mounts");
        let exporter = VolumeExporter::new(
            Arc::clone(&fs),
            MultiSourceResolver::new(vec![Box::new(source)]),
            &config(None),
            Arc::new(MetricCatalog::new()),
        );

        let families = exporter.scrape().await.unwrap().gather();
        assert_eq!(health(&families, "diskstats"), Some(1.0));
        assert_eq!(fs.diskstats_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_for_each_volume_skips_panicked_task() {
        let volumes: Vec<VolumeRecord> = ["sda", "sdb", "sdc"]
            .iter()
            .map(|name| VolumeRecord {
                device_name: name.to_string(),
                ..Default::default()
            })
            .collect();

        let mut names = for_each_volume(&volumes, |volume| {
            if volume.device_name == "sdb" {
                panic!("statvfs hung up");
            }
            volume.device_name.clone()
        });
        names.sort();
        assert_eq!(names, vec!["sda", "sdc"]);
    }

    #[tokio::test]
    async fn test_scrape_without_diskstats() {
        let mut bare = MockFs::new();
        bare.add_file("/proc/mounts", "/dev/sda1 /mnt/pvc-1 ext4 rw\n");
        bare.add_dir("/mnt/pvc-1");
        bare.set_usage(
            "/mnt/pvc-1",
            FsUsage {
                block_size: 1,
                blocks: 10,
                blocks_free: 4,
                files: 0,
                files_free: 0,
            },
        );
        let bare = Arc::new(bare);
        let source = MountTableSource { fs: Arc::clone(&bare) };
        let exporter = exporter(bare, vec![Box::new(source)], None);

        let families = exporter.scrape().await.unwrap().gather();
        assert_eq!(health(&families, "diskstats"), Some(0.0));
        assert_eq!(health(&families, "capacity"), Some(1.0));
        assert_eq!(value(&families, "pvstat_capacity_bytes_used", "sda1"), Some(6.0));
    }

    #[test]
    fn test_backfill_device_names_prefers_kernel_name() {
        let index = DiskStatsIndex::new(parse_diskstats(
            " 253 3 dm-3 1 0 0 0 0 0 0 0 0 0 0\n",
        ));
        let mut volumes = vec![
            VolumeRecord {
                device_name: "vg-data".to_string(),
                device_id: "253:3".to_string(),
                ..Default::default()
            },
            VolumeRecord {
                device_name: "sdz".to_string(),
                device_id: "8:99".to_string(),
                ..Default::default()
            },
            VolumeRecord {
                device_name: "sdb".to_string(),
                ..Default::default()
            },
        ];

        backfill_device_names(&mut volumes, &index);
        assert_eq!(volumes[0].device_name, "dm-3");
        assert_eq!(volumes[1].device_name, "sdz");
        assert_eq!(volumes[2].device_name, "sdb");
    }
}
