//! Per-scrape Prometheus registry.
//!
//! A new registry is built for every scrape, so series for volumes that
//! disappeared since the last scrape are never exported.

use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};

use super::{MetricCatalog, MetricDef, MetricKind, METRIC_PREFIX, VOLUME_LABELS, volume_labels};
use crate::collector::capacity::Capacity;
use crate::collector::procfs::DiskStats;
use crate::discovery::VolumeRecord;

#[derive(Clone)]
enum Family {
    Counter(CounterVec),
    Gauge(GaugeVec),
}

impl Family {
    fn new<T>(def: &MetricDef<T>) -> Result<Self, prometheus::Error> {
        let opts = Opts::new(def.full_name(), def.help);
        Ok(match def.kind {
            MetricKind::Counter => Family::Counter(CounterVec::new(opts, &VOLUME_LABELS)?),
            MetricKind::Gauge => Family::Gauge(GaugeVec::new(opts, &VOLUME_LABELS)?),
        })
    }

    fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        match self {
            Family::Counter(c) => registry.register(Box::new(c.clone())),
            Family::Gauge(g) => registry.register(Box::new(g.clone())),
        }
    }

    fn set(&self, labels: &[&str], value: f64) -> Result<(), prometheus::Error> {
        match self {
            Family::Counter(c) => {
                let counter = c.get_metric_with_label_values(labels)?;
                // Absolute kernel counter, not an increment.
                counter.reset();
                counter.inc_by(value);
            }
            Family::Gauge(g) => g.get_metric_with_label_values(labels)?.set(value),
        }
        Ok(())
    }
}

struct Families<T> {
    entries: Vec<(fn(&T) -> f64, Family)>,
}

impl<T> Families<T> {
    fn new(defs: &[MetricDef<T>], registry: &Registry) -> Result<Self, prometheus::Error> {
        let mut entries = Vec::with_capacity(defs.len());
        for def in defs {
            let family = Family::new(def)?;
            family.register(registry)?;
            entries.push((def.value, family));
        }
        Ok(Self { entries })
    }

    fn record(&self, labels: &[&str], source: &T) -> Result<(), prometheus::Error> {
        for (value, family) in &self.entries {
            family.set(labels, value(source))?;
        }
        Ok(())
    }
}

/// Registry and metric handles for one scrape.
pub struct ScrapeRegistry {
    registry: Registry,
    diskstats: Families<DiskStats>,
    capacity: Families<Capacity>,
    scrape_duration: GaugeVec,
    scrape_success: GaugeVec,
    volumes_discovered: Gauge,
}

impl ScrapeRegistry {
    pub fn new(catalog: &MetricCatalog) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let diskstats = Families::new(&catalog.diskstats, &registry)?;
        let capacity = Families::new(&catalog.capacity, &registry)?;

        let scrape_duration = GaugeVec::new(
            Opts::new(
                format!("{}scrape_duration_seconds", METRIC_PREFIX),
                "Duration of a collector's part of the scrape.",
            ),
            &["collector"],
        )?;
        let scrape_success = GaugeVec::new(
            Opts::new(
                format!("{}scrape_success", METRIC_PREFIX),
                "Whether a collector succeeded (1) or failed (0).",
            ),
            &["collector"],
        )?;
        let volumes_discovered = Gauge::new(
            format!("{}volumes_discovered", METRIC_PREFIX),
            "Number of volumes found by discovery.",
        )?;

        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(scrape_success.clone()))?;
        registry.register(Box::new(volumes_discovered.clone()))?;

        Ok(Self {
            registry,
            diskstats,
            capacity,
            scrape_duration,
            scrape_success,
            volumes_discovered,
        })
    }

    pub fn record_diskstats(
        &self,
        volume: &VolumeRecord,
        stats: &DiskStats,
    ) -> Result<(), prometheus::Error> {
        self.diskstats.record(&volume_labels(volume), stats)
    }

    pub fn record_capacity(
        &self,
        volume: &VolumeRecord,
        capacity: &Capacity,
    ) -> Result<(), prometheus::Error> {
        self.capacity.record(&volume_labels(volume), capacity)
    }

    /// Records how long a collector took and whether it succeeded.
    pub fn observe_collector(
        &self,
        collector: &str,
        seconds: f64,
        success: bool,
    ) -> Result<(), prometheus::Error> {
        self.scrape_duration
            .get_metric_with_label_values(&[collector])?
            .set(seconds);
        self.scrape_success
            .get_metric_with_label_values(&[collector])?
            .set(if success { 1.0 } else { 0.0 });
        Ok(())
    }

    pub fn set_volumes_discovered(&self, count: usize) {
        self.volumes_discovered.set(count as f64);
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Renders the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
