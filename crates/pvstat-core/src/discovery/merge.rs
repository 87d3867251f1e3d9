//! Multi-source resolution: one record per physical device.
//!
//! Sources run one after another in their configured order. Records are keyed
//! by device id, falling back to device name; the first record seen for a key
//! becomes canonical and later records only fill its empty fields.
//!
//! A source that only knows the device name (the kubelet scan) and one that
//! also knows the id (the cluster API) describe the same device under
//! different keys. Before keying, every record carrying both is used to build
//! a name -> id alias table, so a name-only record joins the id-keyed entry.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tracing::{debug, info, warn};

use super::{DiscoveryError, VolumeRecord, VolumeSource};

/// Runs volume sources in priority order and merges their output.
pub struct MultiSourceResolver {
    sources: Vec<Box<dyn VolumeSource>>,
}

impl MultiSourceResolver {
    /// `sources` in priority order, highest first.
    pub fn new(sources: Vec<Box<dyn VolumeSource>>) -> Self {
        Self { sources }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Discovers and merges volumes from every available source.
    ///
    /// Unavailable or failing sources are skipped. Fails only when no source
    /// produced a result at all; an available source that finds nothing is a
    /// success with zero volumes.
    pub async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        let mut batches = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            if !source.available().await {
                debug!(source = source.name(), "volume source unavailable, skipping");
                continue;
            }
            match source.discover().await {
                Ok(records) => {
                    debug!(
                        source = source.name(),
                        volumes = records.len(),
                        "volume source finished"
                    );
                    batches.push(records);
                }
                Err(e) => warn!(source = source.name(), error = %e, "volume source failed"),
            }
        }

        if batches.is_empty() {
            return Err(DiscoveryError::NoSourceSucceeded);
        }

        let merged = merge_records(batches);
        info!(volumes = merged.len(), "volume discovery finished");
        Ok(merged)
    }
}

/// Merges record batches, given in priority order, into one record per device.
///
/// Records with neither a device id nor a device name are dropped. Output
/// order is unspecified.
pub fn merge_records(batches: Vec<Vec<VolumeRecord>>) -> Vec<VolumeRecord> {
    let aliases = alias_table(&batches);
    let mut merged: HashMap<String, VolumeRecord> = HashMap::new();

    for record in batches.into_iter().flatten() {
        let Some(key) = merge_key(&record, &aliases) else {
            debug!(
                pv = %record.pv_name,
                mount = %record.mount_path,
                "dropping volume without device identity"
            );
            continue;
        };

        match merged.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => slot.get_mut().fill_from(&record),
        }
    }

    merged.into_values().collect()
}

/// Device name -> device id, from records that know both. First seen wins.
fn alias_table(batches: &[Vec<VolumeRecord>]) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    for record in batches.iter().flatten() {
        if !record.device_id.is_empty() && !record.device_name.is_empty() {
            aliases
                .entry(record.device_name.clone())
                .or_insert_with(|| record.device_id.clone());
        }
    }
    aliases
}

/// Device id if known (directly or through an alias), else device name.
fn merge_key(record: &VolumeRecord, aliases: &HashMap<String, String>) -> Option<String> {
    if !record.device_id.is_empty() {
        return Some(record.device_id.clone());
    }
    if record.device_name.is_empty() {
        return None;
    }
    Some(
        aliases
            .get(&record.device_name)
            .cloned()
            .unwrap_or_else(|| record.device_name.clone()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn kubelet_record() -> VolumeRecord {
        VolumeRecord {
            pvc_name: "pvc-1b7e".to_string(),
            pvc_namespace: "db".to_string(),
            pv_name: "pvc-1b7e".to_string(),
            pod_name: "postgres-0".to_string(),
            pod_namespace: "db".to_string(),
            pod_uid: "uid-1".to_string(),
            csi_driver: "ebs.csi.aws.com".to_string(),
            volume_handle: "vol-0a1b".to_string(),
            device_path: "/dev/nvme1n1".to_string(),
            device_name: "nvme1n1".to_string(),
            raw_device_path: "/dev/nvme1n1".to_string(),
            mount_path: "/var/lib/kubelet/pods/uid-1/volumes/kubernetes.io~csi/pvc-1b7e/mount"
                .to_string(),
            ..Default::default()
        }
    }

    fn api_record() -> VolumeRecord {
        VolumeRecord {
            pvc_name: "data-postgres-0".to_string(),
            pvc_namespace: "db".to_string(),
            pv_name: "pvc-1b7e".to_string(),
            pod_name: "postgres-0".to_string(),
            pod_namespace: "db".to_string(),
            pod_uid: "uid-1".to_string(),
            storage_class: "gp3".to_string(),
            csi_driver: "ebs.csi.aws.com".to_string(),
            device_path: "/dev/nvme1n1".to_string(),
            device_name: "nvme1n1".to_string(),
            device_id: "259:1".to_string(),
            container_mount_path: "/var/lib/postgresql/data".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_joins_name_only_record_through_alias() {
        let merged = merge_records(vec![vec![kubelet_record()], vec![api_record()]]);
        assert_eq!(merged.len(), 1);

        let rec = &merged[0];
        // Kubelet came first: its fields stay.
        assert_eq!(rec.volume_handle, "vol-0a1b");
        assert!(rec.mount_path.ends_with("/mount"));
        // Placeholder PVC name is replaced, empty fields are filled.
        assert_eq!(rec.pvc_name, "data-postgres-0");
        assert_eq!(rec.storage_class, "gp3");
        assert_eq!(rec.device_id, "259:1");
        assert_eq!(rec.container_mount_path, "/var/lib/postgresql/data");
    }

    #[test]
    fn test_merge_drops_unkeyable_records() {
        let mut unkeyed = kubelet_record();
        unkeyed.device_name.clear();

        let merged = merge_records(vec![vec![unkeyed]]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_merge_keeps_distinct_devices_apart() {
        let mut other = kubelet_record();
        other.device_name = "nvme2n1".to_string();
        other.pv_name = "pvc-other".to_string();

        let merged = merge_records(vec![vec![kubelet_record(), other]]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_never_overwrites_populated_fields() {
        let first = api_record();
        let mut conflicting = api_record();
        conflicting.pvc_name = "other-claim".to_string();
        conflicting.storage_class = "io2".to_string();
        conflicting.pod_name = "intruder".to_string();
        conflicting.volume_handle = "vol-new".to_string();

        let merged = merge_records(vec![vec![first.clone()], vec![conflicting.clone()]]);
        assert_eq!(merged.len(), 1);
        let rec = &merged[0];
        assert_eq!(rec.pvc_name, first.pvc_name);
        assert_eq!(rec.storage_class, first.storage_class);
        assert_eq!(rec.pod_name, first.pod_name);
        assert_eq!(rec.volume_handle, "vol-new");

        // Merging the same input again changes nothing.
        let again = merge_records(vec![vec![rec.clone()], vec![conflicting]]);
        assert_eq!(again, vec![rec.clone()]);
    }

    #[test]
    fn test_merge_order_decides_conflicts() {
        let mut a = api_record();
        a.storage_class = "gp3".to_string();
        let mut b = api_record();
        b.storage_class = "io2".to_string();

        let ab = merge_records(vec![vec![a.clone()], vec![b.clone()]]);
        let ba = merge_records(vec![vec![b], vec![a]]);
        assert_eq!(ab[0].storage_class, "gp3");
        assert_eq!(ba[0].storage_class, "io2");
    }

    #[test]
    fn test_merge_alias_first_seen_wins() {
        let mut stale = api_record();
        stale.device_id = "8:0".to_string();
        stale.pv_name = "pvc-stale".to_string();

        let merged = merge_records(vec![
            vec![kubelet_record()],
            vec![api_record(), stale],
        ]);
        // Kubelet record joins 259:1 (first alias), the stale one stays apart.
        assert_eq!(merged.len(), 2);
        let joined = merged.iter().find(|r| r.device_id == "259:1").unwrap();
        assert_eq!(joined.volume_handle, "vol-0a1b");
    }

    struct StaticSource {
        name: &'static str,
        available: bool,
        result: Option<Vec<VolumeRecord>>,
        discover_calls: Arc<AtomicUsize>,
    }

    impl StaticSource {
        fn new(name: &'static str, result: Option<Vec<VolumeRecord>>) -> Self {
            Self {
                name,
                available: true,
                result,
                discover_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl VolumeSource for StaticSource {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn available(&self) -> bool {
            self.available
        }

        async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
            self.discover_calls.fetch_add(1, Ordering::SeqCst);
            self.result
                .clone()
                .ok_or(DiscoveryError::NoSourceSucceeded)
        }
    }

    #[tokio::test]
    async fn test_resolver_skips_unavailable_and_failing_sources() {
        let mut offline = StaticSource::new("offline", Some(vec![api_record()]));
        offline.available = false;
        let offline_calls = Arc::clone(&offline.discover_calls);

        let resolver = MultiSourceResolver::new(vec![
            Box::new(offline),
            Box::new(StaticSource::new("broken", None)),
            Box::new(StaticSource::new("kubelet", Some(vec![kubelet_record()]))),
        ]);
        assert_eq!(resolver.source_names(), vec!["offline", "broken", "kubelet"]);

        let records = resolver.discover().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device_name, "nvme1n1");
        assert_eq!(records[0].device_id, "");
        assert_eq!(offline_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_resolver_fails_when_nothing_succeeds() {
        let resolver = MultiSourceResolver::new(vec![Box::new(StaticSource::new("broken", None))]);
        assert!(matches!(
            resolver.discover().await,
            Err(DiscoveryError::NoSourceSucceeded)
        ));

        let empty = MultiSourceResolver::new(Vec::new());
        assert!(empty.is_empty());
        assert!(empty.discover().await.is_err());
    }

    #[tokio::test]
    async fn test_resolver_empty_source_is_success() {
        let resolver = MultiSourceResolver::new(vec![Box::new(StaticSource::new(
            "kubelet",
            Some(Vec::new()),
        ))]);
        assert!(resolver.discover().await.unwrap().is_empty());
    }
}
