//! Volume discovery through the Kubernetes API.
//!
//! Lists the pods scheduled to this node, follows each PVC-backed pod volume
//! to its claim and bound PV, then finds the volume's kubelet mount directory
//! on the host and resolves the block device behind it. This is the only
//! source that knows real PVC names and storage classes.
//!
//! API calls run on the async runtime; the host-side lookups for all claimed
//! volumes run afterwards as one blocking task.

pub mod client;
pub mod node;
pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::collector::device::{device_id, resolve_device};
use crate::collector::procfs::{find_mount_at, read_mounts};
use crate::collector::traits::FileSystem;
use crate::discovery::kubelet::{CSI_PLUGIN_DIR, PROJECTED_PLUGIN_DIR};
use crate::discovery::{DiscoveryError, VolumeRecord, VolumeSource};

pub use client::{ClusterClient, ClusterError, InClusterClient};
pub use node::{detect_node_name, resolve_node_name};
use types::{ObjectReference, PersistentVolume, Pod, Volume};

/// Storage metadata taken from a bound PV object.
#[derive(Debug, Clone, Default)]
struct PvMeta {
    claim: ObjectReference,
    storage_class: String,
    csi_driver: String,
    volume_handle: String,
}

impl PvMeta {
    /// Bound PVs only; a PV without a claim reference describes no claim.
    fn bound(pv: &PersistentVolume) -> Option<Self> {
        let claim = pv.spec.claim_ref.clone()?;
        let csi = pv.spec.csi.as_ref();
        Some(Self {
            claim,
            storage_class: pv.spec.storage_class_name.clone(),
            csi_driver: csi.map(|c| c.driver.clone()).unwrap_or_default(),
            volume_handle: csi.map(|c| c.volume_handle.clone()).unwrap_or_default(),
        })
    }

    fn is_bound_to(&self, namespace: &str, claim_name: &str) -> bool {
        self.claim.namespace == namespace && self.claim.name == claim_name
    }
}

/// A PVC-backed pod volume whose cluster identity is known but whose host
/// mount has not been looked up yet.
#[derive(Debug, Clone)]
struct ClaimedVolume {
    record: VolumeRecord,
    volume_name: String,
}

/// Discovers volumes by querying the cluster API.
pub struct ClusterVolumeSource<F: ?Sized, C> {
    fs: Arc<F>,
    client: C,
    node_name: String,
    kubelet_path: PathBuf,
    mounts_path: PathBuf,
    /// Namespaces to look at; empty means all.
    namespaces: Vec<String>,
}

impl<F, C> ClusterVolumeSource<F, C>
where
    F: FileSystem + ?Sized,
    C: ClusterClient,
{
    pub fn new(
        fs: Arc<F>,
        client: C,
        node_name: impl Into<String>,
        kubelet_path: impl Into<PathBuf>,
        mounts_path: impl Into<PathBuf>,
        namespaces: Vec<String>,
    ) -> Self {
        Self {
            fs,
            client,
            node_name: node_name.into(),
            kubelet_path: kubelet_path.into(),
            mounts_path: mounts_path.into(),
            namespaces,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    async fn pods_on_node(&self) -> Result<Vec<Pod>, ClusterError> {
        if self.namespaces.is_empty() {
            return self.client.list_pods(None, &self.node_name).await;
        }

        let mut pods = Vec::new();
        for ns in &self.namespaces {
            match self.client.list_pods(Some(ns), &self.node_name).await {
                Ok(list) => pods.extend(list),
                Err(e) => warn!(namespace = %ns, error = %e, "failed to list pods"),
            }
        }
        Ok(pods)
    }

    async fn pv_index(&self) -> HashMap<String, PvMeta> {
        match self.client.list_pvs().await {
            Ok(pvs) => pvs
                .iter()
                .filter_map(|pv| Some((pv.metadata.name.clone(), PvMeta::bound(pv)?)))
                .collect(),
            Err(e) => {
                warn!(
                    error = %e,
                    "failed to list persistent volumes, storage metadata unavailable"
                );
                HashMap::new()
            }
        }
    }

    /// Follows a pod volume to its claim and PV.
    async fn claim_volume(
        &self,
        pod: &Pod,
        volume: &Volume,
        claim_name: &str,
        pvs: &HashMap<String, PvMeta>,
    ) -> Option<ClaimedVolume> {
        let namespace = &pod.metadata.namespace;

        let pvc = match self.client.get_pvc(namespace, claim_name).await {
            Ok(pvc) => pvc,
            Err(e) => {
                debug!(
                    namespace = %namespace,
                    pvc = claim_name,
                    error = %e,
                    "skipping unreadable claim"
                );
                return None;
            }
        };
        let pv_name = pvc.spec.volume_name;
        if pv_name.is_empty() {
            debug!(namespace = %namespace, pvc = claim_name, "skipping unbound claim");
            return None;
        }

        let meta = match pvs.get(&pv_name) {
            Some(meta) if meta.is_bound_to(namespace, claim_name) => meta.clone(),
            Some(meta) => {
                debug!(
                    pv = %pv_name,
                    claim = %format!("{}/{}", meta.claim.namespace, meta.claim.name),
                    "persistent volume is bound to another claim, ignoring its metadata"
                );
                PvMeta::default()
            }
            None => PvMeta::default(),
        };
        let storage_class = if meta.storage_class.is_empty() {
            pvc.spec.storage_class_name.unwrap_or_default()
        } else {
            meta.storage_class
        };

        Some(ClaimedVolume {
            record: VolumeRecord {
                pvc_name: claim_name.to_string(),
                pvc_namespace: namespace.clone(),
                pv_name,
                pod_name: pod.metadata.name.clone(),
                pod_namespace: namespace.clone(),
                pod_uid: pod.metadata.uid.clone(),
                storage_class,
                csi_driver: meta.csi_driver,
                volume_handle: meta.volume_handle,
                container_mount_path: pod
                    .container_mount_path(&volume.name)
                    .unwrap_or_default()
                    .to_string(),
                ..Default::default()
            },
            volume_name: volume.name.clone(),
        })
    }
}

/// Host directory kubelet mounted the volume at.
///
/// CSI volumes live under the PV name; the pod volume name and the projected
/// plugin directory are tried after that.
fn kubelet_mount_dir<F: FileSystem + ?Sized>(
    fs: &F,
    kubelet_path: &Path,
    pod_uid: &str,
    pv_name: &str,
    volume_name: &str,
) -> Option<PathBuf> {
    let volumes_dir = kubelet_path.join("pods").join(pod_uid).join("volumes");

    [
        volumes_dir.join(CSI_PLUGIN_DIR).join(pv_name).join("mount"),
        volumes_dir.join(CSI_PLUGIN_DIR).join(volume_name).join("mount"),
        volumes_dir.join(PROJECTED_PLUGIN_DIR).join(volume_name),
    ]
    .into_iter()
    .find(|p| fs.exists(p))
}

/// Attaches mount and device identity to claimed volumes, dropping the ones
/// that are not mounted on this host.
fn locate_volumes<F: FileSystem + ?Sized>(
    fs: &F,
    kubelet_path: &Path,
    mounts_path: &Path,
    claimed: Vec<ClaimedVolume>,
) -> Result<Vec<VolumeRecord>, DiscoveryError> {
    let mounts = read_mounts(fs, mounts_path)?;

    let mut records = Vec::with_capacity(claimed.len());
    for ClaimedVolume {
        mut record,
        volume_name,
    } in claimed
    {
        let Some(mount_dir) =
            kubelet_mount_dir(fs, kubelet_path, &record.pod_uid, &record.pv_name, &volume_name)
        else {
            debug!(
                pod = %record.pod_name,
                volume = %volume_name,
                pvc = %record.pvc_name,
                "no kubelet mount directory"
            );
            continue;
        };
        let mount_path = mount_dir.to_string_lossy().into_owned();

        let Some(mount) = find_mount_at(&mounts, &mount_path) else {
            debug!(path = %mount_path, "volume directory is not mounted");
            continue;
        };

        let device = resolve_device(fs, &mount.device);
        record.device_id = device_id(fs, &mount_dir).unwrap_or_else(|e| {
            debug!(error = %e, "device id unavailable");
            String::new()
        });
        record.device_path = device.path;
        record.device_name = device.name;
        record.raw_device_path = mount.device.clone();
        record.mount_path = mount_path;

        debug!(
            pvc = %format!("{}/{}", record.pvc_namespace, record.pvc_name),
            pv = %record.pv_name,
            device_id = %record.device_id,
            "resolved volume"
        );
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl<F, C> VolumeSource for ClusterVolumeSource<F, C>
where
    F: FileSystem + ?Sized + 'static,
    C: ClusterClient + 'static,
{
    fn name(&self) -> &'static str {
        "k8sapi"
    }

    async fn available(&self) -> bool {
        if self.node_name.is_empty() {
            debug!(source = self.name(), "node name not detected");
            return false;
        }
        match self.client.get_node(&self.node_name).await {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    source = self.name(),
                    node = %self.node_name,
                    error = %e,
                    "cannot fetch node"
                );
                false
            }
        }
    }

    async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        let pods = self.pods_on_node().await?;
        let pvs = self.pv_index().await;

        let mut claimed = Vec::new();
        for pod in &pods {
            for volume in &pod.spec.volumes {
                let Some(claim) = &volume.persistent_volume_claim else {
                    continue;
                };
                if let Some(c) = self.claim_volume(pod, volume, &claim.claim_name, &pvs).await {
                    claimed.push(c);
                }
            }
        }

        let fs = Arc::clone(&self.fs);
        let kubelet_path = self.kubelet_path.clone();
        let mounts_path = self.mounts_path.clone();
        let records = tokio::task::spawn_blocking(move || {
            locate_volumes(fs.as_ref(), &kubelet_path, &mounts_path, claimed)
        })
        .await??;

        info!(
            source = self.name(),
            node = %self.node_name,
            pods = pods.len(),
            volumes = records.len(),
            "cluster discovery finished"
        );
        Ok(records)
    }
}
