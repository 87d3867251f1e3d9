//! Volume discovery: which persistent volumes are mounted on this node, and
//! which kernel block device backs each of them.
//!
//! Each [`VolumeSource`] yields best-effort [`VolumeRecord`]s from one place
//! (kubelet's on-disk volume directories, the cluster API). The
//! [`MultiSourceResolver`] runs the sources in priority order and merges
//! their records into one record per physical device.

pub mod cluster;
pub mod kubelet;
pub mod merge;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::collector::error::CollectError;
use crate::collector::traits::FileSystem;
use crate::config::{DiscoveryMethod, ExporterConfig};

pub use cluster::{ClusterClient, ClusterError, ClusterVolumeSource, InClusterClient};
pub use kubelet::KubeletVolumeSource;
pub use merge::{MultiSourceResolver, merge_records};

/// Everything known about one mounted persistent volume.
///
/// Empty strings mean "unknown".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeRecord {
    pub pvc_name: String,
    pub pvc_namespace: String,
    pub pv_name: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,

    pub storage_class: String,
    pub csi_driver: String,
    /// CSI volume handle, usually the cloud provider's volume id.
    pub volume_handle: String,

    /// Device path after following symlinks (`/dev/nvme1n1`).
    pub device_path: String,
    /// Kernel device name (`nvme1n1`).
    pub device_name: String,
    /// Kernel device id (`"259:1"`).
    pub device_id: String,
    /// Device spec exactly as it appears in the mount table.
    pub raw_device_path: String,
    /// Host path the volume is mounted at.
    pub mount_path: String,
    /// Path the volume is mounted at inside the pod's container.
    pub container_mount_path: String,
}

impl VolumeRecord {
    /// A PVC name that merely echoes the PV name is a guess, not data.
    pub fn has_placeholder_pvc_name(&self) -> bool {
        self.pvc_name.is_empty() || self.pvc_name == self.pv_name
    }

    /// Copies every field of `other` into `self` where `self` has nothing.
    ///
    /// Populated fields are never overwritten, except a placeholder PVC name.
    pub fn fill_from(&mut self, other: &VolumeRecord) {
        if self.has_placeholder_pvc_name() && !other.pvc_name.is_empty() {
            self.pvc_name.clone_from(&other.pvc_name);
        }

        let fields: [(&mut String, &String); 14] = [
            (&mut self.pvc_namespace, &other.pvc_namespace),
            (&mut self.pv_name, &other.pv_name),
            (&mut self.pod_name, &other.pod_name),
            (&mut self.pod_namespace, &other.pod_namespace),
            (&mut self.pod_uid, &other.pod_uid),
            (&mut self.storage_class, &other.storage_class),
            (&mut self.csi_driver, &other.csi_driver),
            (&mut self.volume_handle, &other.volume_handle),
            (&mut self.device_path, &other.device_path),
            (&mut self.device_name, &other.device_name),
            (&mut self.device_id, &other.device_id),
            (&mut self.raw_device_path, &other.raw_device_path),
            (&mut self.mount_path, &other.mount_path),
            (&mut self.container_mount_path, &other.container_mount_path),
        ];
        for (dst, src) in fields {
            if dst.is_empty() && !src.is_empty() {
                dst.clone_from(src);
            }
        }
    }
}

/// Error type for a failed discovery pass.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The mount table could not be read.
    #[error("mount table: {0}")]
    Mounts(#[from] CollectError),

    /// A directory the source depends on could not be listed.
    #[error("failed to scan {}: {source}", .path.display())]
    Scan { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Every configured source was unavailable or failed.
    #[error("no volume source succeeded")]
    NoSourceSucceeded,

    #[error("discovery timed out after {0:?}")]
    Timeout(Duration),

    /// A source's blocking host scan panicked or was cancelled.
    #[error("discovery task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A place volume records can be discovered from.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Cheap feasibility probe. A source that is not available is skipped
    /// for this pass without an error.
    async fn available(&self) -> bool;

    /// Lists volumes. Unreadable individual items are skipped; `Err` means
    /// the whole source failed for this pass.
    async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError>;
}

/// Builds the configured sources in priority order.
///
/// A cluster source whose in-cluster configuration cannot be loaded is
/// logged and left out.
pub fn build_sources<F>(config: &ExporterConfig, fs: Arc<F>) -> Vec<Box<dyn VolumeSource>>
where
    F: FileSystem + 'static,
{
    let mut sources: Vec<Box<dyn VolumeSource>> = Vec::with_capacity(config.discovery.len());

    for method in &config.discovery {
        match method {
            DiscoveryMethod::Kubelet => {
                sources.push(Box::new(KubeletVolumeSource::new(
                    Arc::clone(&fs),
                    &config.kubelet_path,
                    config.mounts_path(),
                )));
            }
            DiscoveryMethod::K8sApi => match InClusterClient::from_env() {
                Ok(client) => {
                    let node_name =
                        cluster::detect_node_name(fs.as_ref(), config.node_name.as_deref());
                    info!(node = %node_name, "cluster API discovery enabled");
                    sources.push(Box::new(ClusterVolumeSource::new(
                        Arc::clone(&fs),
                        client,
                        node_name,
                        &config.kubelet_path,
                        config.mounts_path(),
                        config.namespaces.clone(),
                    )));
                }
                Err(e) => warn!(error = %e, "cluster API discovery disabled"),
            },
        }
    }

    sources
}
