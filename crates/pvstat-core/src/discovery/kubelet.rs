//! Volume discovery by scanning kubelet's per-pod volume directories.
//!
//! Layout: `<kubelet>/pods/<pod-uid>/volumes/kubernetes.io~csi/<pv>/{mount, vol_data.json}`.
//! `vol_data.json` is written by kubelet when a CSI volume is set up and
//! names the driver, the volume handle and the owning pod. It does not name
//! the PVC, so records from here carry the PV name as a placeholder.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::collector::device::resolve_device;
use crate::collector::procfs::{MountEntry, find_mount_at, read_mounts};
use crate::collector::traits::FileSystem;
use crate::discovery::{DiscoveryError, VolumeRecord, VolumeSource};

/// Plugin directory of CSI volumes.
pub const CSI_PLUGIN_DIR: &str = "kubernetes.io~csi";
/// Plugin directory of projected volumes (service-account tokens, configmaps).
pub const PROJECTED_PLUGIN_DIR: &str = "kubernetes.io~projected";

/// Metadata side-file of a CSI volume.
pub const VOL_DATA_FILE: &str = "vol_data.json";

/// `vol_data.json` fields this source consumes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolData {
    pub spec_vol_id: String,
    pub driver_name: String,
    pub volume_handle: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub pod_uid: String,
}

/// Parses `vol_data.json`.
///
/// Keys are looked up at the top level first, then one object level down.
pub fn parse_vol_data(content: &str) -> Result<VolData, serde_json::Error> {
    let raw: Map<String, Value> = serde_json::from_str(content)?;

    let get = |key: &str| -> String {
        raw.get(key)
            .and_then(Value::as_str)
            .or_else(|| {
                raw.values()
                    .filter_map(Value::as_object)
                    .find_map(|nested| nested.get(key).and_then(Value::as_str))
            })
            .unwrap_or_default()
            .to_string()
    };

    Ok(VolData {
        spec_vol_id: get("specVolID"),
        driver_name: get("driverName"),
        volume_handle: get("volumeHandle"),
        pod_name: get("kubernetes.io/pod.name"),
        pod_namespace: get("kubernetes.io/pod.namespace"),
        pod_uid: get("kubernetes.io/pod.uid"),
    })
}

/// Discovers volumes from kubelet's on-disk state.
pub struct KubeletVolumeSource<F: ?Sized> {
    fs: Arc<F>,
    kubelet_path: PathBuf,
    mounts_path: PathBuf,
}

impl<F: ?Sized> Clone for KubeletVolumeSource<F> {
    fn clone(&self) -> Self {
        Self {
            fs: Arc::clone(&self.fs),
            kubelet_path: self.kubelet_path.clone(),
            mounts_path: self.mounts_path.clone(),
        }
    }
}

impl<F: FileSystem + ?Sized> KubeletVolumeSource<F> {
    pub fn new(
        fs: Arc<F>,
        kubelet_path: impl Into<PathBuf>,
        mounts_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            kubelet_path: kubelet_path.into(),
            mounts_path: mounts_path.into(),
        }
    }

    fn pods_dir(&self) -> PathBuf {
        self.kubelet_path.join("pods")
    }

    /// Walks every pod directory and collects its CSI volumes.
    pub fn scan(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        let mounts = read_mounts(self.fs.as_ref(), &self.mounts_path)?;

        let pods_dir = self.pods_dir();
        let mut pod_dirs = self
            .fs
            .read_dir(&pods_dir)
            .map_err(|source| DiscoveryError::Scan {
                path: pods_dir.clone(),
                source,
            })?;
        pod_dirs.sort();

        let mut records = Vec::new();
        for pod_dir in pod_dirs {
            if !self.fs.is_dir(&pod_dir) {
                continue;
            }
            let Some(pod_uid) = file_name(&pod_dir) else {
                continue;
            };

            let volumes_dir = pod_dir.join("volumes");
            if !self.fs.is_dir(&volumes_dir) {
                continue;
            }

            let csi_dir = volumes_dir.join(CSI_PLUGIN_DIR);
            if self.fs.is_dir(&csi_dir) {
                records.extend(self.scan_csi_volumes(&pod_uid, &csi_dir, &mounts));
            }
            // Projected volumes are tmpfs-backed and have no block device.
        }

        info!(
            source = self.name_str(),
            volumes = records.len(),
            "kubelet scan finished"
        );
        Ok(records)
    }

    fn scan_csi_volumes(
        &self,
        pod_uid: &str,
        csi_dir: &Path,
        mounts: &[MountEntry],
    ) -> Vec<VolumeRecord> {
        let mut vol_dirs = match self.fs.read_dir(csi_dir) {
            Ok(dirs) => dirs,
            Err(e) => {
                debug!(
                    path = %csi_dir.display(),
                    error = %e,
                    "skipping unreadable CSI directory"
                );
                return Vec::new();
            }
        };
        vol_dirs.sort();

        let mut records = Vec::new();
        for vol_dir in vol_dirs {
            if !self.fs.is_dir(&vol_dir) {
                continue;
            }

            let vol_data_path = vol_dir.join(VOL_DATA_FILE);
            let vol_data = match self
                .fs
                .read_to_string(&vol_data_path)
                .map_err(|e| e.to_string())
                .and_then(|content| parse_vol_data(&content).map_err(|e| e.to_string()))
            {
                Ok(data) => data,
                Err(e) => {
                    debug!(
                        path = %vol_data_path.display(),
                        error = %e,
                        "skipping volume without readable metadata"
                    );
                    continue;
                }
            };

            let mount_path = vol_dir.join("mount").to_string_lossy().into_owned();
            let Some(mount) = find_mount_at(mounts, &mount_path) else {
                debug!(path = %mount_path, "skipping volume that is not mounted");
                continue;
            };

            let device = resolve_device(self.fs.as_ref(), &mount.device);

            records.push(VolumeRecord {
                pvc_name: vol_data.spec_vol_id.clone(),
                pvc_namespace: vol_data.pod_namespace.clone(),
                pv_name: vol_data.spec_vol_id,
                pod_name: vol_data.pod_name,
                pod_namespace: vol_data.pod_namespace,
                pod_uid: pod_uid.to_string(),
                csi_driver: vol_data.driver_name,
                volume_handle: vol_data.volume_handle,
                device_path: device.path,
                device_name: device.name,
                raw_device_path: mount.device.clone(),
                mount_path,
                ..Default::default()
            });
        }
        records
    }

    fn name_str(&self) -> &'static str {
        "kubelet"
    }
}

#[async_trait]
impl<F: FileSystem + ?Sized + 'static> VolumeSource for KubeletVolumeSource<F> {
    fn name(&self) -> &'static str {
        self.name_str()
    }

    async fn available(&self) -> bool {
        self.fs.is_dir(&self.pods_dir())
    }

    /// Runs the scan on the blocking pool so a scrape deadline can abandon it.
    async fn discover(&self) -> Result<Vec<VolumeRecord>, DiscoveryError> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.scan()).await?
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}
