//! Exporter configuration, resolved once at startup.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::collector::traits::FileSystem;

/// Host `/proc` as seen from a container with the host root mounted at `/host`.
pub const HOST_PROC_PATH: &str = "/host/proc";
pub const PROC_PATH: &str = "/proc";

/// Kubelet root candidates, probed in order.
pub const KUBELET_PATHS: [&str; 2] = ["/host/var/lib/kubelet", "/var/lib/kubelet"];

/// A way of discovering volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryMethod {
    /// Scan kubelet's on-disk volume directories.
    Kubelet,
    /// Query the cluster API.
    K8sApi,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Kubelet => "kubelet",
            DiscoveryMethod::K8sApi => "k8sapi",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown discovery method '{0}' (expected kubelet or k8sapi)")]
pub struct UnknownDiscoveryMethod(pub String);

impl FromStr for DiscoveryMethod {
    type Err = UnknownDiscoveryMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // "csi" is the historical name of the kubelet scan.
            "kubelet" | "csi" => Ok(DiscoveryMethod::Kubelet),
            "k8sapi" | "api" => Ok(DiscoveryMethod::K8sApi),
            _ => Err(UnknownDiscoveryMethod(s.trim().to_string())),
        }
    }
}

/// Default discovery order: the local scan first, then the API.
pub const DEFAULT_DISCOVERY: [DiscoveryMethod; 2] =
    [DiscoveryMethod::Kubelet, DiscoveryMethod::K8sApi];

/// Everything the core needs to know about the host and the cluster.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub host_proc_path: PathBuf,
    pub kubelet_path: PathBuf,
    /// Namespaces to discover in; empty means all.
    pub namespaces: Vec<String>,
    /// Discovery methods in priority order.
    pub discovery: Vec<DiscoveryMethod>,
    /// Explicit node name.
    pub node_name: Option<String>,
    /// Deadline for volume discovery in one scrape.
    pub scrape_timeout: Option<Duration>,
}

impl ExporterConfig {
    /// Builds a config with paths detected on the local host.
    pub fn detect<F: FileSystem + ?Sized>(fs: &F) -> Self {
        Self {
            host_proc_path: detect_proc_path(fs),
            kubelet_path: detect_kubelet_path(fs),
            namespaces: Vec::new(),
            discovery: DEFAULT_DISCOVERY.to_vec(),
            node_name: None,
            scrape_timeout: None,
        }
    }

    pub fn diskstats_path(&self) -> PathBuf {
        self.host_proc_path.join("diskstats")
    }

    pub fn mounts_path(&self) -> PathBuf {
        self.host_proc_path.join("mounts")
    }
}

/// `/host/proc` when the host's proc is mounted there, else `/proc`.
pub fn detect_proc_path<F: FileSystem + ?Sized>(fs: &F) -> PathBuf {
    if fs.exists(&Path::new(HOST_PROC_PATH).join("diskstats")) {
        PathBuf::from(HOST_PROC_PATH)
    } else {
        PathBuf::from(PROC_PATH)
    }
}

/// First kubelet root whose `pods/` directory exists, else the host-mounted one.
pub fn detect_kubelet_path<F: FileSystem + ?Sized>(fs: &F) -> PathBuf {
    KUBELET_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| fs.exists(&p.join("pods")))
        .unwrap_or_else(|| PathBuf::from(KUBELET_PATHS[0]))
}

/// Trims items and drops empty ones, keeping order and the first of duplicates.
pub fn normalize_list<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.as_ref().trim();
        if !item.is_empty() && !out.iter().any(|x| x == item) {
            out.push(item.to_string());
        }
    }
    out
}
