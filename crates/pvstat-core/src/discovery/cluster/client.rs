//! Read-only access to the Kubernetes API server.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::trace;

use super::types::{Node, ObjectList, PersistentVolume, PersistentVolumeClaim, Pod};

/// Where the kubelet mounts the pod's service-account credentials.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Error type for cluster API access.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT` are not set.
    #[error("not running in a kubernetes cluster")]
    NotInCluster,

    #[error("failed to read {}: {source}", .path.display())]
    Credentials { path: PathBuf, source: io::Error },

    #[error("invalid in-cluster configuration: {0}")]
    Config(String),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// The API calls the cluster volume source needs.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// Pods scheduled to `node_name`, in `namespace` or in all namespaces.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        node_name: &str,
    ) -> Result<Vec<Pod>, ClusterError>;

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError>;

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>, ClusterError>;
}

/// API client configured from the pod's service account.
#[derive(Debug, Clone)]
pub struct InClusterClient {
    http: reqwest::Client,
    base_url: String,
    token_path: PathBuf,
}

impl InClusterClient {
    /// Builds a client from the standard in-cluster environment and the
    /// mounted service-account CA bundle.
    pub fn from_env() -> Result<Self, ClusterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").unwrap_or_default();
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_default();
        if host.is_empty() || port.is_empty() {
            return Err(ClusterError::NotInCluster);
        }
        Self::with_service_account(&api_base_url(&host, &port), Path::new(SERVICE_ACCOUNT_DIR))
    }

    /// Builds a client for `base_url` using credentials from `sa_dir`.
    pub fn with_service_account(base_url: &str, sa_dir: &Path) -> Result<Self, ClusterError> {
        let token_path = sa_dir.join("token");
        // Fail early; the token itself is re-read per request since it rotates.
        read_file(&token_path)?;

        let ca_path = sa_dir.join("ca.crt");
        let ca = std::fs::read(&ca_path).map_err(|source| ClusterError::Credentials {
            path: ca_path.clone(),
            source,
        })?;
        let cert = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| ClusterError::Config(format!("{}: {}", ca_path.display(), e)))?;

        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(format!("pvstat/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClusterError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token_path,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClusterError> {
        let url = format!("{}{}", self.base_url, path);
        let token = read_file(&self.token_path)?;
        trace!(url = %url, "cluster API request");

        let response = self
            .http
            .get(&url)
            .query(query)
            .bearer_auth(token.trim())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| ClusterError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClusterError::Status { url, status });
        }

        response
            .json::<T>()
            .await
            .map_err(|source| ClusterError::Decode { url, source })
    }
}

#[async_trait]
impl ClusterClient for InClusterClient {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.get_json(&format!("/api/v1/nodes/{}", name), &[]).await
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        node_name: &str,
    ) -> Result<Vec<Pod>, ClusterError> {
        let path = match namespace {
            Some(ns) => format!("/api/v1/namespaces/{}/pods", ns),
            None => "/api/v1/pods".to_string(),
        };
        let selector = format!("spec.nodeName={}", node_name);
        let list: ObjectList<Pod> = self
            .get_json(&path, &[("fieldSelector", selector.as_str())])
            .await?;
        Ok(list.items)
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PersistentVolumeClaim, ClusterError> {
        self.get_json(
            &format!(
                "/api/v1/namespaces/{}/persistentvolumeclaims/{}",
                namespace, name
            ),
            &[],
        )
        .await
    }

    async fn list_pvs(&self) -> Result<Vec<PersistentVolume>, ClusterError> {
        let list: ObjectList<PersistentVolume> =
            self.get_json("/api/v1/persistentvolumes", &[]).await?;
        Ok(list.items)
    }
}

/// `https://host:port`, bracketing IPv6 literals.
fn api_base_url(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

fn read_file(path: &Path) -> Result<String, ClusterError> {
    std::fs::read_to_string(path).map_err(|source| ClusterError::Credentials {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_base_url() {
        assert_eq!(api_base_url("10.96.0.1", "443"), "https://10.96.0.1:443");
        assert_eq!(api_base_url("fd00::1", "443"), "https://[fd00::1]:443");
        assert_eq!(api_base_url("[fd00::1]", "6443"), "https://[fd00::1]:6443");
    }

    #[test]
    fn test_missing_service_account() {
        let dir = tempfile::tempdir().unwrap();
        let err = InClusterClient::with_service_account("https://10.96.0.1:443", dir.path())
            .unwrap_err();
        assert!(matches!(err, ClusterError::Credentials { .. }));
    }

    #[test]
    fn test_missing_ca_bundle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "eyJhbGciOi\n").unwrap();

        let err = InClusterClient::with_service_account("https://10.96.0.1:443", dir.path())
            .unwrap_err();
        match err {
            ClusterError::Credentials { path, .. } => assert!(path.ends_with("ca.crt")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
