//! pvstatd - per-volume storage metrics exporter for Kubernetes nodes.
//!
//! Serves Prometheus metrics for every persistent volume mounted on the node,
//! labeled with the PVC, PV and pod using it. All state is rebuilt on each
//! scrape.

mod handlers;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::compression::CompressionLayer;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use pvstat_core::collector::{FileSystem, RealFs, VolumeExporter};
use pvstat_core::config::{
    DiscoveryMethod, ExporterConfig, detect_kubelet_path, detect_proc_path, normalize_list,
};
use pvstat_core::discovery::{MultiSourceResolver, build_sources};
use pvstat_core::metrics::MetricCatalog;

use crate::handlers::AppState;

/// Per-volume storage metrics exporter for Kubernetes nodes.
#[derive(Parser, Debug)]
#[command(name = "pvstatd", version = pvstat_core::VERSION)]
struct Args {
    /// Address to serve metrics on.
    #[arg(long, env = "PVSTAT_LISTEN_ADDR", default_value = "0.0.0.0:6060")]
    listen: SocketAddr,

    /// HTTP path metrics are served at.
    #[arg(long, env = "PVSTAT_METRICS_PATH", default_value = "/metrics")]
    metrics_path: String,

    /// Path to the host's /proc. Detected when unset.
    #[arg(long, env = "PVSTAT_HOST_PROC_PATH", value_name = "PATH")]
    host_proc_path: Option<PathBuf>,

    /// Kubelet root directory. Detected when unset.
    #[arg(long, env = "PVSTAT_KUBELET_PATH", value_name = "PATH")]
    kubelet_path: Option<PathBuf>,

    /// Comma-separated namespaces to discover volumes in. Empty means all.
    #[arg(long, env = "PVSTAT_NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Comma-separated discovery methods in priority order (kubelet, k8sapi).
    #[arg(
        long,
        env = "PVSTAT_DISCOVERY_METHODS",
        value_delimiter = ',',
        default_value = "kubelet,k8sapi"
    )]
    discovery: Vec<String>,

    /// Name of this node. Falls back to the downward-API file, then hostname.
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Deadline for volume discovery per scrape, in seconds. 0 disables it.
    #[arg(long, env = "PVSTAT_SCRAPE_TIMEOUT", default_value = "0", value_name = "SECONDS")]
    scrape_timeout: u64,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pvstatd={}", level).parse()?)
        .add_directive(format!("pvstat_core={}", level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

/// Parses the discovery list, dropping empty items and duplicates.
fn parse_discovery(items: &[String]) -> Result<Vec<DiscoveryMethod>> {
    let mut methods = Vec::new();
    for item in normalize_list(items) {
        let method: DiscoveryMethod = item.parse()?;
        if !methods.contains(&method) {
            methods.push(method);
        }
    }
    Ok(methods)
}

/// Health probe routes served next to the metrics endpoint.
const PROBE_PATHS: [&str; 2] = ["/healthz", "/readyz"];

/// Metrics path with a leading slash. Must not shadow a health probe route.
fn metrics_path(path: &str) -> Result<String> {
    let path = path.trim();
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    if PROBE_PATHS.contains(&path.as_str()) {
        bail!("metrics path {} is reserved for health probes", path);
    }
    Ok(path)
}

fn build_config<F: FileSystem + ?Sized>(args: &Args, fs: &F) -> Result<ExporterConfig> {
    Ok(ExporterConfig {
        host_proc_path: args
            .host_proc_path
            .clone()
            .unwrap_or_else(|| detect_proc_path(fs)),
        kubelet_path: args
            .kubelet_path
            .clone()
            .unwrap_or_else(|| detect_kubelet_path(fs)),
        namespaces: normalize_list(&args.namespaces),
        discovery: parse_discovery(&args.discovery)?,
        node_name: args.node_name.clone().filter(|n| !n.trim().is_empty()),
        scrape_timeout: (args.scrape_timeout > 0).then(|| Duration::from_secs(args.scrape_timeout)),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet)?;

    let metrics_path = metrics_path(&args.metrics_path)?;
    let fs = Arc::new(RealFs::new());
    let config = build_config(&args, fs.as_ref())?;
    if config.discovery.is_empty() {
        bail!("no discovery method configured");
    }

    info!(
        version = pvstat_core::VERSION,
        proc = %config.host_proc_path.display(),
        kubelet = %config.kubelet_path.display(),
        discovery = ?config.discovery,
        namespaces = ?config.namespaces,
        "starting pvstatd"
    );

    let sources = build_sources(&config, Arc::clone(&fs));
    if sources.is_empty() {
        bail!("none of the configured discovery methods could be enabled");
    }
    let resolver = MultiSourceResolver::new(sources);
    info!(sources = ?resolver.source_names(), "volume discovery ready");

    let exporter = VolumeExporter::new(fs, resolver, &config, Arc::new(MetricCatalog::new()));
    let state = Arc::new(AppState { exporter });

    let app = Router::new()
        .route(&metrics_path, get(handlers::handle_metrics))
        .route(PROBE_PATHS[0], get(handlers::handle_health))
        .route(PROBE_PATHS[1], get(handlers::handle_ready))
        .with_state(state)
        .layer(CompressionLayer::new());

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(addr = %args.listen, path = %metrics_path, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("pvstatd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvstat_core::collector::MockFs;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["pvstatd"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_discovery() {
        let items: Vec<String> = [" k8sapi", "", "csi", "k8sapi"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            parse_discovery(&items).unwrap(),
            vec![DiscoveryMethod::K8sApi, DiscoveryMethod::Kubelet]
        );
        assert!(parse_discovery(&["zfs".to_string()]).is_err());
    }

    #[test]
    fn test_metrics_path() {
        assert_eq!(metrics_path("/metrics").unwrap(), "/metrics");
        assert_eq!(metrics_path(" stats").unwrap(), "/stats");
        assert!(metrics_path("/healthz").is_err());
        assert!(metrics_path("readyz").is_err());
    }

    #[test]
    fn test_build_config_explicit_paths() {
        let a = args(&[
            "--host-proc-path",
            "/hostproc",
            "--kubelet-path",
            "/data/kubelet",
            "--namespaces",
            "db, cache,,",
            "--discovery",
            "k8sapi",
            "--scrape-timeout",
            "15",
        ]);
        let config = build_config(&a, &MockFs::new()).unwrap();

        assert_eq!(config.diskstats_path(), PathBuf::from("/hostproc/diskstats"));
        assert_eq!(config.kubelet_path, PathBuf::from("/data/kubelet"));
        assert_eq!(config.namespaces, vec!["db", "cache"]);
        assert_eq!(config.discovery, vec![DiscoveryMethod::K8sApi]);
        assert_eq!(config.scrape_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_build_config_detects_paths() {
        let mut fs = MockFs::new();
        fs.add_file("/host/proc/diskstats", "");
        fs.add_dir("/var/lib/kubelet/pods");

        let a = args(&["--scrape-timeout", "0"]);
        let config = build_config(&a, &fs).unwrap();
        assert_eq!(config.host_proc_path, PathBuf::from("/host/proc"));
        assert_eq!(config.kubelet_path, PathBuf::from("/var/lib/kubelet"));
        assert!(config.scrape_timeout.is_none());
    }
}
