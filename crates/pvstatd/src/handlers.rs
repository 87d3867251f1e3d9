//! HTTP request handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

use pvstat_core::collector::{RealFs, VolumeExporter};
use pvstat_core::metrics::TEXT_CONTENT_TYPE;

/// Shared state of the HTTP server.
pub(crate) struct AppState {
    pub(crate) exporter: VolumeExporter<RealFs>,
}

/// Runs a scrape and returns it in the Prometheus text format.
pub(crate) async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.exporter.render().await {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("scrape failed: {}\n", e),
            )
                .into_response()
        }
    }
}

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

pub(crate) async fn handle_ready() -> &'static str {
    "ok"
}
