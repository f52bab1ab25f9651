//! Prometheus metrics

use axum::extract::State;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state::AppState;

/// Install the global Prometheus recorder. Call once at startup.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(|h| h.render())
        .unwrap_or_default()
}
