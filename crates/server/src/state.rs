//! Application state
//!
//! Shared state across all handlers.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::RwLock;

use outdial_config::Settings;
use outdial_dialer::{CallServices, DidPool, Dispatcher};

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Per-call runtime services (carrier, providers, registries, stores)
    pub services: Arc<CallServices>,
    /// The dialling agent
    pub dispatcher: Arc<Dispatcher>,
    /// Outbound number pool
    pub did_pool: Arc<DidPool>,
    /// Configuration, reloadable
    pub settings: Arc<RwLock<Settings>>,
    /// Live carrier media WebSocket connections
    pub media_connections: Arc<AtomicUsize>,
    /// Prometheus render handle, when metrics are enabled
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        services: Arc<CallServices>,
        dispatcher: Arc<Dispatcher>,
        did_pool: Arc<DidPool>,
        settings: Settings,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            services,
            dispatcher,
            did_pool,
            settings: Arc::new(RwLock::new(settings)),
            media_connections: Arc::new(AtomicUsize::new(0)),
            metrics,
        }
    }

    pub fn max_media_connections(&self) -> usize {
        self.settings.read().server.max_media_connections
    }
}
