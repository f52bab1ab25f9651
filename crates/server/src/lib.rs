//! HTTP surface
//!
//! Operator REST API, the carrier webhook endpoint and the carrier media
//! WebSocket, wired over the dialer runtime.

pub mod http;
pub mod media_ws;
pub mod metrics;
pub mod state;
pub mod webhooks;

pub use http::create_router;
pub use state::AppState;

use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("persistence unavailable")]
    PersistenceUnavailable,

    #[error("persistence error: {0}")]
    Persistence(#[from] outdial_persistence::PersistenceError),

    #[error("dialer error: {0}")]
    Dialer(#[from] outdial_dialer::DialerError),

    #[error("carrier error: {0}")]
    Carrier(#[from] outdial_telephony::CarrierError),
}
