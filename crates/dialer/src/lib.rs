//! Dispatcher, DID pool, per-call runtime and outcome reconciliation
//!
//! This crate owns everything between "a queue of leads" and "a finalized
//! conversation row": bounded-concurrency scheduling, outbound number
//! selection, per-phone dial suppression, the per-call context every
//! webhook and media frame routes through, cost accounting, and the
//! terminal-status classifier.

mod context;
mod costs;
mod did;
mod dispatcher;
mod recorder;
mod registry;
mod runtime;

pub use context::{CallContext, CallContextRegistry, CallEvent};
pub use costs::{CostEntry, CostLedger, CostService, CostSummary};
pub use did::{state_for_area_code, Did, DidMatch, DidPool, SelectionStrategy};
pub use dispatcher::{
    AgentState, CallDriver, CallItem, Dispatcher, DispatcherConfig, DispatcherStats,
    OriginatedCall, StatsSnapshot,
};
pub use recorder::{ConversationRecorder, FinalizeInputs};
pub use registry::ActivePhoneRegistry;
pub use runtime::{
    attach_media, initiate_hangup, route_webhook, run_call_events, CallServices,
    ProductionCallDriver,
};

use thiserror::Error;

/// Dialler errors
#[derive(Debug, Error)]
pub enum DialerError {
    #[error("no outbound numbers configured")]
    NoDids,

    #[error("phone {phone} is already being dialled by call {existing_call_id}")]
    AlreadyDialing {
        phone: String,
        existing_call_id: String,
    },

    #[error("carrier error: {0}")]
    Carrier(#[from] outdial_telephony::CarrierError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] outdial_pipeline::PipelineError),

    #[error("persistence error: {0}")]
    Persistence(#[from] outdial_persistence::PersistenceError),
}
