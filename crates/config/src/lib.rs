//! Configuration for the outbound dialer
//!
//! Settings are layered: `config/default.yaml`, then `config/{env}.yaml`,
//! then `OUTDIAL__`-prefixed environment variables.

mod settings;

pub use settings::{
    load_settings, CarrierConfig, CostRates, DialerConfig, LlmProviderConfig, ObservabilityConfig,
    PersistenceConfig, RuntimeEnvironment, ServerConfig, Settings, SttConfig, TtsConfig,
};

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
