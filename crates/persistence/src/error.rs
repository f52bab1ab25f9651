//! Persistence errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("row decode error: {0}")]
    Decode(String),
}
