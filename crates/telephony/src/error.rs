//! Carrier error taxonomy
//!
//! Origination and transfer failures are tagged so the dispatcher can drive
//! retry policy by matching, never by string-sniffing exception text.

use thiserror::Error;

/// Errors surfaced by the carrier adapter
#[derive(Debug, Error)]
pub enum CarrierError {
    /// Carrier refused origination because the account's channel limit is
    /// exhausted. Never retried; the lead is not re-queued.
    #[error("carrier channel limit exceeded")]
    ChannelLimit,

    /// The origination (or transfer) number is not verified with the
    /// carrier. Never retried.
    #[error("unverified origination number: {0}")]
    UnverifiedNumber(String),

    /// The destination number is malformed or unroutable. Never retried.
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// The call already reached a terminal state. Callers treat this as
    /// success for hangup and as "transfer not performed" for transfer.
    #[error("call already ended")]
    CallEnded,

    /// Any other refusal from the carrier, with the provider error code
    #[error("carrier rejected request ({code}): {detail}")]
    Rejected { code: String, detail: String },

    /// Transport-level failure; eligible for retry
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Unexpected response shape
    #[error("invalid carrier response: {0}")]
    InvalidResponse(String),
}

impl CarrierError {
    /// Whether the dispatcher may retry the origination
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CarrierError::Network(_) | CarrierError::Rejected { .. } | CarrierError::InvalidResponse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(!CarrierError::ChannelLimit.is_retryable());
        assert!(!CarrierError::UnverifiedNumber("+15550001111".into()).is_retryable());
        assert!(!CarrierError::InvalidNumber("123".into()).is_retryable());
        assert!(!CarrierError::CallEnded.is_retryable());
        assert!(CarrierError::Rejected {
            code: "10015".into(),
            detail: "bad request".into()
        }
        .is_retryable());
    }
}
