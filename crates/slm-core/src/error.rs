//! Error types for the stop-loss manager core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SlmError {
    #[error("invalid position data: {0}")]
    InvalidPosition(String),

    #[error("invalid stop-loss price: {0}")]
    InvalidSl(String),

    #[error("symbol metadata unavailable: {0}")]
    SymbolUnavailable(String),

    #[error("lock timeout on ticket {ticket} after {waited_ms}ms")]
    LockTimeout { ticket: u64, waited_ms: u64 },

    #[error("lock contention on ticket {0}")]
    LockContention(u64),

    #[error("broker rejected modification for ticket {ticket}: {reason}")]
    BrokerRejected { ticket: u64, reason: String },

    #[error("verification mismatch for ticket {ticket}: {detail}")]
    VerificationMismatch { ticket: u64, detail: String },

    #[error("circuit breaker open for ticket {0}")]
    CircuitBreakerOpen(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("manual review required for ticket {0}")]
    ManualReviewRequired(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SlmError>;
