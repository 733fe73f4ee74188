// src/error.rs
use thiserror::Error;

use crate::models::AggregateState;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// Endpoint unreachable after the source's own retry budget.
    #[error("connection to {endpoint} failed after {attempts} attempts: {reason}")]
    Connection {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid event signature `{signature}`: {reason}")]
    Signature { signature: String, reason: String },

    #[error("decode failure: {0}")]
    Decode(String),
}

impl IndexerError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRecord(reason.into())
    }
}

/// A run that stopped on a fatal source error. The state built so far is
/// handed back so the caller decides whether to keep it.
#[derive(Debug, Error)]
#[error("stream aborted after block {last_block}: {cause}")]
pub struct StreamAborted {
    #[source]
    pub cause: IndexerError,
    pub last_block: u64,
    pub partial: Box<AggregateState>,
}
