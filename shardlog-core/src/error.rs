//! Replication error types.

use crate::core::Role;
use shardlog_wal::StoreError;
use thiserror::Error;

/// Errors from the replicated log core.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("operation requires the {required} role, but the log is a {actual}")]
    WrongRole { required: Role, actual: Role },

    #[error("log is closed")]
    Closed,

    #[error("log is broken: {reason}")]
    Broken { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl LogError {
    /// Returns whether the failed operation can be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LogError::Store(e) if e.is_retryable())
    }
}
