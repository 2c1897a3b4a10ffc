//! Storage error types.

use crate::entry::LogIndex;
use thiserror::Error;

/// Errors that can occur in a persisted log store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out-of-order append: expected index {expected}, got {actual}")]
    OutOfOrder { expected: LogIndex, actual: LogIndex },

    #[error("record corrupted at offset {offset}: CRC mismatch (expected {expected:#x}, got {actual:#x})")]
    CorruptedRecord {
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("invalid record header at offset {offset}: {reason}")]
    InvalidHeader { offset: u64, reason: String },

    #[error("record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("log store is closed")]
    Closed,
}

impl StoreError {
    /// Returns whether the failed operation can be retried with the same batch.
    ///
    /// Only I/O failures are retryable; every other variant indicates either
    /// misuse (`OutOfOrder`) or unrecoverable on-disk damage.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}
