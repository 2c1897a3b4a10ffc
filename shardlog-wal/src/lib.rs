//! # shardlog-wal
//!
//! Durable log storage for shardlog's replicated per-shard logs.
//!
//! This crate provides:
//! - A fixed-layout binary record format with per-record checksums
//! - `RecordBuffer`, a write buffer with explicit cursor control
//! - The `PersistedLog` storage abstraction (contiguous append, suffix
//!   truncation, lazy forward scans)
//! - `FileLog`, a file-backed store with torn-write recovery, and
//!   `MemoryLog` for tests and volatile shards

pub mod buffer;
pub mod entry;
pub mod error;
pub mod recovery;
pub mod store;

pub use buffer::RecordBuffer;
pub use entry::{LogEntry, LogIndex, LogPayload, LogTerm, MAX_RECORD_SIZE};
pub use error::StoreError;
pub use recovery::RecoveryReport;
pub use store::{
    FileLog, FileLogConfig, FsyncPolicy, LogIterator, LogStoreStats, MemoryLog, PersistedLog,
};

/// Log record header size in bytes.
pub const RECORD_HEADER_SIZE: usize = 32;
