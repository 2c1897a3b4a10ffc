//! Startup recovery scan.
//!
//! A log file can end in a torn write if the process died mid-append.
//! Opening a `FileLog` scans every record, validates checksums and index
//! contiguity, and reports where the valid prefix ends so the store can cut
//! the damaged tail before accepting new appends.

use crate::entry::{LogEntry, LogIndex, LogTerm};
use crate::error::StoreError;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// How much to read per scan step.
const SCAN_CHUNK_SIZE: usize = 64 * 1024;

/// Summary of a recovery scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    /// Number of valid records found.
    pub valid_records: u64,
    /// Bytes discarded from the tail (torn or corrupted writes).
    pub bytes_truncated: u64,
    /// Index of the first valid record, `LogIndex::ZERO` if none.
    pub first_index: LogIndex,
    /// Index of the last valid record, `LogIndex::ZERO` if none.
    pub last_index: LogIndex,
    /// Term of the last valid record.
    pub last_term: LogTerm,
}

/// Full scan outcome, consumed by `FileLog::open`.
pub(crate) struct ScanOutcome {
    pub report: RecoveryReport,
    /// Byte offset of each valid record.
    pub offsets: BTreeMap<LogIndex, u64>,
    /// Length of the valid prefix; everything after it must be cut.
    pub valid_size: u64,
    pub bytes_truncated: u64,
}

/// Scans `file` from the start, stopping at the first incomplete or invalid
/// record. Does not modify the file.
pub(crate) fn scan_file(file: &mut File) -> Result<ScanOutcome, StoreError> {
    let file_len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    let mut buf = BytesMut::new();
    let mut chunk = vec![0u8; SCAN_CHUNK_SIZE];
    let mut consumed: u64 = 0;
    let mut eof = false;

    let mut report = RecoveryReport::default();
    let mut offsets = BTreeMap::new();
    let mut prev_index: Option<LogIndex> = None;

    loop {
        // Keep the buffer topped up so decode sees whole records.
        while !eof && buf.len() < SCAN_CHUNK_SIZE {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                eof = true;
            } else {
                buf.extend_from_slice(&chunk[..n]);
            }
        }
        if buf.is_empty() {
            break;
        }

        let before = buf.len();
        match LogEntry::decode(&mut buf, consumed) {
            Ok(Some(entry)) => {
                if let Some(prev) = prev_index {
                    if entry.index != prev.next() {
                        // The valid prefix ends before this record.
                        tracing::warn!(
                            offset = consumed,
                            expected = %prev.next(),
                            actual = %entry.index,
                            "non-contiguous record during recovery, discarding tail"
                        );
                        break;
                    }
                }
                if report.valid_records == 0 {
                    report.first_index = entry.index;
                }
                offsets.insert(entry.index, consumed);
                report.valid_records += 1;
                report.last_index = entry.index;
                report.last_term = entry.term;
                prev_index = Some(entry.index);
                consumed += (before - buf.len()) as u64;
            }
            Ok(None) => {
                if eof {
                    // Torn tail write.
                    break;
                }
                // A record can exceed the chunk size; read more directly.
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    eof = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(err) => {
                tracing::warn!(
                    offset = consumed,
                    error = %err,
                    "invalid record during recovery, discarding tail"
                );
                break;
            }
        }
    }

    report.bytes_truncated = file_len - consumed;
    Ok(ScanOutcome {
        report,
        offsets,
        valid_size: consumed,
        bytes_truncated: file_len - consumed,
    })
}
