//! Log entry types and the on-disk record format.
//!
//! Each log record has the following fixed layout:
//!
//! ```text
//! +----------+----------+----------+----------+----------+----------+
//! | magic    | version  | flags    | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 1 byte   | 2 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+----------+
//! | term                | index               | payload             |
//! | 8 bytes             | 8 bytes             | length bytes        |
//! +---------------------+---------------------+---------------------+
//! ```
//!
//! All integers are big-endian; the CRC covers the payload only.

use crate::buffer::RecordBuffer;
use crate::error::StoreError;
use crate::RECORD_HEADER_SIZE;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic bytes for log records: "SLOG"
pub const RECORD_MAGIC: [u8; 4] = *b"SLOG";

/// On-disk format version.
pub const RECORD_VERSION: u8 = 1;

/// Maximum record payload size (16 MiB).
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// A leadership epoch. Terms only ever increase for a given log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogTerm(pub u64);

impl LogTerm {
    pub fn next(self) -> LogTerm {
        LogTerm(self.0 + 1)
    }
}

impl fmt::Display for LogTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 1-based position in the log. Index 0 means "before the log begins".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    pub fn prev(self) -> Option<LogIndex> {
        self.0.checked_sub(1).map(LogIndex)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque client data carried by a log entry.
///
/// Payloads are immutable once created; equality is byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload(Bytes);

impl LogPayload {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for LogPayload {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

/// One durable log record, uniquely identified by its index.
///
/// The `term` is the term under which the entry was appended, not the
/// current term of the log holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: LogTerm,
    pub index: LogIndex,
    pub payload: LogPayload,
}

impl LogEntry {
    pub fn new(term: LogTerm, index: LogIndex, payload: LogPayload) -> Self {
        Self {
            term,
            index,
            payload,
        }
    }

    /// Encodes the entry as one record at the end of `buf`.
    ///
    /// On failure the buffer is left exactly as it was.
    pub fn encode_into(&self, buf: &mut RecordBuffer) -> Result<(), StoreError> {
        if self.payload.len() > MAX_RECORD_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: self.payload.len(),
                max: MAX_RECORD_SIZE,
            });
        }

        let crc = crc32c::crc32c(self.payload.as_bytes());

        buf.put_slice(&RECORD_MAGIC);
        buf.put_u8(RECORD_VERSION);
        buf.put_u8(0); // flags
        buf.put_u16(0); // reserved
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(crc);
        buf.put_u64(self.term.0);
        buf.put_u64(self.index.0);
        buf.put_slice(self.payload.as_bytes());

        Ok(())
    }

    /// Decodes one record from the front of `buf`.
    ///
    /// Returns `Ok(None)` if `buf` holds less than a complete record (a
    /// partial tail write) or starts with zero padding. `offset` is the
    /// position of the record in the underlying file, used for error
    /// reporting only.
    pub fn decode(buf: &mut BytesMut, offset: u64) -> Result<Option<Self>, StoreError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != RECORD_MAGIC {
            // Could be EOF padding or corruption.
            if magic == [0, 0, 0, 0] {
                return Ok(None);
            }
            return Err(StoreError::InvalidHeader {
                offset,
                reason: format!("invalid magic: {:?}", magic),
            });
        }

        let version = buf[4];
        if version != RECORD_VERSION {
            return Err(StoreError::InvalidHeader {
                offset,
                reason: format!("unsupported record version: {}", version),
            });
        }

        // flags: buf[5], reserved: buf[6..8]
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let term = u64::from_be_bytes([
            buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
        ]);
        let index = u64::from_be_bytes([
            buf[24], buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31],
        ]);

        if payload_len > MAX_RECORD_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        let total_len = RECORD_HEADER_SIZE + payload_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        buf.advance(RECORD_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(StoreError::CorruptedRecord {
                offset,
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(Self {
            term: LogTerm(term),
            index: LogIndex(index),
            payload: LogPayload::from_bytes(payload),
        }))
    }

    /// Returns the total size of this entry's record on disk.
    pub fn disk_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len()
    }
}
