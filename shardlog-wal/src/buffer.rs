//! Write buffer with explicit cursor control.
//!
//! `RecordBuffer` stages encoded records before they are handed to the
//! underlying file. The cursor operations exist so a caller can remember a
//! position, encode a whole batch after it, and roll back to the remembered
//! position if any record in the batch fails to encode or write.

use bytes::{BufMut, Bytes, BytesMut};

/// A growable byte buffer with an explicit write cursor.
///
/// All integers are written big-endian, matching the record format.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    buf: BytesMut,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Current write position (== number of bytes written so far).
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Truncates the buffer back to `position`, discarding everything
    /// written after it. `position` must not exceed the current length.
    pub fn reset_to(&mut self, position: usize) {
        assert!(
            position <= self.buf.len(),
            "reset_to({}) beyond buffer end {}",
            position,
            self.buf.len()
        );
        self.buf.truncate(position);
    }

    /// Advances the cursor by `n` zero bytes.
    pub fn advance(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the buffer, yielding its contents.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
