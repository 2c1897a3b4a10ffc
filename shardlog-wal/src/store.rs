//! Persisted log stores.
//!
//! `PersistedLog` is the durability boundary of a replicated log: an ordered,
//! gap-free sequence of `(term, index, payload)` records owned by exactly one
//! log instance for its lifetime. Two implementations are provided: a
//! file-backed store with crash recovery and an in-memory store for tests and
//! volatile shards.

use crate::buffer::RecordBuffer;
use crate::entry::{LogEntry, LogIndex, MAX_RECORD_SIZE};
use crate::error::StoreError;
use crate::recovery;
use crate::RECORD_HEADER_SIZE;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A boxed forward scan over log entries.
///
/// The iterator is lazy, finite, and not restartable; it observes the store
/// as of the `read_from` call.
pub type LogIterator<'a> = Box<dyn Iterator<Item = Result<LogEntry, StoreError>> + Send + 'a>;

/// Durable, ordered storage for one replicated log.
///
/// Appends must be contiguous with the last persisted index; `truncate`
/// removes a suffix, never a prefix. Once `append` returns `Ok`, the entries
/// are durable and visible to `read_from` across restarts.
pub trait PersistedLog: Send + Sync {
    /// Index of the earliest persisted entry, `LogIndex::ZERO` if empty.
    fn first_index(&self) -> LogIndex;

    /// Index of the latest persisted entry, `LogIndex::ZERO` if empty.
    fn last_index(&self) -> LogIndex;

    /// Appends `entries` in order.
    ///
    /// Entries already persisted (index at or below `last_index`) are
    /// skipped, which makes retrying a partially failed batch idempotent.
    /// The remaining entries must continue at `last_index + 1` with no gaps;
    /// otherwise the whole batch is rejected with `StoreError::OutOfOrder`
    /// and nothing is written.
    fn append(&self, entries: Vec<LogEntry>) -> Result<(), StoreError>;

    /// Removes all entries with index >= `from`.
    ///
    /// Callers never observe a partial truncation. Truncating past the end
    /// is a no-op.
    fn truncate(&self, from: LogIndex) -> Result<(), StoreError>;

    /// Scans forward from `from` (inclusive) to the current end.
    fn read_from(&self, from: LogIndex) -> LogIterator<'_>;
}

/// Validates batch contiguity against the store's current last index.
///
/// Returns how many leading entries to skip because they are already
/// persisted (idempotent retry of an interrupted batch).
fn check_contiguity(
    last: LogIndex,
    empty: bool,
    entries: &[LogEntry],
) -> Result<usize, StoreError> {
    // Intra-batch contiguity.
    for pair in entries.windows(2) {
        if pair[1].index != pair[0].index.next() {
            return Err(StoreError::OutOfOrder {
                expected: pair[0].index.next(),
                actual: pair[1].index,
            });
        }
    }

    // An empty store accepts any starting index; a compacted follower may
    // begin mid-stream.
    if empty {
        return Ok(0);
    }

    let start = entries[0].index;
    let expected = last.next();
    if start > expected {
        return Err(StoreError::OutOfOrder {
            expected,
            actual: start,
        });
    }

    // start <= expected: skip the already-persisted prefix.
    let skip = (expected.0 - start.0) as usize;
    Ok(skip.min(entries.len()))
}

/// In-memory persisted log. Durability ends with the process.
#[derive(Default)]
pub struct MemoryLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl PersistedLog for MemoryLog {
    fn first_index(&self) -> LogIndex {
        self.entries
            .lock()
            .first()
            .map(|e| e.index)
            .unwrap_or(LogIndex::ZERO)
    }

    fn last_index(&self) -> LogIndex {
        self.entries
            .lock()
            .last()
            .map(|e| e.index)
            .unwrap_or(LogIndex::ZERO)
    }

    fn append(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut stored = self.entries.lock();
        let last = stored.last().map(|e| e.index).unwrap_or(LogIndex::ZERO);
        let skip = check_contiguity(last, stored.is_empty(), &entries)?;
        stored.extend(entries.into_iter().skip(skip));
        Ok(())
    }

    fn truncate(&self, from: LogIndex) -> Result<(), StoreError> {
        let mut stored = self.entries.lock();
        stored.retain(|e| e.index < from);
        Ok(())
    }

    fn read_from(&self, from: LogIndex) -> LogIterator<'_> {
        let snapshot: Vec<LogEntry> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.index >= from)
            .cloned()
            .collect();
        Box::new(snapshot.into_iter().map(Ok))
    }
}

/// Fsync policy for file-backed appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncPolicy {
    /// Fsync after every append (safest, slowest).
    #[default]
    EveryWrite,
    /// Fsync after N appends.
    EveryN(u32),
    /// Never fsync automatically (caller must call `sync`).
    Never,
}

/// File log configuration.
#[derive(Debug, Clone)]
pub struct FileLogConfig {
    /// Path of the log file.
    pub path: PathBuf,
    /// Fsync policy.
    pub fsync_policy: FsyncPolicy,
}

impl FileLogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fsync_policy: FsyncPolicy::default(),
        }
    }

    pub fn with_fsync_policy(mut self, policy: FsyncPolicy) -> Self {
        self.fsync_policy = policy;
        self
    }
}

/// I/O statistics for a file log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStoreStats {
    pub appends: u64,
    pub truncations: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub fsyncs: u64,
}

struct FileInner {
    file: File,
    size: u64,
    /// Byte offset of each persisted record, keyed by index.
    offsets: BTreeMap<LogIndex, u64>,
    writes_since_sync: u64,
}

/// File-backed persisted log: one append-only file of checksummed records.
///
/// Segment rotation and compaction live above this layer; a file log holds
/// exactly one shard's log suffix.
pub struct FileLog {
    config: FileLogConfig,
    inner: Mutex<FileInner>,
    closed: AtomicBool,
    stats_appends: AtomicU64,
    stats_truncations: AtomicU64,
    stats_bytes_written: AtomicU64,
    stats_bytes_read: AtomicU64,
    stats_fsyncs: AtomicU64,
}

impl FileLog {
    /// Opens or creates the log file, scanning any existing records and
    /// truncating a torn tail write.
    pub fn open(config: FileLogConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&config.path)?;

        let scan = recovery::scan_file(&mut file)?;
        if scan.bytes_truncated > 0 {
            tracing::warn!(
                path = %config.path.display(),
                bytes = scan.bytes_truncated,
                "truncating torn tail write"
            );
            file.set_len(scan.valid_size)?;
            file.sync_data()?;
        }

        tracing::info!(
            path = %config.path.display(),
            records = scan.report.valid_records,
            last_index = %scan.report.last_index,
            "log store opened"
        );

        Ok(Self {
            config,
            inner: Mutex::new(FileInner {
                file,
                size: scan.valid_size,
                offsets: scan.offsets,
                writes_since_sync: 0,
            }),
            closed: AtomicBool::new(false),
            stats_appends: AtomicU64::new(0),
            stats_truncations: AtomicU64::new(0),
            stats_bytes_written: AtomicU64::new(0),
            stats_bytes_read: AtomicU64::new(0),
            stats_fsyncs: AtomicU64::new(0),
        })
    }

    /// Forces a sync to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        self.sync_locked(&mut inner)
    }

    fn sync_locked(&self, inner: &mut FileInner) -> Result<(), StoreError> {
        inner.file.sync_data()?;
        inner.writes_since_sync = 0;
        self.stats_fsyncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the log. Further appends and truncations fail with
    /// `StoreError::Closed`.
    pub fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.sync()
    }

    /// Returns the current I/O statistics.
    pub fn stats(&self) -> LogStoreStats {
        LogStoreStats {
            appends: self.stats_appends.load(Ordering::Relaxed),
            truncations: self.stats_truncations.load(Ordering::Relaxed),
            bytes_written: self.stats_bytes_written.load(Ordering::Relaxed),
            bytes_read: self.stats_bytes_read.load(Ordering::Relaxed),
            fsyncs: self.stats_fsyncs.load(Ordering::Relaxed),
        }
    }

    /// Reads and decodes the record starting at `offset`.
    fn read_record_at(&self, offset: u64) -> Result<LogEntry, StoreError> {
        let mut inner = self.inner.lock();

        inner.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        inner.file.read_exact(&mut header)?;

        let payload_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if payload_len > MAX_RECORD_SIZE {
            return Err(StoreError::RecordTooLarge {
                size: payload_len,
                max: MAX_RECORD_SIZE,
            });
        }

        let mut payload = vec![0u8; payload_len];
        inner.file.read_exact(&mut payload)?;
        drop(inner);

        let total = RECORD_HEADER_SIZE + payload_len;
        self.stats_bytes_read
            .fetch_add(total as u64, Ordering::Relaxed);

        let mut bytes = BytesMut::with_capacity(total);
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&payload);

        LogEntry::decode(&mut bytes, offset)?.ok_or(StoreError::InvalidHeader {
            offset,
            reason: "truncated record".to_string(),
        })
    }
}

impl PersistedLog for FileLog {
    fn first_index(&self) -> LogIndex {
        self.inner
            .lock()
            .offsets
            .keys()
            .next()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    fn last_index(&self) -> LogIndex {
        self.inner
            .lock()
            .offsets
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    fn append(&self, entries: Vec<LogEntry>) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.lock();
        let last = inner
            .offsets
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LogIndex::ZERO);
        let skip = check_contiguity(last, inner.offsets.is_empty(), &entries)?;
        let entries = &entries[skip..];
        if entries.is_empty() {
            return Ok(());
        }

        // Stage the whole batch before touching the file so an encode
        // failure leaves no partial record behind.
        let base = inner.size;
        let mut buf = RecordBuffer::with_capacity(
            entries.iter().map(LogEntry::disk_size).sum::<usize>(),
        );
        let mut new_offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            new_offsets.push((entry.index, base + buf.position() as u64));
            entry.encode_into(&mut buf)?;
        }

        inner.file.seek(SeekFrom::End(0))?;
        if let Err(err) = inner.file.write_all(buf.as_slice()) {
            // Roll the file back so a retry of the same batch starts clean.
            let _ = inner.file.set_len(base);
            return Err(err.into());
        }
        inner.size += buf.len() as u64;
        for (index, offset) in new_offsets {
            inner.offsets.insert(index, offset);
        }

        self.stats_appends.fetch_add(1, Ordering::Relaxed);
        self.stats_bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);

        inner.writes_since_sync += 1;
        match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => self.sync_locked(&mut inner)?,
            FsyncPolicy::EveryN(n) if inner.writes_since_sync >= n as u64 => {
                self.sync_locked(&mut inner)?
            }
            _ => {}
        }

        Ok(())
    }

    fn truncate(&self, from: LogIndex) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }

        let mut inner = self.inner.lock();
        let Some(&last) = inner.offsets.keys().next_back() else {
            return Ok(());
        };
        if from > last {
            return Ok(());
        }

        let Some(&first) = inner.offsets.keys().next() else {
            return Ok(());
        };
        let cut = if from <= first {
            0
        } else {
            *inner.offsets.get(&from).ok_or(StoreError::InvalidHeader {
                offset: 0,
                reason: format!("no record offset for index {}", from),
            })?
        };

        inner.file.set_len(cut)?;
        inner.size = cut;
        inner.offsets.retain(|&index, _| index < from);
        self.sync_locked(&mut inner)?;
        self.stats_truncations.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(from = %from, new_size = cut, "log store truncated");
        Ok(())
    }

    fn read_from(&self, from: LogIndex) -> LogIterator<'_> {
        let offsets: Vec<u64> = self
            .inner
            .lock()
            .offsets
            .range(from..)
            .map(|(_, &offset)| offset)
            .collect();
        Box::new(FileLogIter {
            log: self,
            offsets: offsets.into_iter(),
            failed: false,
        })
    }
}

/// Forward scan over a `FileLog`, snapshotted at creation.
struct FileLogIter<'a> {
    log: &'a FileLog,
    offsets: std::vec::IntoIter<u64>,
    failed: bool,
}

impl Iterator for FileLogIter<'_> {
    type Item = Result<LogEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let offset = self.offsets.next()?;
        match self.log.read_record_at(offset) {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{LogPayload, LogTerm};

    fn entry(term: u64, index: u64, payload: &str) -> LogEntry {
        LogEntry::new(
            LogTerm(term),
            LogIndex(index),
            LogPayload::from(payload),
        )
    }

    fn collect(iter: LogIterator<'_>) -> Vec<LogEntry> {
        iter.map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_memory_append_and_read() {
        let log = MemoryLog::new();
        log.append(vec![entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();
        log.append(vec![entry(1, 3, "c")]).unwrap();

        assert_eq!(log.first_index(), LogIndex(1));
        assert_eq!(log.last_index(), LogIndex(3));

        let entries = collect(log.read_from(LogIndex(2)));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, LogIndex(2));
        assert_eq!(entries[1].payload, LogPayload::from("c"));
    }

    #[test]
    fn test_memory_rejects_gap() {
        let log = MemoryLog::new();
        log.append(vec![entry(1, 1, "a")]).unwrap();

        let result = log.append(vec![entry(1, 3, "c")]);
        assert!(matches!(
            result,
            Err(StoreError::OutOfOrder {
                expected: LogIndex(2),
                actual: LogIndex(3),
            })
        ));
        assert_eq!(log.last_index(), LogIndex(1));
    }

    #[test]
    fn test_memory_rejects_intra_batch_gap() {
        let log = MemoryLog::new();
        let result = log.append(vec![entry(1, 1, "a"), entry(1, 5, "e")]);
        assert!(matches!(result, Err(StoreError::OutOfOrder { .. })));
        assert!(log.is_empty());
    }

    #[test]
    fn test_memory_retry_is_idempotent() {
        let log = MemoryLog::new();
        log.append(vec![entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();

        // Retrying a batch that overlaps the persisted prefix only appends
        // the new suffix.
        log.append(vec![entry(1, 1, "a"), entry(1, 2, "b"), entry(1, 3, "c")])
            .unwrap();
        assert_eq!(log.last_index(), LogIndex(3));
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_memory_truncate_suffix() {
        let log = MemoryLog::new();
        log.append((1..=5).map(|i| entry(1, i, "x")).collect())
            .unwrap();

        log.truncate(LogIndex(3)).unwrap();
        assert_eq!(log.last_index(), LogIndex(2));
        assert_eq!(collect(log.read_from(LogIndex(1))).len(), 2);

        // Truncating past the end is a no-op.
        log.truncate(LogIndex(100)).unwrap();
        assert_eq!(log.last_index(), LogIndex(2));
    }

    #[test]
    fn test_memory_starts_mid_stream_when_empty() {
        let log = MemoryLog::new();
        log.append(vec![entry(2, 7, "resync")]).unwrap();
        assert_eq!(log.first_index(), LogIndex(7));
        assert_eq!(log.last_index(), LogIndex(7));
    }

    #[test]
    fn test_memory_read_is_repeatable() {
        let log = MemoryLog::new();
        log.append(vec![entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();

        let first = collect(log.read_from(LogIndex(1)));
        let second = collect(log.read_from(LogIndex(1)));
        assert_eq!(first, second);
    }

    #[test]
    fn test_file_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(FileLogConfig::new(dir.path().join("shard.log"))).unwrap();

        log.append(vec![entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();
        log.append(vec![entry(2, 3, "c")]).unwrap();

        let entries = collect(log.read_from(LogIndex(1)));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].term, LogTerm(2));
        assert_eq!(entries[2].payload, LogPayload::from("c"));

        // Reading past the end yields an empty sequence, not an error.
        assert!(collect(log.read_from(LogIndex(10))).is_empty());
    }

    #[test]
    fn test_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.log");

        {
            let log = FileLog::open(FileLogConfig::new(&path)).unwrap();
            log.append(vec![entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();
            log.close().unwrap();
        }

        let log = FileLog::open(FileLogConfig::new(&path)).unwrap();
        assert_eq!(log.last_index(), LogIndex(2));
        let entries = collect(log.read_from(LogIndex(1)));
        assert_eq!(entries[0].payload, LogPayload::from("a"));
        assert_eq!(entries[1].payload, LogPayload::from("b"));

        // Appends continue where the previous process stopped.
        log.append(vec![entry(1, 3, "c")]).unwrap();
        assert_eq!(log.last_index(), LogIndex(3));
    }

    #[test]
    fn test_file_rejects_gap() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(FileLogConfig::new(dir.path().join("shard.log"))).unwrap();

        log.append(vec![entry(1, 1, "a")]).unwrap();
        let result = log.append(vec![entry(1, 4, "d")]);
        assert!(matches!(result, Err(StoreError::OutOfOrder { .. })));
    }

    #[test]
    fn test_file_truncate_and_reappend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.log");
        let log = FileLog::open(FileLogConfig::new(&path)).unwrap();

        log.append((1..=10).map(|i| entry(1, i, "t1")).collect())
            .unwrap();
        log.truncate(LogIndex(8)).unwrap();
        assert_eq!(log.last_index(), LogIndex(7));

        // New-term entries replace the truncated suffix.
        log.append(vec![entry(2, 8, "t2")]).unwrap();
        let entries = collect(log.read_from(LogIndex(7)));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].term, LogTerm(2));

        // Truncation is durable.
        log.close().unwrap();
        drop(log);
        let reopened = FileLog::open(FileLogConfig::new(&path)).unwrap();
        assert_eq!(reopened.last_index(), LogIndex(8));
        let tail = collect(reopened.read_from(LogIndex(8)));
        assert_eq!(tail[0].term, LogTerm(2));
    }

    #[test]
    fn test_file_truncate_everything() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(FileLogConfig::new(dir.path().join("shard.log"))).unwrap();

        log.append(vec![entry(1, 1, "a"), entry(1, 2, "b")]).unwrap();
        log.truncate(LogIndex(1)).unwrap();

        assert_eq!(log.first_index(), LogIndex::ZERO);
        assert_eq!(log.last_index(), LogIndex::ZERO);
        assert!(collect(log.read_from(LogIndex(1))).is_empty());
    }

    #[test]
    fn test_file_closed_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(FileLogConfig::new(dir.path().join("shard.log"))).unwrap();
        log.close().unwrap();

        assert!(matches!(
            log.append(vec![entry(1, 1, "a")]),
            Err(StoreError::Closed)
        ));
        assert!(matches!(log.truncate(LogIndex(1)), Err(StoreError::Closed)));
    }

    #[test]
    fn test_file_stats_track_io() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(FileLogConfig::new(dir.path().join("shard.log"))).unwrap();

        log.append(vec![entry(1, 1, "a")]).unwrap();
        let _ = collect(log.read_from(LogIndex(1)));

        let stats = log.stats();
        assert_eq!(stats.appends, 1);
        assert!(stats.bytes_written > 0);
        assert!(stats.bytes_read > 0);
        assert!(stats.fsyncs >= 1); // EveryWrite default
    }

    #[test]
    fn test_file_fsync_every_n() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileLogConfig::new(dir.path().join("shard.log"))
            .with_fsync_policy(FsyncPolicy::EveryN(2));
        let log = FileLog::open(config).unwrap();

        log.append(vec![entry(1, 1, "a")]).unwrap();
        assert_eq!(log.stats().fsyncs, 0);
        log.append(vec![entry(1, 2, "b")]).unwrap();
        assert_eq!(log.stats().fsyncs, 1);
    }
}
