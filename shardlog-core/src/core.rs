//! Shared log state.
//!
//! `LogCore` is the single mutual-exclusion domain of one log instance: the
//! in-memory tail, the current term, the commit index, and the pending
//! `wait_for` futures. Both roles embed it behind their own mutex; at most
//! one state-mutating step runs at a time for a given log.

use crate::error::LogError;
use crate::follower::LogFollower;
use crate::leader::LogLeader;
use shardlog_wal::{LogEntry, LogIndex, LogPayload, LogTerm, PersistedLog};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// How many entries a `LogReader` fetches from the store per refill.
const READ_BATCH: usize = 128;

/// The role a log instance plays for its current term.
///
/// Roles change only by constructing a new instance with a new term;
/// leadership assignment is driven externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Leader => f.write_str("leader"),
            Role::Follower => f.write_str("follower"),
        }
    }
}

/// Lifecycle of a log instance.
#[derive(Debug, Clone)]
pub(crate) enum Lifecycle {
    Operational,
    /// Shut down or superseded; rejects writes, fails waiters.
    Closed,
    /// Terminal failure (e.g. persistence retries exhausted).
    Broken(String),
}

/// Future returned by `wait_for`. Resolves with `Ok(())` once the awaited
/// index is committed, or with an error if the log closes or breaks first.
pub struct WaitForFuture {
    rx: oneshot::Receiver<Result<(), LogError>>,
}

impl Future for WaitForFuture {
    type Output = Result<(), LogError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The log was dropped without resolving us.
            Poll::Ready(Err(_)) => Poll::Ready(Err(LogError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) struct LogCore {
    pub(crate) store: Arc<dyn PersistedLog>,
    pub(crate) term: LogTerm,
    pub(crate) commit_index: LogIndex,
    /// Last appended index, in-memory tail included.
    pub(crate) last_index: LogIndex,
    /// Entries appended but not yet locally persisted (leader only).
    pub(crate) tail: VecDeque<LogEntry>,
    waiters: BTreeMap<LogIndex, Vec<oneshot::Sender<Result<(), LogError>>>>,
    pub(crate) lifecycle: Lifecycle,
}

impl LogCore {
    pub(crate) fn new(store: Arc<dyn PersistedLog>, term: LogTerm) -> Self {
        let last_index = store.last_index();
        Self {
            store,
            term,
            commit_index: LogIndex::ZERO,
            last_index,
            tail: VecDeque::new(),
            waiters: BTreeMap::new(),
            lifecycle: Lifecycle::Operational,
        }
    }

    pub(crate) fn check_operational(&self) -> Result<(), LogError> {
        match &self.lifecycle {
            Lifecycle::Operational => Ok(()),
            Lifecycle::Closed => Err(LogError::Closed),
            Lifecycle::Broken(reason) => Err(LogError::Broken {
                reason: reason.clone(),
            }),
        }
    }

    /// Appends a new entry at `(term, last_index + 1)` to the in-memory tail.
    pub(crate) fn append_tail(&mut self, payload: LogPayload) -> LogIndex {
        let index = self.last_index.next();
        self.tail
            .push_back(LogEntry::new(self.term, index, payload));
        self.last_index = index;
        index
    }

    /// Snapshot of the unpersisted tail, oldest first.
    pub(crate) fn unpersisted(&self) -> Vec<LogEntry> {
        self.tail.iter().cloned().collect()
    }

    /// Drops tail entries persisted through `index`.
    pub(crate) fn drop_tail_through(&mut self, index: LogIndex) {
        while self
            .tail
            .front()
            .is_some_and(|entry| entry.index <= index)
        {
            self.tail.pop_front();
        }
    }

    /// Registers a waiter for `index`. Already-satisfied (or already-failed)
    /// waits resolve immediately, but still through the future for a uniform
    /// caller surface.
    pub(crate) fn wait_for(&mut self, index: LogIndex) -> WaitForFuture {
        let (tx, rx) = oneshot::channel();
        match &self.lifecycle {
            Lifecycle::Closed => {
                let _ = tx.send(Err(LogError::Closed));
            }
            Lifecycle::Broken(reason) => {
                let _ = tx.send(Err(LogError::Broken {
                    reason: reason.clone(),
                }));
            }
            Lifecycle::Operational => {
                if self.commit_index >= index {
                    let _ = tx.send(Ok(()));
                } else {
                    self.waiters.entry(index).or_default().push(tx);
                }
            }
        }
        WaitForFuture { rx }
    }

    /// Advances the commit index monotonically and resolves every waiter at
    /// or below the new value, in index order.
    pub(crate) fn advance_commit(&mut self, to: LogIndex) {
        if to <= self.commit_index {
            return;
        }
        debug_assert!(to <= self.last_index, "commit beyond last appended index");
        self.commit_index = to;

        let remaining = self.waiters.split_off(&to.next());
        let satisfied = std::mem::replace(&mut self.waiters, remaining);
        let resolved: usize = satisfied.values().map(Vec::len).sum();
        for (_, senders) in satisfied {
            for tx in senders {
                let _ = tx.send(Ok(()));
            }
        }

        tracing::debug!(commit_index = %to, resolved, "commit index advanced");
    }

    /// Moves the log to `Closed` and fails every pending waiter.
    pub(crate) fn close(&mut self) {
        if !matches!(self.lifecycle, Lifecycle::Operational) {
            return;
        }
        self.lifecycle = Lifecycle::Closed;
        self.fail_waiters(|| LogError::Closed);
        tracing::info!(term = %self.term, "log closed");
    }

    /// Moves the log to the terminal `Broken` state and fails every pending
    /// waiter.
    pub(crate) fn make_broken(&mut self, reason: String) {
        if matches!(self.lifecycle, Lifecycle::Broken(_)) {
            return;
        }
        tracing::error!(term = %self.term, reason, "log is broken");
        self.lifecycle = Lifecycle::Broken(reason.clone());
        self.fail_waiters(move || LogError::Broken {
            reason: reason.clone(),
        });
    }

    fn fail_waiters(&mut self, err: impl Fn() -> LogError) {
        for (_, senders) in std::mem::take(&mut self.waiters) {
            for tx in senders {
                let _ = tx.send(Err(err()));
            }
        }
    }
}

/// Lazy forward scan over persisted entries, bounded by the log's end at
/// creation time. Entries still only in the in-memory tail are not visible.
pub struct LogReader {
    store: Arc<dyn PersistedLog>,
    next_index: LogIndex,
    end: LogIndex,
    batch: std::vec::IntoIter<Result<LogEntry, LogError>>,
    failed: bool,
}

impl LogReader {
    pub(crate) fn new(store: Arc<dyn PersistedLog>, from: LogIndex) -> Self {
        let end = store.last_index();
        Self {
            store,
            next_index: from,
            end,
            batch: Vec::new().into_iter(),
            failed: false,
        }
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.batch.next() {
                return Some(item);
            }
            if self.failed || self.next_index > self.end {
                return None;
            }

            let mut batch = Vec::new();
            for result in self.store.read_from(self.next_index) {
                if batch.len() >= READ_BATCH {
                    break;
                }
                match result {
                    Ok(entry) if entry.index > self.end => break,
                    Ok(entry) => {
                        self.next_index = entry.index.next();
                        batch.push(Ok(entry));
                    }
                    Err(err) => {
                        self.failed = true;
                        batch.push(Err(LogError::Store(err)));
                        break;
                    }
                }
            }
            if batch.is_empty() {
                return None;
            }
            self.batch = batch.into_iter();
        }
    }
}

/// A role-erased handle to one shard's replicated log.
///
/// Higher layers hold this and treat the log as opaque; role-specific
/// operations fail with `LogError::WrongRole` instead of being silently
/// misapplied.
pub enum ReplicatedLog {
    Leader(LogLeader),
    Follower(LogFollower),
}

impl ReplicatedLog {
    pub fn role(&self) -> Role {
        match self {
            ReplicatedLog::Leader(_) => Role::Leader,
            ReplicatedLog::Follower(_) => Role::Follower,
        }
    }

    /// Appends a payload. Valid only on the leader.
    pub fn insert(&self, payload: LogPayload) -> Result<LogIndex, LogError> {
        match self {
            ReplicatedLog::Leader(leader) => leader.insert(payload),
            ReplicatedLog::Follower(_) => Err(LogError::WrongRole {
                required: Role::Leader,
                actual: Role::Follower,
            }),
        }
    }

    /// Resolves once the commit index reaches `index`.
    pub fn wait_for(&self, index: LogIndex) -> WaitForFuture {
        match self {
            ReplicatedLog::Leader(leader) => leader.wait_for(index),
            ReplicatedLog::Follower(follower) => follower.wait_for(index),
        }
    }

    /// Scans persisted entries from `index`.
    pub fn read(&self, from: LogIndex) -> LogReader {
        match self {
            ReplicatedLog::Leader(leader) => leader.read(from),
            ReplicatedLog::Follower(follower) => follower.read(from),
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        match self {
            ReplicatedLog::Leader(leader) => leader.commit_index(),
            ReplicatedLog::Follower(follower) => follower.commit_index(),
        }
    }

    pub fn shutdown(&self) {
        match self {
            ReplicatedLog::Leader(leader) => leader.shutdown(),
            ReplicatedLog::Follower(follower) => follower.shutdown(),
        }
    }

    pub fn as_leader(&self) -> Result<&LogLeader, LogError> {
        match self {
            ReplicatedLog::Leader(leader) => Ok(leader),
            ReplicatedLog::Follower(_) => Err(LogError::WrongRole {
                required: Role::Leader,
                actual: Role::Follower,
            }),
        }
    }

    pub fn as_follower(&self) -> Result<&LogFollower, LogError> {
        match self {
            ReplicatedLog::Follower(follower) => Ok(follower),
            ReplicatedLog::Leader(_) => Err(LogError::WrongRole {
                required: Role::Follower,
                actual: Role::Leader,
            }),
        }
    }
}
