//! Follower-side apply path.
//!
//! A follower holds no in-memory tail: entries arriving from the leader are
//! persisted synchronously within the request, and the acknowledgment is the
//! durable prefix. Request handling is strictly ordered per follower by the
//! state mutex.

use crate::core::{LogCore, LogReader, WaitForFuture};
use crate::error::LogError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, AppendOutcome, ParticipantId,
};
use parking_lot::Mutex;
use shardlog_wal::{LogEntry, LogIndex, LogTerm, PersistedLog};
use std::sync::Arc;

/// Follower configuration.
#[derive(Debug, Clone)]
pub struct FollowerConfig {
    /// This follower's identity.
    pub id: ParticipantId,
    /// The term this follower starts at. Newer terms announced by a leader
    /// are adopted; older ones are refused.
    pub term: LogTerm,
}

impl FollowerConfig {
    pub fn new(id: impl Into<ParticipantId>, term: LogTerm) -> Self {
        Self {
            id: id.into(),
            term,
        }
    }
}

struct FollowerInner {
    id: ParticipantId,
    state: Mutex<LogCore>,
}

/// The follower role of one shard's replicated log.
///
/// Cheap to clone; all clones share the same log instance.
#[derive(Clone)]
pub struct LogFollower {
    inner: Arc<FollowerInner>,
}

impl LogFollower {
    /// Attaches a follower to `store`. Whatever the store already holds is
    /// the follower's persisted prefix; the leader reconciles from there.
    pub fn new(config: FollowerConfig, store: Arc<dyn PersistedLog>) -> Self {
        let core = LogCore::new(store, config.term);
        tracing::info!(
            id = %config.id,
            term = %config.term,
            persisted = %core.last_index,
            "log follower attached"
        );
        Self {
            inner: Arc::new(FollowerInner {
                id: config.id,
                state: Mutex::new(core),
            }),
        }
    }

    /// Applies one append request: guards the term, checks contiguity,
    /// truncates a divergent suffix, persists the new entries, and advances
    /// the commit index as far as the piggybacked value allows.
    pub fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, LogError> {
        let mut core = self.inner.state.lock();
        core.check_operational()?;

        if request.term < core.term {
            tracing::warn!(
                leader = %request.leader,
                request_term = %request.term,
                current = %core.term,
                "append from stale term refused"
            );
            return Ok(self.response(
                core.term,
                AppendOutcome::TermMismatch { current: core.term },
            ));
        }
        if request.term > core.term {
            tracing::info!(
                leader = %request.leader,
                old = %core.term,
                new = %request.term,
                "adopting newer term"
            );
            core.term = request.term;
        }

        // The run must attach to the persisted prefix. On a gap, tell the
        // leader exactly where to resume.
        if request.prev_index > core.last_index {
            let retransmit_from = core.last_index.next();
            tracing::debug!(
                prev_index = %request.prev_index,
                persisted = %core.last_index,
                retransmit_from = %retransmit_from,
                "non-contiguous append rejected"
            );
            return Ok(self.response(
                core.term,
                AppendOutcome::Rejected { retransmit_from },
            ));
        }

        // Overlapping indices with a different term mark a divergent suffix
        // left by a previous leader; it must be cut before the new run lands.
        if let Some(conflict) = self.find_conflict(&core, &request)? {
            if conflict <= core.commit_index {
                let reason = format!(
                    "entry {conflict} conflicts below commit index {}",
                    core.commit_index
                );
                core.make_broken(reason.clone());
                return Err(LogError::Broken { reason });
            }
            tracing::warn!(
                from = %conflict,
                previous_last = %core.last_index,
                "truncating divergent suffix"
            );
            core.store.truncate(conflict)?;
            core.last_index = conflict.prev().unwrap_or(LogIndex::ZERO);
        }

        // Entries at or below the persisted prefix are duplicates of what we
        // already hold; only the fresh suffix is written.
        let fresh: Vec<LogEntry> = request
            .entries
            .iter()
            .filter(|entry| entry.index > core.last_index)
            .cloned()
            .collect();
        if let Some(last) = fresh.last().map(|entry| entry.index) {
            match core.store.append(fresh) {
                Ok(()) => {
                    core.last_index = last;
                    tracing::debug!(persisted = %last, "entries persisted");
                }
                Err(err) if err.is_retryable() => {
                    let retransmit_from = core.last_index.next();
                    tracing::warn!(
                        error = %err,
                        retransmit_from = %retransmit_from,
                        "persistence failed, requesting retransmission"
                    );
                    return Ok(self.response(
                        core.term,
                        AppendOutcome::Rejected { retransmit_from },
                    ));
                }
                Err(err) => {
                    let reason = format!("persistence failed: {err}");
                    core.make_broken(reason.clone());
                    return Err(LogError::Broken { reason });
                }
            }
        }

        // The leader may have committed further than this follower has
        // persisted; only the reachable part applies here.
        let reachable = request.commit_index.min(core.last_index);
        core.advance_commit(reachable);

        let acknowledged = core.last_index;
        Ok(self.response(core.term, AppendOutcome::Accepted { acknowledged }))
    }

    /// Resolves once the commit index reaches `index`.
    pub fn wait_for(&self, index: LogIndex) -> WaitForFuture {
        self.inner.state.lock().wait_for(index)
    }

    /// Scans persisted entries from `from`.
    pub fn read(&self, from: LogIndex) -> LogReader {
        let store = self.inner.state.lock().store.clone();
        LogReader::new(store, from)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.state.lock().commit_index
    }

    /// Highest durably persisted index.
    pub fn last_persisted(&self) -> LogIndex {
        self.inner.state.lock().last_index
    }

    pub fn term(&self) -> LogTerm {
        self.inner.state.lock().term
    }

    pub fn id(&self) -> &ParticipantId {
        &self.inner.id
    }

    /// Closes the log: refuses further appends and fails pending waiters.
    pub fn shutdown(&self) {
        self.inner.state.lock().close();
    }

    fn response(&self, term: LogTerm, outcome: AppendOutcome) -> AppendEntriesResponse {
        AppendEntriesResponse {
            follower: self.inner.id.clone(),
            term,
            outcome,
        }
    }

    /// First overlapping index whose persisted term differs from the
    /// incoming entry's term, if any.
    fn find_conflict(
        &self,
        core: &LogCore,
        request: &AppendEntriesRequest,
    ) -> Result<Option<LogIndex>, LogError> {
        let Some(first) = request.first_index() else {
            return Ok(None);
        };
        if first > core.last_index {
            return Ok(None);
        }

        let mut existing = core.store.read_from(first);
        for entry in &request.entries {
            if entry.index > core.last_index {
                break;
            }
            let Some(found) = existing.next() else {
                break;
            };
            let found = found?;
            debug_assert_eq!(found.index, entry.index);
            if found.term != entry.term {
                return Ok(Some(entry.index));
            }
        }
        Ok(None)
    }
}
