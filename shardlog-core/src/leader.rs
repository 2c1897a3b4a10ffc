//! Leader-side replication driver.
//!
//! The leader owns the authoritative tail: `insert` appends in memory and
//! returns an index immediately; a scheduler work item then persists the
//! tail locally and dispatches it to followers. Acknowledgments advance each
//! follower's progress monotonically, and the commit index is the highest
//! index acknowledged by a quorum of the replica set (leader included).

use crate::core::{LogCore, LogReader, WaitForFuture};
use crate::error::LogError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, AppendOutcome, ParticipantId,
};
use crate::scheduler::Scheduler;
use crate::transport::LogTransport;
use parking_lot::Mutex;
use shardlog_wal::{LogIndex, LogPayload, LogTerm, PersistedLog};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on entries carried by one append request.
const MAX_APPEND_BATCH: usize = 512;

/// Leader configuration.
#[derive(Debug, Clone)]
pub struct LeaderConfig {
    /// This leader's identity.
    pub id: ParticipantId,
    /// The term this leader was established for.
    pub term: LogTerm,
    /// The follower replicas, excluding the leader itself.
    pub followers: Vec<ParticipantId>,
    /// Replicas (leader included) that must acknowledge an index before it
    /// commits. Defaults to a simple majority, `floor(N/2) + 1`.
    pub quorum_size: usize,
    /// Bound on consecutive local persistence retries before the log is
    /// declared broken.
    pub max_persist_retries: u32,
    /// Delay between persistence retries.
    pub retry_delay: Duration,
}

impl LeaderConfig {
    pub fn new(
        id: impl Into<ParticipantId>,
        term: LogTerm,
        followers: Vec<ParticipantId>,
    ) -> Self {
        let replicas = followers.len() + 1;
        Self {
            id: id.into(),
            term,
            followers,
            quorum_size: replicas / 2 + 1,
            max_persist_retries: 8,
            retry_delay: Duration::from_millis(50),
        }
    }

    pub fn with_quorum_size(mut self, quorum_size: usize) -> Self {
        self.quorum_size = quorum_size;
        self
    }

    pub fn with_retry_policy(mut self, max_persist_retries: u32, retry_delay: Duration) -> Self {
        self.max_persist_retries = max_persist_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// Leader's view of one follower.
struct FollowerState {
    id: ParticipantId,
    /// Highest index this follower has confirmed durable. Monotonic.
    acknowledged: LogIndex,
    /// Next index to send.
    next_index: LogIndex,
    /// Commit index carried by the last request sent.
    sent_commit: LogIndex,
    /// A request to this follower is awaiting its response.
    in_flight: bool,
}

/// Progress snapshot of one follower, as reported by `LogLeader::status`.
#[derive(Debug, Clone)]
pub struct FollowerProgress {
    pub id: ParticipantId,
    pub acknowledged: LogIndex,
    pub in_flight: bool,
}

/// Status snapshot of a leader, for higher layers.
#[derive(Debug, Clone)]
pub struct LeaderStatus {
    pub term: LogTerm,
    pub last_index: LogIndex,
    pub persisted_index: LogIndex,
    pub commit_index: LogIndex,
    pub followers: Vec<FollowerProgress>,
}

struct LeaderState {
    core: LogCore,
    followers: HashMap<ParticipantId, FollowerState>,
    /// Highest locally persisted index (the leader's own acknowledgment).
    persisted: LogIndex,
    /// Consecutive failed persistence attempts.
    retries: u32,
    /// A run step is already queued.
    run_scheduled: bool,
}

struct LeaderInner {
    config: LeaderConfig,
    scheduler: Arc<dyn Scheduler>,
    transport: Arc<dyn LogTransport>,
    state: Mutex<LeaderState>,
}

/// The leader role of one shard's replicated log.
///
/// Cheap to clone; all clones share the same log instance.
#[derive(Clone)]
pub struct LogLeader {
    inner: Arc<LeaderInner>,
}

impl LogLeader {
    /// Establishes leadership over `store` for `config.term`.
    ///
    /// The store is held for the lifetime of this log instance. Followers
    /// start unacknowledged and are brought up to date by contiguous replay
    /// from index 1 (or from their first acknowledgment).
    pub fn new(
        config: LeaderConfig,
        store: Arc<dyn PersistedLog>,
        scheduler: Arc<dyn Scheduler>,
        transport: Arc<dyn LogTransport>,
    ) -> Result<Self, LogError> {
        let replicas = config.followers.len() + 1;
        if config.quorum_size == 0 || config.quorum_size > replicas {
            return Err(LogError::InvalidConfig {
                reason: format!(
                    "quorum size {} out of range 1..={}",
                    config.quorum_size, replicas
                ),
            });
        }
        let distinct: HashSet<&ParticipantId> = config.followers.iter().collect();
        if distinct.len() != config.followers.len() || distinct.contains(&config.id) {
            return Err(LogError::InvalidConfig {
                reason: "replica set contains duplicates".to_string(),
            });
        }

        let followers = config
            .followers
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    FollowerState {
                        id: id.clone(),
                        acknowledged: LogIndex::ZERO,
                        next_index: LogIndex(1),
                        sent_commit: LogIndex::ZERO,
                        in_flight: false,
                    },
                )
            })
            .collect();

        let persisted = store.last_index();
        let core = LogCore::new(store, config.term);

        tracing::info!(
            term = %config.term,
            replicas,
            quorum = config.quorum_size,
            persisted = %persisted,
            "log leader established"
        );

        let leader = Self {
            inner: Arc::new(LeaderInner {
                config,
                scheduler,
                transport,
                state: Mutex::new(LeaderState {
                    core,
                    followers,
                    persisted,
                    retries: 0,
                    run_scheduled: false,
                }),
            }),
        };

        // Bring followers up to date with whatever the store already holds.
        Self::schedule_run(&leader.inner);
        Ok(leader)
    }

    /// Appends a payload at `(term, last_index + 1)` and returns its index
    /// immediately, without waiting for persistence or replication.
    pub fn insert(&self, payload: LogPayload) -> Result<LogIndex, LogError> {
        let index = {
            let mut st = self.inner.state.lock();
            st.core.check_operational()?;
            st.core.append_tail(payload)
        };
        Self::schedule_run(&self.inner);
        Ok(index)
    }

    /// Resolves once the commit index reaches `index`.
    pub fn wait_for(&self, index: LogIndex) -> WaitForFuture {
        self.inner.state.lock().core.wait_for(index)
    }

    /// Scans persisted entries from `from`. Entries still only in the
    /// in-memory tail are not visible.
    pub fn read(&self, from: LogIndex) -> LogReader {
        let store = self.inner.state.lock().core.store.clone();
        LogReader::new(store, from)
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.state.lock().core.commit_index
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.state.lock().core.last_index
    }

    pub fn term(&self) -> LogTerm {
        self.inner.config.term
    }

    pub fn id(&self) -> &ParticipantId {
        &self.inner.config.id
    }

    /// Snapshot of the leader's replication progress.
    pub fn status(&self) -> LeaderStatus {
        let st = self.inner.state.lock();
        let mut followers: Vec<FollowerProgress> = st
            .followers
            .values()
            .map(|f| FollowerProgress {
                id: f.id.clone(),
                acknowledged: f.acknowledged,
                in_flight: f.in_flight,
            })
            .collect();
        followers.sort_by(|a, b| a.id.cmp(&b.id));
        LeaderStatus {
            term: st.core.term,
            last_index: st.core.last_index,
            persisted_index: st.persisted,
            commit_index: st.core.commit_index,
            followers,
        }
    }

    /// Closes the log: rejects further inserts and fails all pending
    /// waiters. In-flight work items observe the closed state and bail;
    /// the store handle is released once the last reference drops.
    pub fn shutdown(&self) {
        self.inner.state.lock().core.close();
    }

    fn schedule_run(inner: &Arc<LeaderInner>) {
        {
            let mut st = inner.state.lock();
            if st.run_scheduled || st.core.check_operational().is_err() {
                return;
            }
            st.run_scheduled = true;
        }
        let run_inner = inner.clone();
        inner
            .scheduler
            .queue(Box::new(move || Self::run_once(&run_inner)));
    }

    /// One persist + dispatch step. Always executes on the scheduler, never
    /// on a caller's thread.
    fn run_once(inner: &Arc<LeaderInner>) {
        let mut st = inner.state.lock();
        st.run_scheduled = false;
        if st.core.check_operational().is_err() {
            return;
        }

        // Persist the pending tail. The state lock is released across the
        // store call: appends may fsync, and inserts must never wait on
        // store I/O. Entries keep their indices across retries; the store
        // skips what an earlier attempt already wrote.
        let pending = st.core.unpersisted();
        if !pending.is_empty() {
            let last = pending[pending.len() - 1].index;
            let store = st.core.store.clone();
            drop(st);
            let result = store.append(pending);

            st = inner.state.lock();
            if st.core.check_operational().is_err() {
                return;
            }
            match result {
                Ok(()) => {
                    if last > st.persisted {
                        st.persisted = last;
                    }
                    st.core.drop_tail_through(last);
                    st.retries = 0;
                    tracing::debug!(persisted = %last, "tail persisted");
                }
                Err(err) if err.is_retryable() && st.retries < inner.config.max_persist_retries => {
                    st.retries += 1;
                    tracing::warn!(
                        error = %err,
                        attempt = st.retries,
                        max = inner.config.max_persist_retries,
                        "local persistence failed, retrying"
                    );
                    drop(st);
                    let retry_inner = inner.clone();
                    inner
                        .scheduler
                        .queue_delayed(
                            "leader-persist-retry",
                            inner.config.retry_delay,
                            Box::new(move |canceled| {
                                if !canceled {
                                    Self::run_once(&retry_inner);
                                }
                            }),
                        )
                        .detach();
                    return;
                }
                Err(err) => {
                    st.core.make_broken(format!("local persistence failed: {err}"));
                    return;
                }
            }
        }

        Self::recompute_commit(inner, &mut st);

        // Dispatch to followers that are behind, or that have not yet seen
        // the current commit index.
        let store = st.core.store.clone();
        let persisted = st.persisted;
        let commit_index = st.core.commit_index;
        let mut dispatches = Vec::new();
        let mut stalled_reads = false;

        for follower in st.followers.values_mut() {
            if follower.in_flight {
                continue;
            }
            let behind = follower.next_index <= persisted;
            if !behind && follower.sent_commit >= commit_index {
                continue;
            }

            let mut entries = Vec::new();
            if behind {
                let mut read_failed = false;
                for result in store.read_from(follower.next_index) {
                    match result {
                        Ok(entry) if entry.index > persisted => break,
                        Ok(entry) => {
                            entries.push(entry);
                            if entries.len() >= MAX_APPEND_BATCH {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                follower = %follower.id,
                                error = %err,
                                "failed to read entries for dispatch"
                            );
                            read_failed = true;
                            break;
                        }
                    }
                }
                if read_failed {
                    stalled_reads = true;
                    continue;
                }
            }

            follower.in_flight = true;
            follower.sent_commit = commit_index;
            let prev_index = follower.next_index.prev().unwrap_or(LogIndex::ZERO);
            dispatches.push((
                follower.id.clone(),
                AppendEntriesRequest {
                    term: inner.config.term,
                    leader: inner.config.id.clone(),
                    prev_index,
                    entries,
                    commit_index,
                },
            ));
        }
        drop(st);

        for (follower_id, request) in dispatches {
            tracing::trace!(
                follower = %follower_id,
                first = ?request.first_index(),
                last = ?request.last_index(),
                "dispatching append entries"
            );
            let cb_inner = inner.clone();
            let cb_follower = follower_id.clone();
            inner.transport.send_append_entries(
                &follower_id,
                request,
                Box::new(move |response| {
                    Self::handle_append_response(&cb_inner, &cb_follower, response);
                }),
            );
        }

        // A failed dispatch read leaves the follower behind with nothing
        // in flight; retry the run rather than waiting for an unrelated
        // insert or ack.
        if stalled_reads {
            let retry_inner = inner.clone();
            inner
                .scheduler
                .queue_delayed(
                    "leader-dispatch-retry",
                    inner.config.retry_delay,
                    Box::new(move |canceled| {
                        if !canceled {
                            Self::run_once(&retry_inner);
                        }
                    }),
                )
                .detach();
        }
    }

    fn handle_append_response(
        inner: &Arc<LeaderInner>,
        follower_id: &ParticipantId,
        response: AppendEntriesResponse,
    ) {
        let mut st = inner.state.lock();
        if st.core.check_operational().is_err() {
            return;
        }
        let Some(follower) = st.followers.get_mut(follower_id) else {
            tracing::warn!(follower = %follower_id, "response from unknown follower");
            return;
        };
        follower.in_flight = false;

        match response.outcome {
            AppendOutcome::Accepted { acknowledged } => {
                // Acknowledgments may arrive out of order; only monotonic
                // advancement is applied.
                if acknowledged > follower.acknowledged {
                    follower.acknowledged = acknowledged;
                } else if acknowledged < follower.acknowledged {
                    tracing::trace!(
                        follower = %follower_id,
                        stale = %acknowledged,
                        current = %follower.acknowledged,
                        "stale acknowledgment ignored"
                    );
                }
                if acknowledged.next() > follower.next_index {
                    follower.next_index = acknowledged.next();
                }
                Self::recompute_commit(inner, &mut st);
            }
            AppendOutcome::Rejected { retransmit_from } => {
                tracing::debug!(
                    follower = %follower_id,
                    retransmit_from = %retransmit_from,
                    "follower requested retransmission"
                );
                follower.next_index = retransmit_from;
            }
            AppendOutcome::TermMismatch { current } => {
                tracing::warn!(
                    term = %inner.config.term,
                    superseded_by = %current,
                    "leadership superseded, closing log"
                );
                st.core.close();
                return;
            }
        }

        let persisted = st.persisted;
        let commit_index = st.core.commit_index;
        let more = !st.core.tail.is_empty()
            || st.followers.values().any(|f| {
                !f.in_flight && (f.next_index <= persisted || f.sent_commit < commit_index)
            });
        drop(st);

        if more {
            Self::schedule_run(inner);
        }
    }

    /// Recomputes the commit index: the highest index acknowledged by at
    /// least `quorum_size` replicas, the leader's own persisted prefix
    /// counting as its acknowledgment.
    fn recompute_commit(inner: &Arc<LeaderInner>, st: &mut LeaderState) {
        let mut acked: Vec<u64> = st.followers.values().map(|f| f.acknowledged.0).collect();
        acked.push(st.persisted.0);
        acked.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = LogIndex(acked[inner.config.quorum_size - 1]);
        if candidate > st.core.commit_index {
            st.core.advance_commit(candidate);
        }
    }
}
