//! # shardlog-core
//!
//! Single-writer replicated log built on `shardlog-wal`.
//!
//! Each shard's log has exactly one leader per term and any number of
//! followers. The leader accepts appends, persists them locally, and
//! replicates them to followers over a pluggable transport; an entry is
//! committed once a quorum of replicas (leader included) holds it durably.
//!
//! The core owns no threads or timers: all deferred work runs on an injected
//! [`Scheduler`], which makes the full replication protocol single-steppable
//! in tests via [`DeferredScheduler`].

pub mod core;
pub mod error;
pub mod follower;
pub mod leader;
pub mod message;
pub mod scheduler;
pub mod transport;

pub use crate::core::{LogReader, ReplicatedLog, Role, WaitForFuture};
pub use error::LogError;
pub use follower::{FollowerConfig, LogFollower};
pub use leader::{FollowerProgress, LeaderConfig, LeaderStatus, LogLeader};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, AppendOutcome, ParticipantId,
};
pub use scheduler::{
    DeferredScheduler, DelayedFuture, DelayedHandler, Scheduler, TokioScheduler, Work,
    WorkItemHandle,
};
pub use transport::{LogTransport, ResponseCallback};

pub use shardlog_wal::{LogEntry, LogIndex, LogPayload, LogTerm};
