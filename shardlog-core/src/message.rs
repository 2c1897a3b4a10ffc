//! Logical replication messages.
//!
//! These types define the contents exchanged between a leader and its
//! followers. Wire framing, retries, and connection management belong to the
//! external transport layer.

use serde::{Deserialize, Serialize};
use shardlog_wal::{LogEntry, LogIndex, LogTerm};
use std::fmt;

/// Identity of one replica in a log's replication set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Append request from a leader to one follower.
///
/// `entries` is a contiguous run starting at `prev_index + 1`. An empty run
/// is valid and carries only the commit index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: LogTerm,

    /// The sending leader.
    pub leader: ParticipantId,

    /// Index immediately before `entries` (0 when the run starts the log).
    pub prev_index: LogIndex,

    /// Contiguous entries to persist.
    pub entries: Vec<LogEntry>,

    /// The leader's commit index, piggybacked so follower-side waiters
    /// resolve without an extra round trip.
    pub commit_index: LogIndex,
}

impl AppendEntriesRequest {
    /// Index of the first carried entry, if any.
    pub fn first_index(&self) -> Option<LogIndex> {
        self.entries.first().map(|e| e.index)
    }

    /// Index of the last carried entry, if any.
    pub fn last_index(&self) -> Option<LogIndex> {
        self.entries.last().map(|e| e.index)
    }
}

/// Follower's acknowledgment of an append request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding follower.
    pub follower: ParticipantId,

    /// The follower's current term.
    pub term: LogTerm,

    pub outcome: AppendOutcome,
}

/// Result of applying an append request on a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppendOutcome {
    /// Entries persisted; everything up to `acknowledged` is durable on this
    /// follower.
    Accepted { acknowledged: LogIndex },

    /// The run did not connect to the follower's log; the leader must resend
    /// starting at `retransmit_from`.
    Rejected { retransmit_from: LogIndex },

    /// The request's term is older than the follower's.
    TermMismatch { current: LogTerm },
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardlog_wal::LogPayload;

    #[test]
    fn test_request_index_accessors() {
        let entries = vec![
            LogEntry::new(LogTerm(1), LogIndex(4), LogPayload::from("a")),
            LogEntry::new(LogTerm(1), LogIndex(5), LogPayload::from("b")),
        ];
        let req = AppendEntriesRequest {
            term: LogTerm(1),
            leader: ParticipantId::from("leader"),
            prev_index: LogIndex(3),
            entries,
            commit_index: LogIndex(2),
        };
        assert_eq!(req.first_index(), Some(LogIndex(4)));
        assert_eq!(req.last_index(), Some(LogIndex(5)));

        let empty = AppendEntriesRequest {
            entries: Vec::new(),
            ..req
        };
        assert_eq!(empty.first_index(), None);
        assert_eq!(empty.last_index(), None);
    }

    #[test]
    fn test_outcome_equality() {
        assert_eq!(
            AppendOutcome::Accepted {
                acknowledged: LogIndex(3)
            },
            AppendOutcome::Accepted {
                acknowledged: LogIndex(3)
            }
        );
        assert_ne!(
            AppendOutcome::Accepted {
                acknowledged: LogIndex(3)
            },
            AppendOutcome::Rejected {
                retransmit_from: LogIndex(3)
            }
        );
    }
}
