//! Transport boundary.
//!
//! Dispatching entries to followers and collecting acknowledgments happens
//! over an external RPC layer. The core only defines the logical exchange;
//! the transport owns framing, connections, and delivery context.

use crate::message::{AppendEntriesRequest, AppendEntriesResponse, ParticipantId};

/// Invoked exactly once with the follower's response.
pub type ResponseCallback = Box<dyn FnOnce(AppendEntriesResponse) + Send + 'static>;

/// Carries append requests from a leader to its followers.
///
/// `send_append_entries` must not block the caller; the response callback may
/// run on any thread. A transport that cannot reach the follower should
/// synthesize a response later (or never); the leader keeps the follower
/// marked in-flight until the callback runs.
pub trait LogTransport: Send + Sync {
    fn send_append_entries(
        &self,
        follower: &ParticipantId,
        request: AppendEntriesRequest,
        on_response: ResponseCallback,
    );
}
