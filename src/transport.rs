//! The RPC seam between peers.

use crate::message::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};

/// A bidirectional, unreliable message channel to the other peers of the group.
///
/// The embedding service supplies one implementation per peer; `to` is the destination peer
/// id. A call blocks until a response arrives or the implementation gives up, returning
/// `None` for "not delivered"; the caller never retries a lost send directly, the next timer
/// tick subsumes the retry. Messages may be arbitrarily delayed, reordered or duplicated in
/// flight; the consensus handlers tolerate all three.
///
/// Calls are issued from short-lived dispatch threads, never while the peer's state lock is
/// held, so a slow destination only ever delays traffic to itself.
pub trait Transport: Send + Sync {
    /// Requests a vote from peer `to`.
    fn request_vote(&self, to: usize, request: &VoteRequest) -> Option<VoteResponse>;

    /// Sends a (possibly empty) run of log entries to peer `to`.
    fn append_entries(&self, to: usize, request: &AppendRequest) -> Option<AppendResponse>;
}
