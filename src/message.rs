//! Message and identifier types shared by the consensus core, the transport seam and the
//! persistent state codec.
//!
//! The two RPCs ([`VoteRequest`]/[`VoteResponse`] and [`AppendRequest`]/[`AppendResponse`])
//! define field names and semantics only; how they travel between peers is the concern of the
//! [`Transport`](crate::transport::Transport) implementation.

use core::cmp::Ordering;
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The unique, monotonically-increasing ID for a term of Raft group leadership.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Term(pub u64);

/// A 1-based index into the replicated log.
///
/// [`LogIndex::default()`] is the index of the sentinel entry every log starts with.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct LogIndex(pub u64);

/// An entry in the replicated log.
///
/// An entry does not carry its own index; its index is its position in the log it lives in.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LogEntry {
    /// The term of leadership of the node which appended this log entry.
    pub term: Term,

    /// Arbitrary command data associated with the log entry.
    pub command: Bytes,
}

/// A request to obtain leadership amongst the peers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoteRequest {
    /// The candidacy term this ballot is for.
    pub term: Term,

    /// The peer id of the candidate requesting the vote.
    pub candidate_id: usize,

    /// The log index of the last log entry stored by the candidate.
    pub last_log_idx: LogIndex,

    /// The leadership term of the last log entry stored by the candidate.
    pub last_log_term: Term,
}

/// The response to a [`VoteRequest`], granting or denying leadership.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VoteResponse {
    /// The receiver's current term, for the candidate to update itself.
    pub term: Term,

    /// Whether the [`VoteRequest`] was granted or not.
    pub vote_granted: bool,
}

/// A request to append entries to a peer's log. An empty `entries` list is a heartbeat.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendRequest {
    /// The sender's leadership term.
    pub term: Term,

    /// The peer id of the leader sending this request.
    pub leader_id: usize,

    /// The log index immediately before the index of the first entry in `entries`.
    pub prev_log_idx: LogIndex,

    /// The leadership term of the log entry at `prev_log_idx`.
    pub prev_log_term: Term,

    /// Consecutive log entries to append, starting at `prev_log_idx + 1`.
    pub entries: Vec<LogEntry>,

    /// The highest log index the leader knows to be committed.
    pub leader_commit: LogIndex,
}

/// The response to an [`AppendRequest`], allowing or denying the append.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppendResponse {
    /// The receiver's current term, for the leader to update itself.
    pub term: Term,

    /// Whether the receiver's log contained an entry matching `prev_log_idx`/`prev_log_term`.
    pub success: bool,
}

/// A message delivered on the apply channel as entries become committed.
///
/// Ordinary committed entries arrive with `command_valid` set; the snapshot fields are
/// reserved for the log-compaction machinery, which is outside this crate.
#[derive(Clone, Debug, Default)]
pub struct ApplyMsg {
    pub command_valid: bool,
    pub command: Bytes,
    pub command_index: LogIndex,

    pub snapshot_valid: bool,
    pub snapshot: Bytes,
    pub snapshot_term: Term,
    pub snapshot_index: LogIndex,
}

//
// Term impls
//

impl fmt::Display for Term {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        fmt.debug_tuple("Term").field(id).finish()
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl AddAssign<u64> for Term {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.checked_add(rhs).unwrap_or_else(|| panic!("overflow"));
    }
}

//
// LogIndex impls
//

impl LogIndex {
    /// Subtraction with a non-negative integer, checking for overflow. Returns `self - dec`,
    /// or `None` if an overflow occurred.
    pub fn checked_sub(self, dec: u64) -> Option<Self> {
        self.0.checked_sub(dec).map(Self)
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self(id) = self;
        fmt.debug_tuple("LogIdx").field(id).finish()
    }
}

impl PartialOrd for LogIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for LogIndex {
    type Output = Self;
    fn add(self, inc: u64) -> Self {
        Self(self.0.checked_add(inc).unwrap_or_else(|| panic!("overflow")))
    }
}

impl Sub<u64> for LogIndex {
    type Output = Self;
    fn sub(self, dec: u64) -> Self {
        Self(self.0.saturating_sub(dec))
    }
}

//
// VoteRequest impls
//

impl fmt::Display for VoteRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            term,
            candidate_id,
            last_log_idx,
            last_log_term,
        } = self;
        fmt.debug_struct("VoteRequest")
            .field("term", &format_args!("{}", term))
            .field("candidate_id", candidate_id)
            .field("last_log_idx", &format_args!("{}", last_log_idx))
            .field("last_log_term", &format_args!("{}", last_log_term))
            .finish()
    }
}

//
// VoteResponse impls
//

impl fmt::Display for VoteResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, vote_granted } = self;
        fmt.debug_struct("VoteResponse")
            .field("term", &format_args!("{}", term))
            .field("vote_granted", vote_granted)
            .finish()
    }
}

//
// AppendRequest impls
//

impl fmt::Display for AppendRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            term,
            leader_id,
            prev_log_idx,
            prev_log_term,
            entries,
            leader_commit,
        } = self;
        fmt.debug_struct("AppendRequest")
            .field("term", &format_args!("{}", term))
            .field("leader_id", leader_id)
            .field("prev_log_idx", &format_args!("{}", prev_log_idx))
            .field("prev_log_term", &format_args!("{}", prev_log_term))
            .field("entries", &entries.len())
            .field("leader_commit", &format_args!("{}", leader_commit))
            .finish()
    }
}

//
// AppendResponse impls
//

impl fmt::Display for AppendResponse {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { term, success } = self;
        fmt.debug_struct("AppendResponse")
            .field("term", &format_args!("{}", term))
            .field("success", success)
            .finish()
    }
}

//
// ApplyMsg impls
//

impl ApplyMsg {
    /// An apply message carrying one committed command.
    pub fn command(command_index: LogIndex, command: Bytes) -> Self {
        Self {
            command_valid: true,
            command,
            command_index,
            ..Self::default()
        }
    }
}

impl fmt::Display for ApplyMsg {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.command_valid {
            fmt.debug_struct("ApplyMsg")
                .field("command_index", &format_args!("{}", &self.command_index))
                .field("command", &self.command.len())
                .finish()
        } else {
            fmt.debug_struct("ApplyMsg")
                .field("snapshot_index", &format_args!("{}", &self.snapshot_index))
                .field("snapshot_term", &format_args!("{}", &self.snapshot_term))
                .field("snapshot", &self.snapshot.len())
                .finish()
        }
    }
}
