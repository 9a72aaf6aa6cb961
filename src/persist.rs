//! The persistence seam.
//!
//! The consensus core persists the tuple `(current_term, voted_for, log)` through a
//! [`Persister`] before any externally-visible effect of a transition that changed it: a vote
//! is durable before the response granting it leaves the peer, an appended entry is durable
//! before it is acknowledged. The blob layout is a [`bincode`] encoding of
//! [`PersistentState`]; decoding must be exact and any error aborts startup.
//!
//! The snapshot blob travels alongside the state blob so a service-initiated snapshot and the
//! consensus state are stored through a single seam; interpreting the snapshot is the
//! service's concern.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::RaftLog;
use crate::message::{LogEntry, Term};

/// Synchronous durable storage for one peer's persistent state.
///
/// `save` must not return before the blobs are durable; the consensus core calls it while
/// holding its state lock, before any RPC reply or vote leaves the peer.
pub trait Persister: Send {
    /// Durably stores the state blob and the snapshot blob together.
    fn save(&self, state: Bytes, snapshot: Bytes) -> io::Result<()>;

    /// Returns the last saved state blob; empty if nothing was ever saved.
    fn load(&self) -> io::Result<Bytes>;

    /// Returns the last saved snapshot blob; empty if nothing was ever saved.
    fn load_snapshot(&self) -> io::Result<Bytes>;
}

/// The persistent subset of a peer's state, as held by the encoded blob.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PersistentState {
    /// The latest term this peer has seen.
    pub current_term: Term,

    /// The peer voted for in `current_term`, if any.
    pub voted_for: Option<usize>,

    /// Every log entry, sentinel included.
    pub entries: Vec<LogEntry>,
}

/// An error restoring persistent state during construction.
#[derive(Debug)]
pub enum PersistError {
    /// The storage backend failed to produce the blob.
    Load(io::Error),

    /// The blob did not decode to a [`PersistentState`].
    Decode(bincode::Error),

    /// The blob decoded, but its content cannot be a valid peer state.
    Corrupt(&'static str),
}

impl PersistentState {
    pub(crate) fn capture(current_term: Term, voted_for: Option<usize>, log: &RaftLog) -> Self {
        Self {
            current_term,
            voted_for,
            entries: log.entries().to_vec(),
        }
    }

    /// Encodes this state into the blob handed to [`Persister::save`].
    pub fn encode(&self) -> Bytes {
        let blob = bincode::serialize(self)
            .unwrap_or_else(|err| panic!("raft state failed to encode: {}", err));
        Bytes::from(blob)
    }

    /// Decodes a blob previously produced by [`encode`](Self::encode).
    pub fn decode(blob: &[u8]) -> Result<Self, PersistError> {
        let state: Self = bincode::deserialize(blob).map_err(PersistError::Decode)?;
        if state.entries.is_empty() {
            return Err(PersistError::Corrupt("persisted log is missing its sentinel"));
        }
        if state.entries[0].term != Term::default() {
            return Err(PersistError::Corrupt("persisted sentinel has a nonzero term"));
        }
        Ok(state)
    }
}

//
// PersistError impls
//

impl fmt::Display for PersistError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistError::Load(err) => write!(fmt, "failed to load persisted state: {}", err),
            PersistError::Decode(err) => write!(fmt, "failed to decode persisted state: {}", err),
            PersistError::Corrupt(what) => write!(fmt, "persisted state is corrupt: {}", what),
        }
    }
}

impl Error for PersistError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PersistError::Load(err) => Some(err),
            PersistError::Decode(err) => Some(err),
            PersistError::Corrupt(_) => None,
        }
    }
}

/// An in-memory [`Persister`], primarily for testing.
///
/// Clones share the same backing storage, so a "restarted" peer can be handed a clone of the
/// persister its predecessor wrote through.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    blobs: Arc<Mutex<(Bytes, Bytes)>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the state blob directly, bypassing a live peer. Useful to stage a pre-existing
    /// log before constructing a node.
    pub fn seed(&self, state: Bytes) {
        let mut blobs = self.blobs.lock().unwrap();
        blobs.0 = state;
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: Bytes, snapshot: Bytes) -> io::Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        *blobs = (state, snapshot);
        Ok(())
    }

    fn load(&self) -> io::Result<Bytes> {
        Ok(self.blobs.lock().unwrap().0.clone())
    }

    fn load_snapshot(&self) -> io::Result<Bytes> {
        Ok(self.blobs.lock().unwrap().1.clone())
    }
}
