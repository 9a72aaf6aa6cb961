//! The runtime around the state core: one exclusive lock plus message-driven threads.
//!
//! Per peer there are two long-running threads (a ticker driving the election and heartbeat
//! timers, and the apply pump draining committed entries to the service channel) plus
//! transient dispatch threads, one per outbound RPC. The critical-section discipline is
//! always the same: lock, snapshot arguments, unlock, send, lock, handle the reply. An
//! outbound RPC is never issued while the lock is held, and the apply pump releases the lock
//! before pushing to the service channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::Sender;
use log::debug;

use crate::config::Config;
use crate::core::{ReplyAction, State};
use crate::message::{
    AppendRequest, AppendResponse, ApplyMsg, LogIndex, Term, VoteRequest, VoteResponse,
};
use crate::persist::{PersistError, Persister};
use crate::transport::Transport;

struct Inner {
    state: Mutex<State>,
    timer_cv: Condvar,
    apply_cv: Condvar,
    dead: AtomicBool,
    transport: Arc<dyn Transport>,
    apply_tx: Sender<ApplyMsg>,
}

/// One consensus peer.
///
/// Cloning is cheap and shares the peer; the embedding service typically keeps one clone for
/// submitting commands and hands another to its RPC server for the inbound handlers.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Creates a peer with the default [`Config`], restores its persistent state and starts
    /// its background threads. Returns promptly; all long-running work happens in the
    /// background.
    ///
    /// `peer_count` is the fixed size of the group and `me` this peer's id in `[0,
    /// peer_count)`. Committed commands are delivered on `apply_tx` in strict index order.
    pub fn new(
        transport: Arc<dyn Transport>,
        peer_count: usize,
        me: usize,
        persister: Box<dyn Persister>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Result<Self, PersistError> {
        Self::with_config(
            Config::default(),
            transport,
            peer_count,
            me,
            persister,
            apply_tx,
        )
    }

    /// Same as [`new`](Self::new) with explicit timer parameters.
    pub fn with_config(
        config: Config,
        transport: Arc<dyn Transport>,
        peer_count: usize,
        me: usize,
        persister: Box<dyn Persister>,
        apply_tx: Sender<ApplyMsg>,
    ) -> Result<Self, PersistError> {
        assert!(me < peer_count, "peer id out of range");
        let state = State::new(me, peer_count, config, persister)?;
        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            timer_cv: Condvar::new(),
            apply_cv: Condvar::new(),
            dead: AtomicBool::new(false),
            transport,
            apply_tx,
        });

        {
            let inner = inner.clone();
            let _ = thread::spawn(move || Self::ticker(inner));
        }
        {
            let inner = inner.clone();
            let _ = thread::spawn(move || Self::apply_pump(inner));
        }

        Ok(Self { inner })
    }

    //
    // embedding API
    //

    /// Submits one command for agreement. Returns `(index, term, true)` with the index the
    /// command will occupy if it ever commits, or `is_leader = false` when this peer does not
    /// currently lead. Never blocks on replication; watch the apply channel for the outcome.
    pub fn start(&self, command: Bytes) -> (LogIndex, Term, bool) {
        let mut state = self.inner.state.lock().unwrap();
        let commit_before = state.commit_idx;
        let started = state.start(command);
        if state.commit_idx > commit_before {
            self.inner.apply_cv.notify_one();
        }
        started
    }

    /// The current term and whether this peer believes it leads.
    pub fn get_state(&self) -> (Term, bool) {
        let state = self.inner.state.lock().unwrap();
        (state.current_term, state.is_leader())
    }

    /// The service informs us it took a snapshot covering the log through `index`. The blob
    /// is stored durably next to the consensus state; log compaction itself is outside this
    /// crate.
    pub fn snapshot(&self, index: LogIndex, snapshot: Bytes) {
        let mut state = self.inner.state.lock().unwrap();
        state.store_snapshot(index, snapshot);
    }

    /// Signals every background thread to exit. Idempotent; outstanding RPCs may still
    /// complete but their replies are discarded.
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
        self.inner.timer_cv.notify_all();
        self.inner.apply_cv.notify_all();
    }

    /// Whether [`kill`](Self::kill) was called.
    pub fn killed(&self) -> bool {
        self.inner.dead.load(Ordering::Relaxed)
    }

    //
    // inbound RPC surface, called by the embedding transport server
    //

    /// Handles a `RequestVote` RPC from a candidate. Holds the lock for the full duration.
    pub fn request_vote(&self, request: VoteRequest) -> VoteResponse {
        let mut state = self.inner.state.lock().unwrap();
        state.handle_vote_request(&request)
    }

    /// Handles an `AppendEntries` RPC from a leader. Holds the lock for the full duration.
    pub fn append_entries(&self, request: AppendRequest) -> AppendResponse {
        let mut state = self.inner.state.lock().unwrap();
        let (response, committed) = state.handle_append_request(&request);
        if committed {
            self.inner.apply_cv.notify_one();
        }
        response
    }

    //
    // background threads
    //

    /// Drives both timers off one multi-way wait: sleep until the earliest deadline, act on
    /// whatever expired, repeat. Handlers that pull a deadline closer (becoming leader does)
    /// poke `timer_cv`, so no expiry is ever missed and spurious wakes are harmless.
    fn ticker(inner: Arc<Inner>) {
        let mut state = inner.state.lock().unwrap();
        while !inner.dead.load(Ordering::Relaxed) {
            let now = Instant::now();

            if now >= state.election_deadline {
                if state.is_leader() {
                    // the election timer is moot while leading; just rearm it
                    state.reset_election_timer();
                } else {
                    let ballot = state.start_election();
                    for peer in Self::other_peers(&state) {
                        let inner = inner.clone();
                        let ballot = ballot.clone();
                        let _ = thread::spawn(move || Self::dispatch_vote(inner, peer, ballot));
                    }
                }
            }

            if now >= state.heartbeat_deadline {
                if state.is_leader() {
                    debug!("sending heartbeats at {}", &state.current_term);
                    for peer in Self::other_peers(&state) {
                        let inner = inner.clone();
                        let _ = thread::spawn(move || Self::dispatch_append(inner, peer));
                    }
                }
                state.heartbeat_deadline = now + state.config.heartbeat_interval;
            }

            let next_deadline = state.election_deadline.min(state.heartbeat_deadline);
            let lapse = next_deadline.saturating_duration_since(Instant::now());
            let (guard, _) = inner.timer_cv.wait_timeout(state, lapse).unwrap();
            state = guard;
        }
    }

    /// Sends one ballot and tallies the response. A lost send is simply dropped; a later
    /// election timeout subsumes the retry.
    fn dispatch_vote(inner: Arc<Inner>, peer: usize, ballot: VoteRequest) {
        let response = match inner.transport.request_vote(peer, &ballot) {
            Some(response) => response,
            None => return,
        };
        if inner.dead.load(Ordering::Relaxed) {
            return;
        }

        let mut state = inner.state.lock().unwrap();
        if state.handle_vote_response(ballot.term, peer, &response) {
            // winning pulled the heartbeat deadline to "now"; wake the ticker to broadcast
            inner.timer_cv.notify_all();
        }
    }

    /// Replicates to one follower until its log matches ours, the send is lost, or the world
    /// moved on. Arguments are snapshotted under the lock and the RPC goes out without it;
    /// a consistency rejection walks `next_idx` back and probes again from this same thread.
    fn dispatch_append(inner: Arc<Inner>, peer: usize) {
        loop {
            if inner.dead.load(Ordering::Relaxed) {
                return;
            }
            let request = {
                let state = inner.state.lock().unwrap();
                match state.append_args_for(peer) {
                    Some(request) => request,
                    // no longer leading; this dispatch is stale
                    None => return,
                }
            };
            let issued = request.term;
            let prev = request.prev_log_idx;
            let sent = request.entries.len();

            let response = match inner.transport.append_entries(peer, &request) {
                Some(response) => response,
                // dropped on the wire; the next heartbeat retries
                None => return,
            };
            if inner.dead.load(Ordering::Relaxed) {
                return;
            }

            let mut state = inner.state.lock().unwrap();
            let (action, committed) =
                state.handle_append_response(peer, issued, prev, sent, &response);
            if committed {
                inner.apply_cv.notify_one();
            }
            match action {
                ReplyAction::Retry => continue,
                ReplyAction::Stop => return,
            }
        }
    }

    /// Streams newly-committed entries to the service channel in strict index order, exactly
    /// once per index per peer lifetime. The signal is coalescing: however many commits piled
    /// up, one pass drains everything committed so far.
    fn apply_pump(inner: Arc<Inner>) {
        let mut state = inner.state.lock().unwrap();
        loop {
            while state.last_applied >= state.commit_idx {
                if inner.dead.load(Ordering::Relaxed) {
                    return;
                }
                state = inner.apply_cv.wait(state).unwrap();
            }
            if inner.dead.load(Ordering::Relaxed) {
                return;
            }

            let from = state.last_applied + 1;
            let to = state.commit_idx;
            let batch: Vec<ApplyMsg> = (from.0..=to.0)
                .map(|idx| {
                    let idx = LogIndex(idx);
                    let entry = state.log.get(idx).expect("committed entry missing from log");
                    ApplyMsg::command(idx, entry.command.clone())
                })
                .collect();
            drop(state);

            // deliver without the lock; the service side may block or be gone already
            for msg in batch {
                debug!("applying {}", &msg);
                let _ = inner.apply_tx.send(msg);
            }

            state = inner.state.lock().unwrap();
            if to > state.last_applied {
                state.last_applied = to;
            }
        }
    }

    fn other_peers(state: &State) -> Vec<usize> {
        let me = state.me;
        (0..state.peer_count).filter(|peer| *peer != me).collect()
    }
}
