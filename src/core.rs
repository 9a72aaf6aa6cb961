//! The state core: every mutable field of one peer and the primitive transitions over them.
//!
//! All methods take `&mut self`; the single mutex in [`node`](crate::node) serializes every
//! caller, so invariants only need to hold at method boundaries. Methods never call out to
//! the transport or the apply channel; they return what the runtime should do next instead.
//!
//! Any method handling an inbound message applies the common term rule first
//! ([`State::observe_term`]): a message term above ours means we adopt it, clear our vote and
//! fall back to follower before per-message handling, for requests and responses alike.

use std::collections::BTreeSet;
use std::time::Instant;

use bytes::Bytes;
use log::{debug, info, warn};

use crate::config::Config;
use crate::log::RaftLog;
use crate::message::{
    AppendRequest, AppendResponse, LogEntry, LogIndex, Term, VoteRequest, VoteResponse,
};
use crate::persist::{PersistError, PersistentState, Persister};

/// The role a peer currently plays, with the bookkeeping that only exists in that role.
pub(crate) enum Role {
    Follower,
    Candidate {
        /// Ids of the peers whose grant we hold this candidacy, ourselves included.
        votes_granted: BTreeSet<usize>,
    },
    Leader {
        /// Per peer, the next log index to send.
        next_idx: Vec<LogIndex>,
        /// Per peer, the highest log index known replicated there. Our own slot tracks our
        /// last log index.
        match_idx: Vec<LogIndex>,
    },
}

/// What a replication dispatch thread should do after a reply was handled.
pub(crate) enum ReplyAction {
    /// The follower rejected the consistency check; probe again one entry further back.
    Retry,
    /// Done with this follower until the next heartbeat.
    Stop,
}

pub(crate) struct State {
    pub me: usize,
    pub peer_count: usize,
    pub config: Config,

    pub role: Role,

    // persistent subset, saved before any externally-visible effect
    pub current_term: Term,
    pub voted_for: Option<usize>,
    pub log: RaftLog,

    // volatile
    pub commit_idx: LogIndex,
    pub last_applied: LogIndex,
    pub election_deadline: Instant,
    pub heartbeat_deadline: Instant,

    persister: Box<dyn Persister>,
    snapshot: Bytes,
}

impl State {
    /// Restores a peer from whatever its persister holds; an empty persister yields a fresh
    /// follower at term 0.
    pub fn new(
        me: usize,
        peer_count: usize,
        config: Config,
        persister: Box<dyn Persister>,
    ) -> Result<Self, PersistError> {
        let blob = persister.load().map_err(PersistError::Load)?;
        let snapshot = persister.load_snapshot().map_err(PersistError::Load)?;
        let (current_term, voted_for, log) = if blob.is_empty() {
            (Term::default(), None, RaftLog::new())
        } else {
            let state = PersistentState::decode(&blob)?;
            info!(
                "restored state at {} with {} entries",
                &state.current_term,
                state.entries.len() - 1
            );
            (
                state.current_term,
                state.voted_for,
                RaftLog::restore(state.entries),
            )
        };

        let now = Instant::now();
        Ok(Self {
            me,
            peer_count,
            role: Role::Follower,
            current_term,
            voted_for,
            log,
            commit_idx: LogIndex::default(),
            last_applied: LogIndex::default(),
            election_deadline: now + config.random_election_timeout(),
            heartbeat_deadline: now + config.heartbeat_interval,
            config,
            persister,
            snapshot,
        })
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn majority(&self) -> usize {
        self.peer_count / 2 + 1
    }

    /// Defers the election timeout by a fresh randomized lapse.
    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    /// Saves the persistent subset through the persister. Called before the lock is released
    /// on any transition that touched `current_term`, `voted_for` or the log. A peer that
    /// cannot write durable state cannot safely keep running, so a storage failure is fatal.
    fn persist(&self) {
        let blob = PersistentState::capture(self.current_term, self.voted_for, &self.log).encode();
        if let Err(err) = self.persister.save(blob, self.snapshot.clone()) {
            panic!("cannot continue without durable state: {}", err);
        }
    }

    /// The common term rule: a message term above ours makes us a follower of that term with
    /// a cleared vote, before any per-message handling.
    pub fn observe_term(&mut self, term: Term, from: usize) {
        if term > self.current_term {
            info!(
                "became follower at {} (from {}) due to message from {}",
                &term, &self.current_term, from
            );
            self.current_term = term;
            self.voted_for = None;
            self.role = Role::Follower;
            self.persist();
        }
    }

    //
    // election
    //

    /// Opens a new candidacy: bumps the term, votes for ourselves and defers the election
    /// timeout. Returns the ballot to broadcast.
    pub fn start_election(&mut self) -> VoteRequest {
        self.current_term += 1;
        self.voted_for = Some(self.me);
        let votes_granted = std::iter::once(self.me).collect();
        self.role = Role::Candidate { votes_granted };
        self.persist();
        self.reset_election_timer();
        info!("became candidate at {}", &self.current_term);

        VoteRequest {
            term: self.current_term,
            candidate_id: self.me,
            last_log_idx: self.log.last_index(),
            last_log_term: self.log.last_term(),
        }
    }

    pub fn handle_vote_request(&mut self, request: &VoteRequest) -> VoteResponse {
        self.observe_term(request.term, request.candidate_id);
        if request.term < self.current_term {
            info!(
                "ignored message with {} < current {}: {}",
                &request.term, &self.current_term, request
            );
            return VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }

        // request.term == current_term from here on
        let can_vote = self
            .voted_for
            .map(|vote| vote == request.candidate_id)
            .unwrap_or(true);
        let log_ok = self
            .log
            .other_is_up_to_date(request.last_log_idx, request.last_log_term);
        let grant = can_vote && log_ok;

        if grant {
            info!(
                "granted vote at {} with {} at {} for node {} with {} at {}",
                &self.current_term,
                &self.log.last_index(),
                &self.log.last_term(),
                &request.candidate_id,
                &request.last_log_idx,
                &request.last_log_term
            );
            self.voted_for = Some(request.candidate_id);
            self.persist();
            self.reset_election_timer();
        } else if let Some(vote) = self.voted_for {
            info!(
                "rejected vote at {} for node {} as already voted for {}",
                &self.current_term, &request.candidate_id, vote
            );
        } else {
            info!(
                "rejected vote at {} with {} at {} for node {} with {} at {}",
                &self.current_term,
                &self.log.last_index(),
                &self.log.last_term(),
                &request.candidate_id,
                &request.last_log_idx,
                &request.last_log_term
            );
        }

        VoteResponse {
            term: self.current_term,
            vote_granted: grant,
        }
    }

    /// Tallies one ballot response. Returns true if this response made us leader, in which
    /// case the heartbeat deadline has been pulled to "now" and the ticker wants waking.
    pub fn handle_vote_response(
        &mut self,
        ballot: Term,
        from: usize,
        response: &VoteResponse,
    ) -> bool {
        self.observe_term(response.term, from);
        if self.current_term != ballot {
            debug!(
                "ignored ballot response for {} at {}: {}",
                &ballot, &self.current_term, response
            );
            return false;
        }

        let majority = self.majority();
        let won = match &mut self.role {
            Role::Candidate { votes_granted } if response.vote_granted => {
                info!("received vote granted from {} at {}", &from, &self.current_term);
                votes_granted.insert(from);
                votes_granted.len() >= majority
            }
            Role::Candidate { .. } => {
                info!("received vote rejected from {} at {}", &from, &self.current_term);
                false
            }
            _ => false,
        };
        if won {
            self.become_leader();
        }
        won
    }

    fn become_leader(&mut self) {
        info!("became leader at {}", &self.current_term);
        let last = self.log.last_index();
        let next_idx = vec![last + 1; self.peer_count];
        let mut match_idx = vec![LogIndex::default(); self.peer_count];
        match_idx[self.me] = last;
        self.role = Role::Leader {
            next_idx,
            match_idx,
        };
        // the first (empty) broadcast goes out as soon as the ticker wakes
        self.heartbeat_deadline = Instant::now();
    }

    //
    // replication
    //

    /// Snapshots the append arguments for one follower: everything from its `next_idx` to the
    /// end of our log, possibly nothing (a heartbeat). `None` once we are no longer leader.
    pub fn append_args_for(&self, peer: usize) -> Option<AppendRequest> {
        let next_idx = match &self.role {
            Role::Leader { next_idx, .. } => next_idx[peer],
            _ => return None,
        };
        let prev_log_idx = next_idx - 1;
        let prev_log_term = self.log.term_at(prev_log_idx)?;

        Some(AppendRequest {
            term: self.current_term,
            leader_id: self.me,
            prev_log_idx,
            prev_log_term,
            entries: self.log.tail(next_idx).to_vec(),
            leader_commit: self.commit_idx,
        })
    }

    /// Handles an inbound append from a leader. The second return value is true when the
    /// commit index advanced and the apply pump wants signalling.
    pub fn handle_append_request(&mut self, request: &AppendRequest) -> (AppendResponse, bool) {
        self.observe_term(request.term, request.leader_id);
        if request.term < self.current_term {
            info!(
                "ignored message with {} < current {}: {}",
                &request.term, &self.current_term, request
            );
            return (
                AppendResponse {
                    term: self.current_term,
                    success: false,
                },
                false,
            );
        }

        // a live leader of our own term: a candidate concedes, and everyone defers the
        // election timeout
        match &self.role {
            Role::Candidate { .. } => {
                info!(
                    "became follower at {} of {}",
                    &self.current_term, &request.leader_id
                );
                self.role = Role::Follower;
            }
            Role::Leader { .. } => {
                panic!(
                    "two leaders at {}: us and {}",
                    &self.current_term, &request.leader_id
                );
            }
            Role::Follower => (),
        }
        self.reset_election_timer();

        // consistency check against the entry preceding the run
        let our_prev_term = self.log.term_at(request.prev_log_idx);
        if our_prev_term != Some(request.prev_log_term) {
            match our_prev_term {
                Some(term) => warn!(
                    "rejected append from {} with {} at {}, we have {}",
                    &request.leader_id, &request.prev_log_idx, &request.prev_log_term, &term
                ),
                None => info!(
                    "rejected append from {} with {}, we are behind at {}",
                    &request.leader_id,
                    &request.prev_log_idx,
                    self.log.last_index()
                ),
            }
            return (
                AppendResponse {
                    term: self.current_term,
                    success: false,
                },
                false,
            );
        }

        // walk the run: entries already matching stay untouched so a retransmitted request is
        // idempotent; the first conflicting term truncates that entry and everything after
        let mut changed = false;
        for (offset, entry) in request.entries.iter().enumerate() {
            let idx = request.prev_log_idx + (offset as u64 + 1);
            match self.log.term_at(idx) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    assert!(idx > self.commit_idx, "conflict at or below the commit index");
                    self.log.truncate_from(idx);
                    self.log.append(entry.clone());
                    changed = true;
                }
                None => {
                    self.log.append(entry.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.persist();
        }

        // the leader's commit only proves entries it actually sent us
        let last_new = request.prev_log_idx + request.entries.len() as u64;
        let leader_commit = request.leader_commit.min(last_new);
        let mut signal_apply = false;
        if leader_commit > self.commit_idx {
            debug!(
                "committed entries from {} to {}",
                &self.commit_idx, &leader_commit
            );
            self.commit_idx = leader_commit;
            signal_apply = true;
        }

        (
            AppendResponse {
                term: self.current_term,
                success: true,
            },
            signal_apply,
        )
    }

    /// Handles a follower's reply to an append issued at term `issued` covering `sent`
    /// entries after `prev`. The second return value is true when the commit index advanced.
    pub fn handle_append_response(
        &mut self,
        peer: usize,
        issued: Term,
        prev: LogIndex,
        sent: usize,
        response: &AppendResponse,
    ) -> (ReplyAction, bool) {
        self.observe_term(response.term, peer);
        if self.current_term != issued || !self.is_leader() {
            debug!(
                "ignored append response for {} at {}: {}",
                &issued, &self.current_term, response
            );
            return (ReplyAction::Stop, false);
        }

        if response.success {
            let replicated = prev + sent as u64;
            if let Role::Leader {
                next_idx,
                match_idx,
            } = &mut self.role
            {
                // both advance monotonically; a reordered older reply must not move them back
                if replicated > match_idx[peer] {
                    match_idx[peer] = replicated;
                }
                if replicated + 1 > next_idx[peer] {
                    next_idx[peer] = replicated + 1;
                }
            }
            let advanced = self.advance_commit_idx();
            (ReplyAction::Stop, advanced)
        } else {
            // pure log mismatch: probe one entry further back and try again
            if let Role::Leader { next_idx, .. } = &mut self.role {
                info!(
                    "received append rejection at {} from {}",
                    &next_idx[peer], &peer
                );
                next_idx[peer] = (next_idx[peer] - 1).max(LogIndex(1));
            }
            (ReplyAction::Retry, false)
        }
    }

    /// Advances the commit index to the highest log index replicated on a majority, but only
    /// once that index holds an entry of the current term. An entry from an earlier term is
    /// never committed by counting alone; it commits transitively under a current-term entry.
    fn advance_commit_idx(&mut self) -> bool {
        let agree_idx = match &self.role {
            Role::Leader { match_idx, .. } => {
                let mut match_idxs = match_idx.clone();
                match_idxs.sort_unstable();
                match_idxs[self.peer_count - self.majority()]
            }
            _ => return false,
        };

        if agree_idx > self.commit_idx && self.log.term_at(agree_idx) == Some(self.current_term) {
            debug!(
                "committed entries from {} to {}",
                &self.commit_idx, &agree_idx
            );
            self.commit_idx = agree_idx;
            true
        } else {
            false
        }
    }

    //
    // service entry points
    //

    /// Appends one command to our log if we lead. Commitment is asynchronous; the entry rides
    /// out on the next heartbeat.
    pub fn start(&mut self, command: Bytes) -> (LogIndex, Term, bool) {
        if !self.is_leader() {
            return (LogIndex::default(), self.current_term, false);
        }

        self.log.append(LogEntry {
            term: self.current_term,
            command,
        });
        let last = self.log.last_index();
        if let Role::Leader { match_idx, .. } = &mut self.role {
            match_idx[self.me] = last;
        }
        self.persist();
        info!("accepted command {} at {}", &last, &self.current_term);

        // a single-peer group commits right here
        self.advance_commit_idx();
        (last, self.current_term, true)
    }

    /// Durably stores a service-produced snapshot blob next to the consensus state. Trimming
    /// the log below `index` is compaction machinery outside this crate.
    pub fn store_snapshot(&mut self, index: LogIndex, snapshot: Bytes) {
        info!("stored service snapshot through {}", &index);
        self.snapshot = snapshot;
        self.persist();
    }
}
