//! The in-memory replicated log.
//!
//! Indices are dense and 1-based. Index 0 always holds a sentinel entry with term 0 so that
//! `prev_log_idx = 0, prev_log_term = 0` is a valid "empty prefix" consistency check without
//! special casing. Entry terms are non-decreasing in index.
//!
//! The log lives entirely in memory and is persisted wholesale (sentinel included) through
//! the [`persist`](crate::persist) codec; durable storage is the embedder's concern.

use log::info;

use crate::message::{LogEntry, LogIndex, Term};

/// The replicated command log of one peer, sentinel entry included.
#[derive(Clone, Debug)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    /// An empty log: just the sentinel entry at index 0.
    pub fn new() -> Self {
        Self {
            entries: vec![LogEntry::default()],
        }
    }

    /// Rebuilds a log from persisted entries. The slice must start with the sentinel.
    pub(crate) fn restore(entries: Vec<LogEntry>) -> Self {
        debug_assert!(!entries.is_empty());
        Self { entries }
    }

    fn position(&self, idx: LogIndex) -> Option<usize> {
        let position = idx.0 as usize;
        if position < self.entries.len() {
            Some(position)
        } else {
            None
        }
    }

    /// The index of the last entry; `LogIndex(0)` for an empty log.
    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64 - 1)
    }

    /// The term of the last entry; `Term(0)` for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|entry| entry.term).unwrap_or_default()
    }

    /// The term of the entry at `idx`, or `None` if the log has no such entry.
    pub fn term_at(&self, idx: LogIndex) -> Option<Term> {
        self.position(idx).map(|position| self.entries[position].term)
    }

    /// The entry at `idx`, or `None` if the log has no such entry.
    pub fn get(&self, idx: LogIndex) -> Option<&LogEntry> {
        self.position(idx).map(|position| &self.entries[position])
    }

    /// Appends one entry at `last_index() + 1`.
    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Removes the entry at `from` and everything after it, returning how many entries were
    /// removed. The sentinel is never removed.
    pub fn truncate_from(&mut self, from: LogIndex) -> usize {
        assert!(from > LogIndex::default(), "cannot truncate the sentinel");
        match self.position(from) {
            Some(position) => {
                let removed = self.entries.len() - position;
                self.entries.truncate(position);
                info!("cancelled {} entries from {}", removed, &from);
                removed
            }
            None => 0,
        }
    }

    /// The consecutive entries starting at `from`; empty if `from` is past the end.
    pub fn tail(&self, from: LogIndex) -> &[LogEntry] {
        match self.position(from) {
            Some(position) => &self.entries[position..],
            None => &[],
        }
    }

    /// Every entry including the sentinel, in index order. Used by the persistence codec.
    pub(crate) fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Whether a log ending at `(last_idx, last_term)` is at least as up-to-date as this one.
    pub fn other_is_up_to_date(&self, last_idx: LogIndex, last_term: Term) -> bool {
        last_term > self.last_term()
            || (last_term == self.last_term() && last_idx >= self.last_index())
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
