//! This is the Raft Distributed Consensus Protocol implemented for Rust.
//! [Raft](http://raftconsensus.github.io/) is described as:
//!
//! > Raft is a consensus algorithm that is designed to be easy to understand. It's equivalent to
//! > Paxos in fault-tolerance and performance. The difference is that it's decomposed into
//! > relatively independent subproblems, and it cleanly addresses all major pieces needed for
//! > practical systems.
//!
//! This crate provides the consensus core only: leader election, log replication with
//! consistency-check repair, commit determination, and the timer/message-driven concurrency
//! that drives them. The pieces a deployment must supply live behind narrow seams:
//!
//! * a [`Transport`] carrying the two RPCs between peers,
//! * a [`Persister`] storing the durable state blob,
//! * an apply channel on which every peer receives the committed commands in the same order.
//!
//! A peer is created with [`Node::new`], fed commands through [`Node::start`], and torn down
//! with [`Node::kill`].

pub mod config;
pub mod log;
pub mod message;
pub mod node;
pub mod persist;
pub mod transport;

mod core;

pub use crate::config::Config;
pub use crate::message::{ApplyMsg, LogEntry, LogIndex, Term};
pub use crate::node::Node;
pub use crate::persist::{MemoryPersister, PersistError, Persister};
pub use crate::transport::Transport;
