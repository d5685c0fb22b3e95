//! A single-threaded, deterministic Raft consensus core.
//!
//! This crate implements the per-node state machine described by the Raft
//! consensus protocol: leader election, log replication, single-node
//! membership changes, snapshot installation, and leadership transfer. It is
//! driven entirely by [`raft::Raft::step`] and [`raft::Raft::tick`] — there is
//! no internal concurrency, no I/O, and no global state. Everything below the
//! in-memory unstable log suffix (durable storage, wire encoding, the
//! application's own state machine, and wall-clock timing) is an external
//! collaborator behind a narrow trait or message boundary.
//!
//! Embedders should reach for [`raw_node::RawNode`], which wraps the bare
//! state machine with the Ready/Advance protocol: pull a [`raw_node::Ready`],
//! persist and send what it contains, then call
//! [`raw_node::RawNode::advance`].

pub mod config;
pub mod errors;
pub mod log_unstable;
pub mod progress;
pub mod raft;
pub mod raft_log;
pub mod raftpb;
pub mod raw_node;
pub mod read_only;
pub mod storage;

pub use config::Config;
pub use errors::{Error, Result, StorageError};
pub use raft::{Raft, SoftState, StateRole};
pub use raw_node::{RawNode, Ready, Status};
pub use storage::{MemStorage, RaftState, Storage};
