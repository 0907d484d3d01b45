//! Raft consensus core for the groupchat service.
//!
//! This crate owns everything below the HTTP handler layer:
//!
//! - [`ChatState`]: the deterministic in-memory domain model
//! - [`Command`]: the closed command union and its canonical wire encoding
//! - [`storage`]: segmented write-ahead log and snapshot files
//! - [`node`]: the Raft driver loop around `raft::RawNode`
//! - [`network`]: HTTP peer transport keyed by a fixed cluster ID
//! - [`notify`]: proposal/apply rendezvous and apply-wait primitives
//!
//! The server crate wires these together: it proposes commands through
//! [`node::RaftNode`], consumes [`node::ApplyTask`]s, and reads state under a
//! shared lock.

pub mod codec;
pub mod commands;
pub mod error;
pub mod metadata;
pub mod network;
pub mod node;
pub mod notify;
pub mod state;
pub mod storage;

pub use commands::{Command, CommandError, CommandKind, CommandOutput, CommandResult};
pub use error::{RaftError, Result};
pub use metadata::{ClusterMetadata, PeerInfo};
pub use node::{ApplyTask, RaftNode};
pub use state::{ChatState, Message, Room, User};

// Protobuf types shared with the server crate.
pub use raft::eraftpb::{Entry, Snapshot};
pub use raft::ReadState;
