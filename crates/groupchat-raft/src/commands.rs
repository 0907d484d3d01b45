//! The command catalogue: every mutation of [`ChatState`] is one of these,
//! proposed through Raft and applied in commit order on every replica.
//!
//! [`ChatState`]: crate::state::ChatState

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of applying one command.
pub type CommandResult = std::result::Result<CommandOutput, CommandError>;

/// Domain failures produced by the state machine.
///
/// These are ordinary results of deterministic application, not consensus
/// failures; every replica computes the same one for the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("user not exists")]
    UserNotExists,
    #[error("user already exists")]
    UserAlreadyExists,
    #[error("room not exists")]
    RoomNotExists,
    #[error("user out of room")]
    UserOutOfRoom,
}

/// Command-specific success payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommandOutput {
    #[default]
    None,
    /// The id assigned by `CreateRoom`.
    RoomId(i64),
    /// The canonical cluster secret after `InitSecretKey`.
    SecretKey(Vec<u8>),
}

/// A single replicated command.
///
/// `id` is unique per proposing node per process and carries the node ID in
/// its high bits, so it is unique cluster-wide; the applier uses it to hand
/// the proposer its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub kind: CommandKind,
}

/// The closed union of mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Adopt the given secret if none is set; always returns the current
    /// secret, so the race winner's key is authoritative.
    InitSecretKey { secret_key: Vec<u8> },
    CreateUser {
        username: String,
        first_name: String,
        last_name: String,
        email: String,
        password: String,
        phone: String,
    },
    CreateRoom { name: String },
    EnterRoom { username: String, room_id: i64 },
    LeaveRoom { username: String },
    SendMessage {
        id: String,
        ts: i64,
        text: String,
        username: String,
    },
}
