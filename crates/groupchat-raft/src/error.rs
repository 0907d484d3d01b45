//! Error types for the consensus core.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Errors that can occur in the consensus core.
///
/// All payloads are strings so the type stays `Clone`; read-round errors are
/// fanned out to every waiter of a coalesced linearizable read.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// Failed to serialize or deserialize a payload
    #[error("serialization error: {0}")]
    Serialization(String),

    /// WAL or snapshot file I/O failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The consensus library rejected a proposal
    #[error("proposal rejected: {0}")]
    Proposal(String),

    /// A linearizable read round failed
    #[error("read failed: {0}")]
    Read(String),

    /// The operation did not complete within its deadline
    #[error("deadline exceeded")]
    Timeout,

    /// The driver loop is gone
    #[error("raft node is shut down")]
    Shutdown,

    /// Invalid cluster configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl RaftError {
    pub fn storage(msg: impl Into<String>) -> Self {
        RaftError::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RaftError::Config(msg.into())
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for RaftError {
    fn from(err: bincode::error::EncodeError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(err: bincode::error::DecodeError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<protobuf::ProtobufError> for RaftError {
    fn from(err: protobuf::ProtobufError) -> Self {
        RaftError::Serialization(err.to_string())
    }
}

impl From<raft::Error> for RaftError {
    fn from(err: raft::Error) -> Self {
        RaftError::Proposal(err.to_string())
    }
}
