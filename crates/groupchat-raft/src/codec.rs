//! Canonical byte encodings for log entries and state snapshots.
//!
//! Both encodings use bincode inside a versioned envelope so that every node
//! can decode any payload ever written, and refuse payloads written by an
//! incompatible future version. bincode with ordered maps is deterministic:
//! equal values encode to identical bytes on every node.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::error::RaftError;
use crate::state::StateSnapshot;

const WIRE_VERSION: u16 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    v: u16,
    payload: T,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RaftError> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RaftError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

fn encode_versioned<T: Serialize>(payload: &T) -> Result<Vec<u8>, RaftError> {
    encode(&Envelope {
        v: WIRE_VERSION,
        payload,
    })
}

fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RaftError> {
    let envelope: Envelope<T> = decode(bytes)?;
    if envelope.v != WIRE_VERSION {
        return Err(RaftError::Serialization(format!(
            "unsupported wire version: {} (expected {})",
            envelope.v, WIRE_VERSION
        )));
    }
    Ok(envelope.payload)
}

/// Encode a command for use as a Raft entry payload.
pub fn encode_command(command: &Command) -> Result<Vec<u8>, RaftError> {
    encode_versioned(command)
}

/// Decode a Raft entry payload back into a command.
pub fn decode_command(bytes: &[u8]) -> Result<Command, RaftError> {
    decode_versioned(bytes)
}

/// Encode a state snapshot for snapshot transport and restore.
pub fn encode_snapshot(snapshot: &StateSnapshot) -> Result<Vec<u8>, RaftError> {
    encode_versioned(snapshot)
}

/// Decode a state snapshot.
pub fn decode_snapshot(bytes: &[u8]) -> Result<StateSnapshot, RaftError> {
    decode_versioned(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandKind;

    #[test]
    fn command_roundtrip() {
        let cmd = Command {
            id: 0x0001_0203_0405_0607,
            kind: CommandKind::CreateRoom {
                name: "lobby".to_string(),
            },
        };
        let bytes = encode_command(&cmd).expect("encode");
        let decoded = decode_command(&bytes).expect("decode");
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn identical_commands_encode_identically() {
        let make = || Command {
            id: 42,
            kind: CommandKind::SendMessage {
                id: "m1".to_string(),
                ts: 1700000000,
                text: "hi".to_string(),
                username: "alice".to_string(),
            },
        };
        assert_eq!(
            encode_command(&make()).expect("encode"),
            encode_command(&make()).expect("encode")
        );
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let bytes = encode(&Envelope {
            v: WIRE_VERSION + 1,
            payload: Command {
                id: 1,
                kind: CommandKind::LeaveRoom {
                    username: "alice".to_string(),
                },
            },
        })
        .expect("encode");

        let err = decode_command(&bytes).expect_err("should reject version mismatch");
        assert!(err.to_string().contains("unsupported wire version"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_command(&[0xff, 0xfe, 0xfd]).is_err());
    }
}
