//! The deterministic in-memory domain model.
//!
//! All mutation happens through [`ChatState::apply`], called by the applier
//! under the exclusive lock in Raft commit order; every replica ends up with
//! bit-identical state. Reads happen under the shared lock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::commands::{Command, CommandError, CommandKind, CommandOutput, CommandResult};
use crate::error::RaftError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
    pub phone: String,
    /// 0 means "not in a room".
    pub room_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Epoch seconds, stamped by the proposing node.
    pub ts: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: i64,
    pub name: String,
    /// Usernames in insertion order, duplicate-free.
    pub users: Vec<String>,
    /// Flat append log; message ids are opaque, no dedup.
    pub messages: Vec<Message>,
}

/// The portion of the state that a snapshot carries.
///
/// `next_room_id` and the ordered room list are intentionally absent: both
/// are reconstructed deterministically on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub index: u64,
    pub users: BTreeMap<String, User>,
    pub rooms: BTreeMap<i64, Room>,
    pub secret_key: Vec<u8>,
}

#[derive(Debug)]
pub struct ChatState {
    pub users: BTreeMap<String, User>,
    pub rooms: BTreeMap<i64, Room>,
    /// Room ids in ascending id order.
    pub room_list: Vec<i64>,
    pub next_room_id: i64,
    /// Empty until `InitSecretKey` commits; never mutated afterwards.
    pub secret_key: Vec<u8>,
    /// Raft log index of the last applied entry.
    pub applied_index: u64,
}

impl Default for ChatState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatState {
    pub fn new() -> Self {
        Self {
            users: BTreeMap::new(),
            rooms: BTreeMap::new(),
            room_list: Vec::new(),
            next_room_id: 1,
            secret_key: Vec::new(),
            applied_index: 0,
        }
    }

    /// Apply one committed command. Deterministic: same command sequence from
    /// the same initial state yields the same state and results everywhere.
    pub fn apply(&mut self, command: &Command) -> CommandResult {
        match &command.kind {
            CommandKind::InitSecretKey { secret_key } => {
                if self.secret_key.is_empty() {
                    self.secret_key = secret_key.clone();
                }
                Ok(CommandOutput::SecretKey(self.secret_key.clone()))
            }
            CommandKind::CreateUser {
                username,
                first_name,
                last_name,
                email,
                password,
                phone,
            } => {
                if self.users.contains_key(username) {
                    return Err(CommandError::UserAlreadyExists);
                }
                self.users.insert(
                    username.clone(),
                    User {
                        username: username.clone(),
                        first_name: first_name.clone(),
                        last_name: last_name.clone(),
                        email: email.clone(),
                        password: password.clone(),
                        phone: phone.clone(),
                        room_id: 0,
                    },
                );
                Ok(CommandOutput::None)
            }
            CommandKind::CreateRoom { name } => {
                let id = self.next_room_id;
                self.next_room_id += 1;
                self.rooms.insert(
                    id,
                    Room {
                        id,
                        name: name.clone(),
                        users: Vec::new(),
                        messages: Vec::new(),
                    },
                );
                self.room_list.push(id);
                Ok(CommandOutput::RoomId(id))
            }
            CommandKind::EnterRoom { username, room_id } => {
                let user = match self.users.get(username) {
                    Some(u) => u.clone(),
                    None => return Err(CommandError::UserNotExists),
                };
                if !self.rooms.contains_key(room_id) {
                    return Err(CommandError::RoomNotExists);
                }
                if user.room_id > 0 {
                    if user.room_id == *room_id {
                        return Ok(CommandOutput::None);
                    }
                    if let Some(old) = self.rooms.get_mut(&user.room_id) {
                        old.users.retain(|u| u != username);
                    }
                }
                if let Some(u) = self.users.get_mut(username) {
                    u.room_id = *room_id;
                }
                if let Some(room) = self.rooms.get_mut(room_id) {
                    room.users.push(username.clone());
                }
                Ok(CommandOutput::None)
            }
            CommandKind::LeaveRoom { username } => {
                let room_id = match self.users.get(username) {
                    Some(u) => u.room_id,
                    None => return Err(CommandError::UserNotExists),
                };
                if room_id <= 0 {
                    return Ok(CommandOutput::None);
                }
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    room.users.retain(|u| u != username);
                }
                if let Some(u) = self.users.get_mut(username) {
                    u.room_id = 0;
                }
                Ok(CommandOutput::None)
            }
            CommandKind::SendMessage {
                id,
                ts,
                text,
                username,
            } => {
                let room_id = match self.users.get(username) {
                    Some(u) => u.room_id,
                    None => return Err(CommandError::UserNotExists),
                };
                if room_id <= 0 {
                    return Err(CommandError::UserOutOfRoom);
                }
                let room = match self.rooms.get_mut(&room_id) {
                    Some(r) => r,
                    None => return Err(CommandError::RoomNotExists),
                };
                room.messages.push(Message {
                    id: id.clone(),
                    ts: *ts,
                    text: text.clone(),
                });
                Ok(CommandOutput::None)
            }
        }
    }

    /// Encode the snapshot portion of the state.
    pub fn gen_snapshot(&self) -> Result<Vec<u8>, RaftError> {
        codec::encode_snapshot(&StateSnapshot {
            index: self.applied_index,
            users: self.users.clone(),
            rooms: self.rooms.clone(),
            secret_key: self.secret_key.clone(),
        })
    }

    /// Replace the state wholesale from snapshot bytes, reconstructing
    /// `next_room_id` and the ordered room list.
    pub fn restore_snapshot(&mut self, bytes: &[u8]) -> Result<(), RaftError> {
        let snapshot = codec::decode_snapshot(bytes)?;
        self.users = snapshot.users;
        self.rooms = snapshot.rooms;
        self.secret_key = snapshot.secret_key;
        self.applied_index = snapshot.index;
        self.next_room_id = self.rooms.keys().next_back().map_or(1, |id| id + 1);
        self.room_list = self.rooms.keys().copied().collect();
        Ok(())
    }

    /// Assert the cross-reference invariants between users and rooms.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for id in &self.room_list {
            assert!(self.rooms.contains_key(id), "room list references room {id}");
        }
        assert_eq!(
            self.room_list,
            self.rooms.keys().copied().collect::<Vec<_>>(),
            "room list must equal rooms in ascending id order"
        );
        if let Some(max) = self.rooms.keys().next_back() {
            assert!(self.next_room_id > *max);
        }
        for (name, user) in &self.users {
            assert_eq!(name, &user.username);
            if user.room_id > 0 {
                let room = self.rooms.get(&user.room_id).expect("member room exists");
                let count = room.users.iter().filter(|u| *u == name).count();
                assert_eq!(count, 1, "{name} must appear exactly once in room {}", room.id);
            }
        }
        for room in self.rooms.values() {
            for name in &room.users {
                let user = self.users.get(name).expect("room member exists");
                assert_eq!(user.room_id, room.id);
            }
        }
    }
}
