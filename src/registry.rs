//! Room registry: process-wide, concurrency-safe room membership and
//! snapshot cache.
//!
//! A single [`RoomRegistry`] is created at startup and shared with every
//! connection task. Each operation takes the registry lock once and performs
//! membership mutation, snapshot caching and fan-out inside that hold, so a
//! join interleaved with a concurrent leave or snapshot update can never
//! observe a torn state. Fan-out is fire-and-forget: messages are pushed into
//! each member's unbounded outbound queue, and a failed push (closed channel)
//! is logged and skipped without aborting the loop.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::{
    common::time::{millis_to_rfc3339, now_millis},
    message::ServerMessage,
};

/// Room joined when a `join` message carries no room id.
pub const DEFAULT_ROOM: &str = "default";
/// Display name used when a `join` message carries no name.
pub const DEFAULT_NAME: &str = "Player";
/// Name announced in `opponentLeft` when no better name is known.
pub const FALLBACK_OPPONENT: &str = "Opponent";

/// Opaque identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("no such room")]
    NoSuchRoom,
}

/// One room member as the registry sees it: display name plus the handle to
/// the connection's outbound queue. The connection itself stays owned by its
/// handler task.
pub struct Member {
    pub name: String,
    pub sender: mpsc::UnboundedSender<String>,
}

/// A named room. Not persisted: lives only while it has members.
struct Room {
    members: HashMap<ConnectionId, Member>,
    /// Last submitted snapshot, opaque to the server. Last writer wins.
    snapshot: Option<Value>,
    created_at: i64,
}

impl Room {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            snapshot: None,
            created_at: now_millis(),
        }
    }

    /// Push `msg` into every member's outbound queue except `exclude`.
    /// Send failures mean the peer is already gone; log and keep going.
    fn broadcast(&self, exclude: Option<ConnectionId>, msg: &ServerMessage) {
        let json = msg.to_json();
        for (id, member) in &self.members {
            if Some(*id) == exclude {
                continue;
            }
            if member.sender.send(json.clone()).is_err() {
                tracing::warn!("Failed to send message to connection '{}'", id);
            }
        }
    }
}

/// Push `msg` into one member's outbound queue, logging on failure.
fn send_to(member: &Member, conn: ConnectionId, msg: &ServerMessage) {
    if member.sender.send(msg.to_json()).is_err() {
        tracing::warn!("Failed to send message to connection '{}'", conn);
    }
}

/// Summary of one live room, for the read-only HTTP API.
#[derive(Debug, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub players: usize,
    pub has_snapshot: bool,
    pub created_at: String,
}

/// Mapping from room id to room state, shared by all connection handlers.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Add a connection to `room_id`, creating the room on first join.
    ///
    /// All of the join's sends are queued while the registry lock is held:
    /// the `joined` ack to the joiner, `opponentJoined` to the other
    /// members, then the cached snapshot to the joiner only. A concurrent
    /// operation therefore cannot slip a broadcast into the joiner's queue
    /// ahead of the ack and catch-up state. Joining a room the connection is
    /// already in overwrites the stored name only; membership is keyed by
    /// connection identity, so broadcast targets never duplicate.
    pub async fn join(
        &self,
        room_id: &str,
        conn: ConnectionId,
        name: &str,
        sender: mpsc::UnboundedSender<String>,
    ) {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.entry(room_id.to_owned()).or_insert_with(|| {
            tracing::info!("Room '{}' created", room_id);
            Room::new()
        });

        room.members.insert(
            conn,
            Member {
                name: name.to_owned(),
                sender,
            },
        );
        let players = room.members.len();

        let joiner = &room.members[&conn];
        send_to(joiner, conn, &ServerMessage::Joined {
            room: room_id.to_owned(),
            players,
        });
        room.broadcast(
            Some(conn),
            &ServerMessage::OpponentJoined {
                name: name.to_owned(),
            },
        );
        if let Some(snapshot) = room.snapshot.clone() {
            send_to(joiner, conn, &ServerMessage::State { snapshot });
        }
        tracing::info!("'{}' joined room '{}' ({} players)", name, room_id, players);
    }

    /// Remove a connection from `room_id` after an explicit `leave`.
    ///
    /// `announce_name` is the client-supplied override (or the fallback), not
    /// the stored name; the disconnect path differs here on purpose.
    pub async fn leave(&self, room_id: &str, conn: ConnectionId, announce_name: &str) {
        let mut rooms = self.rooms.lock().await;
        Self::remove_member(&mut rooms, room_id, conn, announce_name.to_owned());
    }

    /// Remove a connection from `room_id` after its transport closed.
    ///
    /// Remaining members are notified with the name the room has stored for
    /// the connection.
    pub async fn disconnect(&self, room_id: &str, conn: ConnectionId) {
        let mut rooms = self.rooms.lock().await;
        let name = rooms
            .get(room_id)
            .and_then(|room| room.members.get(&conn))
            .map(|member| member.name.clone())
            .unwrap_or_else(|| FALLBACK_OPPONENT.to_owned());
        Self::remove_member(&mut rooms, room_id, conn, name);
    }

    fn remove_member(
        rooms: &mut HashMap<String, Room>,
        room_id: &str,
        conn: ConnectionId,
        announce_name: String,
    ) {
        let Some(room) = rooms.get_mut(room_id) else {
            return;
        };
        room.members.remove(&conn);
        room.broadcast(None, &ServerMessage::OpponentLeft {
            name: announce_name,
        });
        if room.members.is_empty() {
            rooms.remove(room_id);
            tracing::info!("Room '{}' deleted (empty)", room_id);
        }
    }

    /// Cache `snapshot` on `room_id` (last writer wins) and broadcast it to
    /// every member except the sender. The sender gets no echo.
    pub async fn store_snapshot(
        &self,
        room_id: &str,
        conn: ConnectionId,
        snapshot: Value,
        from: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut rooms = self.rooms.lock().await;
        let room = rooms.get_mut(room_id).ok_or(RegistryError::NoSuchRoom)?;
        room.snapshot = Some(snapshot.clone());
        room.broadcast(Some(conn), &ServerMessage::Snapshot { snapshot, from });
        Ok(())
    }

    /// The cached snapshot of `room_id`, if the room exists and has one.
    pub async fn snapshot_of(&self, room_id: &str) -> Option<Value> {
        let rooms = self.rooms.lock().await;
        rooms.get(room_id)?.snapshot.clone()
    }

    /// Summaries of all live rooms, sorted by id for consistent output.
    pub async fn summaries(&self) -> Vec<RoomSummary> {
        let rooms = self.rooms.lock().await;
        let mut summaries: Vec<RoomSummary> = rooms
            .iter()
            .map(|(id, room)| RoomSummary {
                id: id.clone(),
                players: room.members.len(),
                has_snapshot: room.snapshot.is_some(),
                created_at: millis_to_rfc3339(room.created_at),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
