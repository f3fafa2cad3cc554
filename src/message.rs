//! Wire messages exchanged over the WebSocket connection.
//!
//! Every frame is a JSON object with a `type` field plus type-specific
//! fields, modeled as internally tagged enums. Snapshot payloads are opaque
//! [`serde_json::Value`]s; the server never inspects them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client may send to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Join a room. Missing or empty fields fall back to `"default"` /
    /// `"Player"`.
    Join {
        #[serde(default)]
        room: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    /// Leave the current room. `name` overrides the name announced to the
    /// remaining members.
    Leave {
        #[serde(default)]
        name: Option<String>,
    },
    /// Submit a full game-state snapshot for broadcast to the other members.
    Snapshot {
        #[serde(default)]
        room: Option<String>,
        snapshot: Value,
    },
    /// Ask for the room's cached snapshot, if any.
    RequestState {
        #[serde(default)]
        room: Option<String>,
    },
    /// Liveness probe.
    Ping,
}

/// Messages the server sends to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledged; `players` is the member count after the join,
    /// including the joiner.
    Joined { room: String, players: usize },
    /// Another member joined the room.
    OpponentJoined { name: String },
    /// A member left the room or disconnected.
    OpponentLeft { name: String },
    /// Full cached snapshot handed to a (re)joining or requesting client.
    State { snapshot: Value },
    /// Incremental snapshot broadcast from another member. `from` is null if
    /// the sender never joined a room.
    Snapshot { snapshot: Value, from: Option<String> },
    /// Ping reply.
    Pong,
    /// Malformed or invalid request.
    Error { message: String },
}

impl ServerMessage {
    /// Serialize to the JSON text carried in a WebSocket frame.
    ///
    /// These enums contain nothing that can fail to serialize.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serializes to JSON")
    }
}
