//! Shared server state and the per-connection session record.

use crate::registry::{ConnectionId, RoomRegistry};

/// Shared application state, constructed once at startup and handed to every
/// connection task.
pub struct AppState {
    pub registry: RoomRegistry,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            registry: RoomRegistry::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection session record. Owned and mutated only by the connection's
/// handler task; the registry learns about the connection through its id and
/// outbound sender.
pub struct Session {
    pub id: ConnectionId,
    /// Room this connection most recently joined, if any.
    pub room: Option<String>,
    /// Display name recorded at join time, if any.
    pub name: Option<String>,
}

impl Session {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            room: None,
            name: None,
        }
    }
}
