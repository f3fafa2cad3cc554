//! WebSocket relay server for multiplayer game state.
//!
//! The server holds no authoritative game logic. Clients join a named room
//! over a persistent WebSocket connection, snapshots submitted by one member
//! are fanned out to the other members, and late joiners catch up from the
//! last cached snapshot.

pub mod common;
pub mod message;
pub mod registry;
pub mod server;
