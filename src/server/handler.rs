//! WebSocket connection handler: per-connection lifecycle and message
//! dispatch.
//!
//! Each accepted connection gets an unbounded outbound queue. A spawned pump
//! task drains the queue into the socket, while the receive loop decodes
//! inbound frames and dispatches them against the room registry. All replies
//! and broadcasts go through the queue, so delivery to one client never
//! blocks on another.

use std::sync::Arc;

use axum::{
    Json,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;

use crate::{
    message::{ClientMessage, ServerMessage},
    registry::{ConnectionId, DEFAULT_NAME, DEFAULT_ROOM, FALLBACK_OPPONENT, RoomSummary},
};

use super::state::{AppState, Session};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    // Outbound queue for this client; the registry holds clones of `tx` for
    // broadcasting.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn = ConnectionId::new();
    let mut session = Session::new(conn);
    tracing::info!("Connection '{}' established", conn);

    // Pump task: drain the outbound queue into the socket.
    let mut send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error on '{}': {}", conn, e);
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        handle_frame(&state, &mut session, &tx, text.as_str()).await;
                    }
                    Message::Close(_) => {
                        tracing::info!("Connection '{}' requested close", conn);
                        break;
                    }
                    // Ping/pong frames are answered by the protocol layer.
                    _ => {}
                }
            }
            // The pump only exits when the socket is gone.
            _ = &mut send_task => break,
        }
    }

    send_task.abort();

    // Transport closed: remove the connection from its room, announcing the
    // server-stored name to the remaining members.
    if let Some(room_id) = session.room.take() {
        state.registry.disconnect(&room_id, conn).await;
    }
    tracing::info!("Connection '{}' closed", conn);
}

/// Decode one text frame and dispatch it.
///
/// A frame that is not JSON at all gets `error "invalid json"`; valid JSON
/// that is not a known message gets `error "unknown message type"`. Neither
/// closes the connection.
async fn handle_frame(
    state: &AppState,
    session: &mut Session,
    tx: &mpsc::UnboundedSender<String>,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            reply(tx, &ServerMessage::Error {
                message: "invalid json".to_string(),
            });
            return;
        }
    };
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => handle_message(state, session, tx, msg).await,
        Err(_) => reply(tx, &ServerMessage::Error {
            message: "unknown message type".to_string(),
        }),
    }
}

pub(crate) async fn handle_message(
    state: &AppState,
    session: &mut Session,
    tx: &mpsc::UnboundedSender<String>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::Join { room, name } => {
            let room_id = non_empty(room).unwrap_or_else(|| DEFAULT_ROOM.to_string());
            let name = non_empty(name).unwrap_or_else(|| DEFAULT_NAME.to_string());

            // The registry queues the joined ack, the opponentJoined fan-out
            // and the catch-up state atomically with the membership insert.
            state
                .registry
                .join(&room_id, session.id, &name, tx.clone())
                .await;

            session.room = Some(room_id);
            session.name = Some(name);
        }
        ClientMessage::Leave { name } => {
            let Some(room_id) = session.room.take() else {
                return;
            };
            session.name = None;
            // Explicit leave announces the client-supplied name, not the
            // stored one; only the disconnect path uses the stored name.
            let announce = non_empty(name).unwrap_or_else(|| FALLBACK_OPPONENT.to_string());
            state.registry.leave(&room_id, session.id, &announce).await;
        }
        ClientMessage::Snapshot { room, snapshot } => {
            let room_id = resolve_room(room, session);
            if let Err(e) = state
                .registry
                .store_snapshot(&room_id, session.id, snapshot, session.name.clone())
                .await
            {
                reply(tx, &ServerMessage::Error {
                    message: e.to_string(),
                });
            }
        }
        ClientMessage::RequestState { room } => {
            let room_id = resolve_room(room, session);
            // Misses are silent, unlike `snapshot`.
            if let Some(snapshot) = state.registry.snapshot_of(&room_id).await {
                reply(tx, &ServerMessage::State { snapshot });
            }
        }
        ClientMessage::Ping => reply(tx, &ServerMessage::Pong),
    }
}

/// Room id resolution for `snapshot` / `requestState`: message field, else
/// the session's current room, else the default room.
fn resolve_room(room: Option<String>, session: &Session) -> String {
    non_empty(room)
        .or_else(|| session.room.clone())
        .unwrap_or_else(|| DEFAULT_ROOM.to_string())
}

/// Empty strings count as absent, matching the wire protocol's falsy
/// semantics.
fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

/// Queue a direct reply to this connection. Failure means the connection is
/// already gone; log and move on.
fn reply(tx: &mpsc::UnboundedSender<String>, msg: &ServerMessage) {
    if tx.send(msg.to_json()).is_err() {
        tracing::warn!("Failed to queue reply, connection already closed");
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Get the list of live rooms
pub async fn get_rooms(State(state): State<Arc<AppState>>) -> Json<Vec<RoomSummary>> {
    Json(state.registry.summaries().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_connection() -> (
        Session,
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(ConnectionId::new()), tx, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(json) = rx.try_recv() {
            messages.push(serde_json::from_str(&json).unwrap());
        }
        messages
    }

    #[tokio::test]
    async fn test_invalid_json_frame() {
        // テスト項目: JSON として読めないフレームには invalid json エラーが返る
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(&state, &mut session, &tx, "not json {").await;

        // then (期待する結果):
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "invalid json".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        // テスト項目: 未知の type には unknown message type エラーが返る
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(&state, &mut session, &tx, r#"{"type":"teleport"}"#).await;

        // then (期待する結果):
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "unknown message type".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_ping_pong() {
        // テスト項目: ping にはレジストリを介さず pong が返る
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(&state, &mut session, &tx, r#"{"type":"ping"}"#).await;

        // then (期待する結果):
        assert_eq!(drain(&mut rx), vec![ServerMessage::Pong]);
    }

    #[tokio::test]
    async fn test_join_applies_defaults() {
        // テスト項目: room と name が空の join は "default" / "Player" で処理される
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(
            &state,
            &mut session,
            &tx,
            r#"{"type":"join","room":"","name":""}"#,
        )
        .await;

        // then (期待する結果):
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Joined {
                room: "default".to_string(),
                players: 1,
            }]
        );
        assert_eq!(session.room.as_deref(), Some("default"));
        assert_eq!(session.name.as_deref(), Some("Player"));
    }

    #[tokio::test]
    async fn test_join_delivers_cached_snapshot_after_ack() {
        // テスト項目: スナップショットのある部屋への join は joined の後に state が届く
        // given (前提条件):
        let state = AppState::new();
        let (other_tx, _other_rx) = mpsc::unbounded_channel();
        let other = ConnectionId::new();
        state.registry.join("r1", other, "Alice", other_tx).await;
        state
            .registry
            .store_snapshot("r1", other, json!({"x": 1}), Some("Alice".to_string()))
            .await
            .unwrap();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(
            &state,
            &mut session,
            &tx,
            r#"{"type":"join","room":"r1","name":"Bob"}"#,
        )
        .await;

        // then (期待する結果): joined → state の順で届く
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerMessage::Joined {
                    room: "r1".to_string(),
                    players: 2,
                },
                ServerMessage::State {
                    snapshot: json!({"x": 1})
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_leave_outside_room_is_noop() {
        // テスト項目: 部屋に入っていない接続の leave は何も起こさない
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(&state, &mut session, &tx, r#"{"type":"leave"}"#).await;

        // then (期待する結果):
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_nameless_leave_announces_opponent() {
        // テスト項目: name の無い leave は残りのメンバーに "Opponent" で通知される
        // given (前提条件): Alice と Bob が同じ部屋にいる
        let state = AppState::new();
        let (mut session_a, tx_a, mut rx_a) = test_connection();
        let (mut session_b, tx_b, mut rx_b) = test_connection();
        handle_frame(
            &state,
            &mut session_a,
            &tx_a,
            r#"{"type":"join","room":"r1","name":"Alice"}"#,
        )
        .await;
        handle_frame(
            &state,
            &mut session_b,
            &tx_b,
            r#"{"type":"join","room":"r1","name":"Bob"}"#,
        )
        .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // when (操作):
        handle_frame(&state, &mut session_a, &tx_a, r#"{"type":"leave"}"#).await;

        // then (期待する結果): 保存済みの "Alice" ではなくフォールバック名で届く
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::OpponentLeft {
                name: "Opponent".to_string()
            }]
        );
        assert!(session_a.room.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_without_room_reports_error() {
        // テスト項目: 解決先の部屋が存在しない snapshot は no such room エラーになる
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作): join していないので "default" に解決されるが、部屋は無い
        handle_frame(
            &state,
            &mut session,
            &tx,
            r#"{"type":"snapshot","snapshot":{"x":1}}"#,
        )
        .await;

        // then (期待する結果):
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::Error {
                message: "no such room".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_request_state_miss_is_silent() {
        // テスト項目: スナップショットの無い部屋への requestState は無応答
        // given (前提条件):
        let state = AppState::new();
        let (mut session, tx, mut rx) = test_connection();

        // when (操作):
        handle_frame(
            &state,
            &mut session,
            &tx,
            r#"{"type":"requestState","room":"r1"}"#,
        )
        .await;

        // then (期待する結果):
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_resolves_session_room() {
        // テスト項目: room 指定の無い snapshot は現在の部屋に解決される
        // given (前提条件):
        let state = AppState::new();
        let (mut session_a, tx_a, mut rx_a) = test_connection();
        let (mut session_b, tx_b, mut rx_b) = test_connection();
        handle_frame(
            &state,
            &mut session_a,
            &tx_a,
            r#"{"type":"join","room":"r1","name":"Alice"}"#,
        )
        .await;
        handle_frame(
            &state,
            &mut session_b,
            &tx_b,
            r#"{"type":"join","room":"r1","name":"Bob"}"#,
        )
        .await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        // when (操作):
        handle_frame(
            &state,
            &mut session_a,
            &tx_a,
            r#"{"type":"snapshot","snapshot":{"turn":2}}"#,
        )
        .await;

        // then (期待する結果): 送信者以外に from 付きで届く
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::Snapshot {
                snapshot: json!({"turn": 2}),
                from: Some("Alice".to_string()),
            }]
        );
        assert!(drain(&mut rx_a).is_empty());
    }
}
