//! Websocket transport for the notification hub.
//!
//! Clients send `{"action":"join","room":"job.room.<id>"}` or `"leave"`; every
//! event published to a joined room is written back as one JSON text frame.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::services::hub::Connection;

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoomAction {
    Join,
    Leave,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct ClientMessage {
    pub action: RoomAction,
    pub room: String,
}

/// GET /ws
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (conn, mut outbound) = Connection::channel(OUTBOUND_QUEUE);
    let conn_id = conn.id;
    tracing::debug!(conn_id = %conn_id, "ws_connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(event.as_ref()) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(conn_id = %conn_id, error = %e, "ws_encode_failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage {
                    action: RoomAction::Join,
                    room,
                }) => state.hub.join(&conn, &room),
                Ok(ClientMessage {
                    action: RoomAction::Leave,
                    room,
                }) => state.hub.leave(conn_id, &room),
                Err(e) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "ws_bad_control_message");
                }
            },
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "ws_read_error");
                break;
            }
            _ => {}
        }
    }

    state.hub.disconnect(conn_id);
    writer.abort();
    tracing::debug!(conn_id = %conn_id, "ws_disconnected");
}
