//! Dashboard event-stream WebSocket.
//!
//! `GET /socket.io/?token=<key>` (or `/api/events`) upgrades to a push stream
//! of registry and session change notifications. Every connection subscribes
//! to the shared broadcast channel; events are JSON text frames exactly as
//! emitted (`client.registered`, `client.status_changed`, `client.removed`,
//! `session.opened`, `session.closed`).
//!
//! A connection that falls behind the broadcast buffer receives a
//! `{"type":"error","code":"LAGGED","missed":n}` frame instead of silently
//! losing events.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::debug;

use super::WsQuery;
use crate::AppState;

/// `GET /socket.io/?token=<key>` — event stream upgrade handler.
pub async fn events_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !super::token_valid(&state, &query.token) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| handle_events(socket, state))
}

/// Event fan-out loop. Forwards broadcast events until either side closes;
/// dropping the receiver on exit is what unsubscribes this connection.
async fn handle_events(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut rx = state.events.subscribe();

    // Bootstrap frame so the dashboard doesn't need a separate REST round
    // trip to render the initial client list.
    let snapshot = json!({
        "type": "clients.snapshot",
        "clients": state.registry.list().await,
    });
    if ws_sink
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let frame = match event {
                    Ok(value) => value.to_string(),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        json!({"type": "error", "code": "LAGGED", "missed": n}).to_string()
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if ws_sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            ws_msg = ws_stream.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        // The only inbound message the stream understands.
                        let is_ping = serde_json::from_str::<serde_json::Value>(&text)
                            .is_ok_and(|v| v["type"] == "ping");
                        if is_ping {
                            let pong = json!({"type": "pong"}).to_string();
                            if ws_sink.send(Message::Text(pong.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!("Event stream connection closed");
}
