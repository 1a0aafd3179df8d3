//! WebSocket transport for terminal sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ssh?token=<api_key>` — or
//!    `/api/ssh/{client_id}` to target a registered client, whose address
//!    becomes the default connect target.
//! 2. The **first frame** must be a JSON text frame carrying connection
//!    parameters (`host`, `port?`, `username?`, `credentials_ref?`, `rows?`,
//!    `cols?`). With a path target, `host` may be omitted.
//! 3. Once the shell is up the server sends `ready`. From then on **Binary**
//!    frames are raw shell input bytes and **Text** frames are JSON control
//!    messages — control frames are interpreted, never forwarded as input.
//!    Shell output arrives as Binary frames.
//!
//! ## Control messages (client → server)
//!
//! | Type     | Fields         | Response           |
//! |----------|----------------|--------------------|
//! | `resize` | `rows`, `cols` | `resize.ack`       |
//! | `ping`   | —              | `pong`             |
//! | `close`  | —              | `closed` + WS close|
//!
//! ## Status messages (server → client)
//!
//! | Type         | Key fields              |
//! |--------------|-------------------------|
//! | `ready`      | `session_id`, `target`  |
//! | `resize.ack` | `rows`, `cols`          |
//! | `pong`       | —                       |
//! | `closed`     | `reason`                |
//! | `error`      | `code`, `message`       |
//!
//! `closed` reasons: `client_request`, `connection_closed`, `shell_exited`,
//! `shut_down`, plus the connect failure reasons (`auth_failed`,
//! `unreachable`, `timeout`, `resource_exhausted`).

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, RawPathParams, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::WsQuery;
use crate::routes::clients::decode_client_id;
use crate::terminal::connector::ConnectParams;
use crate::terminal::session::SessionOutput;
use crate::AppState;

/// How long the client has to send the parameters frame after upgrading.
const PARAMS_DEADLINE: Duration = Duration::from_secs(10);

/// First-frame payload. Identical to [`ConnectParams`] except the host is
/// optional when the upgrade path already named a registered client.
#[derive(Deserialize)]
struct FirstFrame {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credentials_ref: Option<String>,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default)]
    cols: Option<u16>,
}

/// `GET /api/ssh?token=<key>` — terminal WebSocket upgrade.
pub async fn terminal_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !super::token_valid(&state, &query.token) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| handle_terminal(socket, state, None))
}

/// `GET /api/ssh/{*target}?token=<key>` — terminal upgrade targeting a
/// registered client. The raw path tail is percent-decoded exactly once and
/// resolved through the registry; the first frame's `host` still wins when
/// present.
pub async fn terminal_upgrade_target(
    State(state): State<AppState>,
    params: RawPathParams,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !super::token_valid(&state, &query.token) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    let raw = params
        .iter()
        .find(|(name, _)| *name == "target")
        .map(|(_, value)| value.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let default_address = match decode_client_id(&raw) {
        Ok(client_id) if !client_id.is_empty() => {
            match state.registry.get(&client_id).await {
                Ok(client) => Some(client.address),
                Err(_) => {
                    return (StatusCode::NOT_FOUND, "Unknown client").into_response();
                }
            }
        }
        Ok(_) => None,
        Err(_) => return (StatusCode::BAD_REQUEST, "Bad client id").into_response(),
    };

    ws.on_upgrade(move |socket| handle_terminal(socket, state, default_address))
}

/// Split `host:port` from a registry address, tolerating a bare host.
fn split_address(address: &str) -> (String, Option<u16>) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (address.to_string(), None),
        },
        None => (address.to_string(), None),
    }
}

/// Resolve the first frame against the optional path target.
fn resolve_params(frame: FirstFrame, default_address: Option<&str>) -> Option<ConnectParams> {
    let (default_host, default_port) = match default_address {
        Some(address) => {
            let (host, port) = split_address(address);
            (Some(host), port)
        }
        None => (None, None),
    };

    let host = frame.host.or(default_host)?;
    Some(ConnectParams {
        host,
        port: frame.port.or(default_port).unwrap_or(22),
        username: frame.username,
        credentials_ref: frame.credentials_ref,
        rows: frame.rows,
        cols: frame.cols,
    })
}

async fn send_json(ws_sink: &mut futures::stream::SplitSink<WebSocket, Message>, value: &Value) -> bool {
    ws_sink
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

/// Main terminal relay loop.
///
/// Owns exactly one session for the life of the connection. The
/// `tokio::select!` races incoming WebSocket frames against the session's
/// output channel, so neither direction can starve the other — and nothing
/// here blocks any other connection.
async fn handle_terminal(socket: WebSocket, state: AppState, default_address: Option<String>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // --- Parameters frame ---
    let first = tokio::time::timeout(PARAMS_DEADLINE, ws_stream.next()).await;
    let params = match first {
        Ok(Some(Ok(Message::Text(text)))) => {
            match serde_json::from_str::<FirstFrame>(&text) {
                Ok(frame) => resolve_params(frame, default_address.as_deref()),
                Err(e) => {
                    let _ = send_json(
                        &mut ws_sink,
                        &json!({
                            "type": "error",
                            "code": "INVALID_PARAMS",
                            "message": format!("Failed to parse connection parameters: {e}"),
                        }),
                    )
                    .await;
                    let _ = ws_sink.close().await;
                    return;
                }
            }
        }
        Ok(Some(Ok(_))) | Ok(Some(Err(_))) | Ok(None) => {
            let _ = send_json(
                &mut ws_sink,
                &json!({
                    "type": "error",
                    "code": "INVALID_PARAMS",
                    "message": "First frame must be a JSON text frame with connection parameters",
                }),
            )
            .await;
            let _ = ws_sink.close().await;
            return;
        }
        Err(_) => {
            let _ = send_json(
                &mut ws_sink,
                &json!({
                    "type": "error",
                    "code": "PARAMS_TIMEOUT",
                    "message": "No connection parameters received",
                }),
            )
            .await;
            let _ = ws_sink.close().await;
            return;
        }
    };

    let Some(mut params) = params else {
        let _ = send_json(
            &mut ws_sink,
            &json!({
                "type": "error",
                "code": "INVALID_PARAMS",
                "message": "No target host given",
            }),
        )
        .await;
        let _ = ws_sink.close().await;
        return;
    };
    params.rows = params.rows.or(Some(state.config.terminal.default_rows));
    params.cols = params.cols.or(Some(state.config.terminal.default_cols));

    // --- Shell handshake ---
    let opened = match state.terminals.open(&params).await {
        Ok(opened) => opened,
        Err(e) => {
            info!("Terminal open for {}:{} failed: {e}", params.host, params.port);
            let _ = send_json(
                &mut ws_sink,
                &json!({
                    "type": "error",
                    "code": e.reason(),
                    "message": e.to_string(),
                }),
            )
            .await;
            let _ = send_json(
                &mut ws_sink,
                &json!({"type": "closed", "reason": e.reason()}),
            )
            .await;
            let _ = ws_sink.close().await;
            return;
        }
    };
    let session = opened.session;
    let mut output_rx = opened.output_rx;

    let _ = send_json(
        &mut ws_sink,
        &json!({
            "type": "ready",
            "session_id": session.id,
            "target": session.target,
        }),
    )
    .await;

    // --- Relay loop ---
    let close_reason;
    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else {
                    close_reason = "connection_closed";
                    break;
                };
                match msg {
                    Message::Binary(data) => {
                        if let Err(e) = state.terminals.write(&session.id, data.to_vec()).await {
                            debug!("Session {}: input write failed: {e}", session.id);
                            close_reason = "shell_exited";
                            break;
                        }
                    }
                    Message::Text(text) => {
                        match handle_control(&state, &session.id, &text, &mut ws_sink).await {
                            ControlFlow::Continue => {}
                            ControlFlow::Close => {
                                close_reason = "client_request";
                                break;
                            }
                        }
                    }
                    Message::Close(_) => {
                        close_reason = "connection_closed";
                        break;
                    }
                    _ => {}
                }
            }
            out = output_rx.recv() => {
                match out {
                    Some(SessionOutput::Data(data)) => {
                        if ws_sink.send(Message::Binary(data.into())).await.is_err() {
                            close_reason = "connection_closed";
                            break;
                        }
                    }
                    Some(SessionOutput::Eof) => {
                        close_reason = "shell_exited";
                        break;
                    }
                    // Manager closed the session from outside (idle sweep or
                    // shutdown) and the pump is gone.
                    None => {
                        close_reason = "shut_down";
                        break;
                    }
                }
            }
        }
    }

    // --- Teardown ---
    // Closing through the manager releases the shell handle and waits for the
    // output pump to drain (bounded by the grace period).
    let _ = state.terminals.close(&session.id, close_reason).await;

    // Flush whatever the pump handed over before it stopped.
    while let Ok(out) = output_rx.try_recv() {
        if let SessionOutput::Data(data) = out {
            if ws_sink.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
    }

    let _ = send_json(
        &mut ws_sink,
        &json!({"type": "closed", "reason": close_reason}),
    )
    .await;
    let _ = ws_sink.close().await;
    debug!("Terminal connection for session {} finished ({close_reason})", session.id);
}

enum ControlFlow {
    Continue,
    Close,
}

/// Interpret a JSON control frame. Control frames never reach the shell's
/// input stream.
async fn handle_control(
    state: &AppState,
    session_id: &str,
    text: &str,
    ws_sink: &mut futures::stream::SplitSink<WebSocket, Message>,
) -> ControlFlow {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        let _ = send_json(
            ws_sink,
            &json!({
                "type": "error",
                "code": "INVALID_JSON",
                "message": "Failed to parse control frame",
            }),
        )
        .await;
        return ControlFlow::Continue;
    };

    match parsed["type"].as_str().unwrap_or("") {
        "resize" => {
            #[allow(clippy::cast_possible_truncation)]
            let rows = parsed["rows"].as_u64().unwrap_or(0) as u16;
            #[allow(clippy::cast_possible_truncation)]
            let cols = parsed["cols"].as_u64().unwrap_or(0) as u16;
            if rows == 0 || cols == 0 {
                let _ = send_json(
                    ws_sink,
                    &json!({
                        "type": "error",
                        "code": "MISSING_FIELD",
                        "message": "resize requires non-zero rows and cols",
                    }),
                )
                .await;
                return ControlFlow::Continue;
            }
            match state.terminals.resize(session_id, rows, cols).await {
                Ok(()) => {
                    let _ = send_json(
                        ws_sink,
                        &json!({"type": "resize.ack", "rows": rows, "cols": cols}),
                    )
                    .await;
                }
                Err(e) => {
                    let _ = send_json(
                        ws_sink,
                        &json!({
                            "type": "error",
                            "code": "SESSION_ERROR",
                            "message": e.to_string(),
                        }),
                    )
                    .await;
                }
            }
            ControlFlow::Continue
        }
        "ping" => {
            let _ = send_json(ws_sink, &json!({"type": "pong"})).await;
            ControlFlow::Continue
        }
        "close" => ControlFlow::Close,
        other => {
            let _ = send_json(
                ws_sink,
                &json!({
                    "type": "error",
                    "code": "UNKNOWN_TYPE",
                    "message": format!("Unknown control type: {other}"),
                }),
            )
            .await;
            ControlFlow::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_address_handles_host_and_port() {
        assert_eq!(split_address("db-1:2222"), ("db-1".to_string(), Some(2222)));
        assert_eq!(split_address("db-1"), ("db-1".to_string(), None));
        // Non-numeric tail is part of the host, not a port.
        assert_eq!(
            split_address("web-1:ssh"),
            ("web-1:ssh".to_string(), None)
        );
    }

    #[test]
    fn first_frame_host_overrides_path_target() {
        let frame = FirstFrame {
            host: Some("override".into()),
            port: Some(2200),
            username: None,
            credentials_ref: None,
            rows: None,
            cols: None,
        };
        let params = resolve_params(frame, Some("registered:22")).unwrap();
        assert_eq!(params.host, "override");
        assert_eq!(params.port, 2200);
    }

    #[test]
    fn path_target_fills_missing_host_and_port() {
        let frame = FirstFrame {
            host: None,
            port: None,
            username: Some("ops".into()),
            credentials_ref: None,
            rows: Some(40),
            cols: Some(120),
        };
        let params = resolve_params(frame, Some("web-1.internal:2222")).unwrap();
        assert_eq!(params.host, "web-1.internal");
        assert_eq!(params.port, 2222);
        assert_eq!(params.rows, Some(40));
    }

    #[test]
    fn missing_host_without_target_is_rejected() {
        let frame = FirstFrame {
            host: None,
            port: None,
            username: None,
            credentials_ref: None,
            rows: None,
            cols: None,
        };
        assert!(resolve_params(frame, None).is_none());
    }
}
