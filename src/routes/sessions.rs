//! REST endpoint for terminal session observability.
//!
//! - `GET /api/sessions` — list all bridged sessions

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/sessions` — list all terminal sessions with state and byte
/// counters.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let items = state.terminals.list().await;
    let sessions_json: Vec<Value> = items
        .iter()
        .map(|s| {
            json!({
                "session_id": s.session_id,
                "target": s.target,
                "state": s.state,
                "bytes_in": s.bytes_in,
                "bytes_out": s.bytes_out,
                "created_at": s.created_at,
                "idle_ms": s.idle_ms,
            })
        })
        .collect();

    Json(json!({ "sessions": sessions_json }))
}
