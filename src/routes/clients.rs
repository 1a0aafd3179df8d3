//! REST endpoints for monitored clients and probe configuration.
//!
//! - `GET    /api/clients`                 — all client snapshots
//! - `POST   /api/clients`                 — register a client
//! - `DELETE /api/clients/{id}`            — deregister, cancel its heartbeat
//! - `GET    /api/monitored-clients/{id}`  — single snapshot (per-client poll)
//! - `GET    /api/ping-config`             — current probe policy mapping
//! - `PUT    /api/ping-config`             — replace the mapping
//!
//! ## Client-id decoding
//!
//! Client ids may contain characters that arrive percent-encoded in the raw
//! path (`a%2Fb` for id `a/b`). Handlers take the captures via
//! [`RawPathParams`] — which does **not** decode — and apply
//! [`decode_client_id`] exactly once. The decoded id is final: nothing
//! downstream may decode again.

use std::collections::HashMap;

use axum::{
    extract::{RawPathParams, State},
    http::StatusCode,
    Json,
};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::monitor::{PingConfig, ProbePolicy};
use crate::registry::MonitoredClient;
use crate::AppState;

/// Decode a raw `{id}` path segment exactly once.
///
/// Returns `Err` when the segment isn't valid percent-encoded UTF-8.
pub fn decode_client_id(raw: &str) -> Result<String, (StatusCode, Json<Value>)> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Client id is not valid UTF-8", "code": "BAD_CLIENT_ID"})),
            )
        })
}

fn raw_id_param(params: &RawPathParams) -> Result<String, (StatusCode, Json<Value>)> {
    let raw = params
        .iter()
        .find(|(name, _)| *name == "id")
        .map(|(_, value)| value)
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "Missing id path parameter", "code": "MISSING_FIELD"})),
            )
        })?;
    decode_client_id(raw)
}

/// `GET /api/clients` — list all client snapshots (stable registration order).
pub async fn list_clients(State(state): State<AppState>) -> Json<Vec<MonitoredClient>> {
    Json(state.registry.list().await)
}

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub address: String,
}

/// `POST /api/clients` — register a client and start its heartbeat timer.
///
/// Idempotent on `id`: re-registering updates the address.
pub async fn register_client(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if payload.id.is_empty() || payload.address.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "id and address are required", "code": "MISSING_FIELD"})),
        ));
    }

    let created = state.registry.register(&payload.id, &payload.address).await;
    if created {
        state.monitor.schedule(&payload.id).await;
    }

    Ok(Json(json!({
        "client_id": payload.id,
        "created": created,
    })))
}

/// `DELETE /api/clients/{id}` — deregister a client. Its heartbeat timer is
/// cancelled first so no further probe results are produced.
pub async fn deregister_client(
    State(state): State<AppState>,
    params: RawPathParams,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let id = raw_id_param(&params)?;

    state.monitor.cancel(&id).await;
    state.registry.deregister(&id).await.map_err(|e| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string(), "code": "CLIENT_NOT_FOUND"})),
        )
    })?;

    Ok(Json(json!({"client_id": id, "removed": true})))
}

/// `GET /api/monitored-clients/{id}` — single client snapshot, used by the
/// dashboard's per-client polling.
pub async fn get_monitored_client(
    State(state): State<AppState>,
    params: RawPathParams,
) -> Result<Json<MonitoredClient>, (StatusCode, Json<Value>)> {
    let id = raw_id_param(&params)?;

    match state.registry.get(&id).await {
        Ok(client) => Ok(Json(client)),
        Err(e) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": e.to_string(), "code": "CLIENT_NOT_FOUND"})),
        )),
    }
}

/// `GET /api/ping-config` — current probe policy mapping (`"default"` plus
/// per-client overrides).
pub async fn get_ping_config(State(state): State<AppState>) -> Json<PingConfig> {
    Json(state.ping_config.read().await.clone())
}

/// `PUT /api/ping-config` — replace the probe policy mapping. Running timers
/// pick the new policies up at the start of their next cycle.
pub async fn put_ping_config(
    State(state): State<AppState>,
    Json(payload): Json<HashMap<String, ProbePolicy>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let config = PingConfig::from_map(payload).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e, "code": "MISSING_FIELD"})),
        )
    })?;

    *state.ping_config.write().await = config;
    Ok(Json(json!({"applied": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_slash_decodes_to_slash() {
        assert_eq!(decode_client_id("a%2Fb").unwrap(), "a/b");
    }

    #[test]
    fn double_encoded_slash_decodes_exactly_once() {
        // `a%252Fb` is the encoding of the literal id `a%2Fb`; a second
        // decode pass would wrongly produce `a/b`.
        assert_eq!(decode_client_id("a%252Fb").unwrap(), "a%2Fb");
    }

    #[test]
    fn plain_ids_pass_through() {
        assert_eq!(decode_client_id("web-1").unwrap(), "web-1");
    }

    #[test]
    fn encoded_spaces_and_unicode_decode() {
        assert_eq!(decode_client_id("rack%201").unwrap(), "rack 1");
        assert_eq!(decode_client_id("m%C3%BCnchen-01").unwrap(), "münchen-01");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(decode_client_id("%FF%FE").is_err());
    }
}
