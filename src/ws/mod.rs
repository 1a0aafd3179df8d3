//! WebSocket surface.
//!
//! Two upgrade families, classified by path:
//!
//! - `/api/ssh` (optionally `/api/ssh/{*target}`) — interactive terminal
//!   sessions, see [`terminal`].
//! - `/socket.io/` (and the `/api/events` alias) — dashboard event stream
//!   fanning out registry and session change notifications, see [`events`].
//!
//! Authentication uses a `?token=<api_key>` query parameter (browsers can't
//! set headers on WebSocket upgrades); it is validated before the upgrade
//! completes.

pub mod events;
pub mod terminal;

use serde::Deserialize;

use crate::AppState;

/// Query parameters for WebSocket upgrade requests.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter.
    pub token: String,
}

/// Validate an upgrade token against the configured API key.
pub(crate) fn token_valid(state: &AppState, token: &str) -> bool {
    crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), token.as_bytes())
}
