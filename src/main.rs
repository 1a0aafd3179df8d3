#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # hostwatch
//!
//! Server-monitoring connection gateway.
//!
//! hostwatch keeps a registry of monitored clients alive with independent
//! per-client heartbeat probes, and bridges dashboard WebSocket connections
//! to interactive SSH terminal sessions — many of each, concurrently, without
//! one slow client or session delaying the others.
//!
//! ## API surface
//!
//! | Method | Path                          | Auth | Description                          |
//! |--------|-------------------------------|------|--------------------------------------|
//! | GET    | `/api/health`                 | No   | Liveness probe                       |
//! | GET    | `/api/clients`                | Yes  | All client snapshots                 |
//! | POST   | `/api/clients`                | Yes  | Register a client                    |
//! | DELETE | `/api/clients/{id}`           | Yes  | Deregister a client                  |
//! | GET    | `/api/monitored-clients/{id}` | Yes  | Single snapshot (per-client poll)    |
//! | GET    | `/api/ping-config`            | Yes  | Probe policy mapping                 |
//! | PUT    | `/api/ping-config`            | Yes  | Replace probe policies               |
//! | GET    | `/api/sessions`               | Yes  | Terminal session list                |
//! | GET    | `/api/ssh[/{*target}]`        | Yes* | WebSocket terminal session           |
//! | GET    | `/socket.io/`, `/api/events`  | Yes* | WebSocket dashboard event stream     |
//!
//! *WebSocket auth is via `?token=<key>` query param (no `Authorization`
//! header available during the upgrade handshake).
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, router setup, sweep loop, graceful shutdown
//! auth.rs       — Bearer token middleware, constant-time comparison
//! config.rs     — TOML + env-var configuration
//! registry.rs   — monitored-client registry (snapshots, change events)
//! monitor/
//!   mod.rs      — per-client heartbeat timers, failure hysteresis
//!   probe.rs    — probe transport seam (TCP connect by default)
//! terminal/
//!   mod.rs      — session manager (cap, lifecycle, session table)
//!   session.rs  — one bridged session (relay tasks, grace close)
//!   connector.rs— shell collaborator seam (PTY + SSH client by default)
//! pty.rs        — PTY allocation, spawn, resize
//! routes/       — REST handlers (health, clients, sessions)
//! ws/           — WebSocket upgrades (terminal, event stream)
//! ```

mod auth;
mod config;
mod monitor;
mod pty;
mod registry;
mod routes;
mod terminal;
mod util;
mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{delete, get},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use auth::ApiKey;
use config::Config;
use monitor::probe::TcpProber;
use monitor::{HeartbeatMonitor, PingConfig, ProbePolicy};
use registry::ClientRegistry;
use terminal::connector::PtyShellConnector;
use terminal::TerminalManager;

/// Server-monitoring connection gateway.
#[derive(Parser)]
#[command(name = "hostwatch", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

/// Shared application state passed to every handler via Axum's `State`
/// extractor. Owned here and passed by reference — no ambient globals.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Registry of monitored clients and their health snapshots.
    pub registry: ClientRegistry,
    /// Per-client heartbeat timers.
    pub monitor: HeartbeatMonitor,
    /// Pool of bridged terminal sessions.
    pub terminals: TerminalManager,
    /// Probe policies, re-read by every timer at the start of each cycle.
    pub ping_config: Arc<RwLock<PingConfig>>,
    /// Broadcast channel for registry and session change events. All
    /// dashboard event-stream connections subscribe to it.
    pub events: broadcast::Sender<Value>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("hostwatch v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set HOSTWATCH_API_KEY or update config");
    }

    let (events, _) = broadcast::channel(256);

    let registry = ClientRegistry::new(events.clone());

    let ping_config = Arc::new(RwLock::new(PingConfig::new(ProbePolicy {
        interval_ms: config.ping.interval_ms,
        timeout_ms: config.ping.timeout_ms,
        failure_threshold: config.ping.failure_threshold,
    })));
    let monitor = HeartbeatMonitor::new(
        registry.clone(),
        Arc::new(TcpProber),
        Arc::clone(&ping_config),
        Duration::from_millis(config.ping.degraded_latency_ms),
    );

    let connector = PtyShellConnector::new(
        config.terminal.ssh_program.clone(),
        Duration::from_millis(config.terminal.connect_timeout_ms),
    );
    let terminals = TerminalManager::new(
        config.terminal.max_sessions,
        Arc::new(connector),
        Duration::from_millis(config.terminal.close_grace_ms),
        events.clone(),
    );

    // Register statically-configured clients before accepting traffic.
    for seed in &config.clients {
        if registry.register(&seed.id, &seed.address).await {
            monitor.schedule(&seed.id).await;
        }
    }

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        registry,
        monitor,
        terminals,
        ping_config,
        events,
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/api/clients",
            get(routes::clients::list_clients).post(routes::clients::register_client),
        )
        .route(
            "/api/clients/{id}",
            delete(routes::clients::deregister_client),
        )
        .route(
            "/api/monitored-clients/{id}",
            get(routes::clients::get_monitored_client),
        )
        .route(
            "/api/ping-config",
            get(routes::clients::get_ping_config).put(routes::clients::put_ping_config),
        )
        .route("/api/sessions", get(routes::sessions::list_sessions))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_routes = Router::new()
        .route("/api/ssh", get(ws::terminal::terminal_upgrade))
        .route(
            "/api/ssh/{*target}",
            get(ws::terminal::terminal_upgrade_target),
        )
        .route("/socket.io/", get(ws::events::events_upgrade))
        .route("/api/events", get(ws::events::events_upgrade));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: force stale clients offline, drop clients past the
    // retention window, and close idle sessions when configured.
    let sweep_state = state.clone();
    let sweep_task = tokio::spawn(async move {
        let staleness = Duration::from_secs(sweep_state.config.registry.staleness_secs);
        let retention = Duration::from_secs(sweep_state.config.registry.retention_secs);
        let idle_timeout = sweep_state.config.terminal.idle_timeout_secs;

        let mut interval = tokio::time::interval(Duration::from_secs(
            sweep_state.config.server.sweep_interval_secs,
        ));
        loop {
            interval.tick().await;
            for event in sweep_state.registry.sweep(staleness, retention).await {
                if let registry::SweepEvent::Removed(id) = event {
                    sweep_state.monitor.cancel(&id).await;
                }
            }
            if idle_timeout > 0 {
                sweep_state
                    .terminals
                    .sweep_idle(Duration::from_secs(idle_timeout))
                    .await;
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup: stop scheduling first, then drain sessions.
    info!("Shutting down...");
    sweep_task.abort();
    state.monitor.shutdown().await;
    state.terminals.close_all().await;
    info!("Goodbye");
}
