//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `HOSTWATCH_API_KEY`, `HOSTWATCH_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `hostwatch.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:4600"
//! sweep_interval_secs = 30
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [terminal]
//! max_sessions = 32
//! connect_timeout_ms = 10000
//! close_grace_ms = 3000
//! default_rows = 24
//! default_cols = 80
//! ssh_program = "ssh"
//!
//! [ping]
//! interval_ms = 10000
//! timeout_ms = 2000
//! failure_threshold = 3
//! degraded_latency_ms = 500
//!
//! [registry]
//! staleness_secs = 90
//! retention_secs = 86400
//!
//! [logging]
//! level = "info"
//!
//! # Optional static client list, registered at startup
//! [[clients]]
//! id = "web-1"
//! address = "10.0.0.11:22"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub ping: PingDefaults,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Static clients registered at startup (dynamic registration via
    /// `POST /api/clients` works either way).
    #[serde(default)]
    pub clients: Vec<ClientSeed>,
}

/// One statically-configured monitored client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSeed {
    pub id: String,
    /// Probe target as `host:port`.
    pub address: String,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:4600`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds between registry staleness/retention sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `HOSTWATCH_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Terminal session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Maximum concurrent terminal sessions (default 32).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Shell connect handshake deadline in milliseconds (default 10 000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Grace period for draining a closing session in milliseconds
    /// (default 3000). A session still `closing` past this is force-closed.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Default terminal rows when the client doesn't specify (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_rows: u16,
    /// Default terminal columns when the client doesn't specify (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_cols: u16,
    /// SSH client binary used to reach remote shells (default `ssh`).
    #[serde(default = "default_ssh_program")]
    pub ssh_program: String,
    /// Seconds of no traffic in either direction before a session is closed
    /// by the sweep. 0 = never auto-close (default).
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

/// Default probe policy applied to clients without a per-id override.
#[derive(Debug, Clone, Deserialize)]
pub struct PingDefaults {
    /// Milliseconds between probes (default 10 000).
    #[serde(default = "default_ping_interval_ms")]
    pub interval_ms: u64,
    /// Per-probe deadline in milliseconds (default 2000).
    #[serde(default = "default_ping_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failures before a client flips to offline (default 3).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Successful probes slower than this report `degraded` (default 500).
    #[serde(default = "default_degraded_latency_ms")]
    pub degraded_latency_ms: u64,
}

/// Registry staleness and retention settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Seconds without a successful probe before a client is forced offline
    /// (default 90).
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// Seconds without a successful probe before a client is removed from the
    /// registry entirely (default 86 400 = 24 h).
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:4600".to_string()
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_close_grace_ms() -> u64 {
    3000
}
fn default_terminal_rows() -> u16 {
    24
}
fn default_terminal_cols() -> u16 {
    80
}
fn default_ssh_program() -> String {
    "ssh".to_string()
}
fn default_ping_interval_ms() -> u64 {
    10_000
}
fn default_ping_timeout_ms() -> u64 {
    2000
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_degraded_latency_ms() -> u64 {
    500
}
fn default_staleness_secs() -> u64 {
    90
}
fn default_retention_secs() -> u64 {
    86_400
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            connect_timeout_ms: default_connect_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
            default_rows: default_terminal_rows(),
            default_cols: default_terminal_cols(),
            ssh_program: default_ssh_program(),
            idle_timeout_secs: 0,
        }
    }
}

impl Default for PingDefaults {
    fn default() -> Self {
        Self {
            interval_ms: default_ping_interval_ms(),
            timeout_ms: default_ping_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            degraded_latency_ms: default_degraded_latency_ms(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `hostwatch.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("hostwatch.toml").exists() {
            let content =
                std::fs::read_to_string("hostwatch.toml").expect("Failed to read hostwatch.toml");
            toml::from_str(&content).expect("Failed to parse hostwatch.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                auth: AuthConfig::default(),
                terminal: TerminalConfig::default(),
                ping: PingDefaults::default(),
                registry: RegistryConfig::default(),
                logging: LoggingConfig::default(),
                clients: Vec::new(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("HOSTWATCH_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("HOSTWATCH_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}
