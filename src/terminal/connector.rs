//! Remote shell collaborator seam.
//!
//! The gateway does not speak the SSH wire protocol itself. Opening a shell
//! goes through [`ShellConnector`], and the production implementation
//! ([`PtyShellConnector`]) spawns the configured SSH client on a local PTY,
//! delegating authentication to it (agent, or an identity file named by
//! `credentials_ref`). Tests substitute in-memory connectors.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

use crate::pty::{allocate_pty, resize_pty, spawn_on_pty};

fn default_ssh_port() -> u16 {
    22
}

/// Parameters for opening a remote shell, carried in the first WebSocket
/// frame after the terminal upgrade.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectParams {
    /// Target host name or address.
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Remote login name. The SSH client's own defaults apply when absent.
    #[serde(default)]
    pub username: Option<String>,
    /// Reference to credentials the SSH client resolves itself (an identity
    /// file path). Never raw secret material.
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// Initial terminal geometry.
    #[serde(default)]
    pub rows: Option<u16>,
    #[serde(default)]
    pub cols: Option<u16>,
}

/// Why a terminal session could not be opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("target unreachable")]
    Unreachable,
    #[error("connect timed out")]
    Timeout,
    #[error("session limit reached")]
    ResourceExhausted,
}

impl ConnectError {
    /// Wire-format reason string, sent in error frames and close reasons.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AuthFailed => "auth_failed",
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }
}

/// Control surface of an established shell, beyond byte I/O.
pub trait ShellControl: Send + Sync {
    /// Propagate a terminal resize to the remote shell.
    fn resize(&self, rows: u16, cols: u16) -> Result<(), String>;
    /// Release the underlying process/connection. Idempotent; the shell's
    /// output stream reaches EOF shortly after.
    fn release(&self);
}

/// An established remote shell: the two byte streams plus control surface.
pub struct ShellHandle {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub control: Box<dyn ShellControl>,
}

impl std::fmt::Debug for ShellHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellHandle").finish_non_exhaustive()
    }
}

/// External collaborator that turns [`ConnectParams`] into a live shell.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<ShellHandle, ConnectError>;
}

/// Window after spawn in which an exiting SSH client is classified as an
/// authentication failure (BatchMode makes failed auth exit immediately
/// instead of prompting).
const AUTH_PROBE_WINDOW: Duration = Duration::from_millis(750);

/// Production connector: spawns the configured SSH client on a PTY.
pub struct PtyShellConnector {
    ssh_program: String,
    connect_timeout: Duration,
}

impl PtyShellConnector {
    pub fn new(ssh_program: String, connect_timeout: Duration) -> Self {
        Self {
            ssh_program,
            connect_timeout,
        }
    }

    fn build_args(&self, params: &ConnectParams) -> Vec<String> {
        let mut args = vec![
            "-tt".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-p".to_string(),
            params.port.to_string(),
        ];
        if let Some(ref cred) = params.credentials_ref {
            args.push("-i".to_string());
            args.push(cred.clone());
        }
        match params.username {
            Some(ref user) => args.push(format!("{user}@{}", params.host)),
            None => args.push(params.host.clone()),
        }
        args
    }
}

#[async_trait]
impl ShellConnector for PtyShellConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<ShellHandle, ConnectError> {
        // TCP pre-flight classifies unreachable/timeout before the SSH
        // client hides them behind a generic exit status.
        let address = format!("{}:{}", params.host, params.port);
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => drop(stream),
            Ok(Err(e)) => {
                debug!("Pre-flight to {address} failed: {e}");
                return Err(ConnectError::Unreachable);
            }
            Err(_) => return Err(ConnectError::Timeout),
        }

        let rows = params.rows.unwrap_or(24);
        let cols = params.cols.unwrap_or(80);
        // PTY or fd exhaustion is a local resource limit, not a remote fault.
        let pty = allocate_pty(rows, cols).map_err(|_| ConnectError::ResourceExhausted)?;

        let args = self.build_args(params);
        let mut child = spawn_on_pty(&pty, &self.ssh_program, &args)
            .map_err(|_| ConnectError::ResourceExhausted)?;
        let pid = child.id().unwrap_or(0);

        // Reap the child and flag its exit; the handshake check below and
        // `release` both read the flag.
        let exited = Arc::new(AtomicBool::new(false));
        let exited_reaper = Arc::clone(&exited);
        let (exit_tx, exit_rx) = oneshot::channel::<Option<i32>>();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            exited_reaper.store(true, Ordering::Relaxed);
            let _ = exit_tx.send(code);
        });

        // An SSH client that dies right after spawn did not get past the
        // handshake; with BatchMode that is an auth failure.
        tokio::select! {
            code = exit_rx => {
                debug!("SSH client for {address} exited during handshake: {code:?}");
                return Err(ConnectError::AuthFailed);
            }
            () = tokio::time::sleep(AUTH_PROBE_WINDOW) => {}
        }

        let master_raw: RawFd = pty.master.as_raw_fd();

        // Dup the master fd: one for writing, one for reading, the original
        // kept by the control handle for resize.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(ConnectError::ResourceExhausted);
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(ConnectError::ResourceExhausted);
        }

        // SAFETY: we own these file descriptors via dup
        let writer = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let reader = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        Ok(ShellHandle {
            reader: Box::new(reader),
            writer: Box::new(writer),
            control: Box::new(PtyShellControl {
                master: pty.master,
                pid,
                exited,
                released: AtomicBool::new(false),
            }),
        })
    }
}

/// Control handle for a PTY-backed shell. The SSH client is a session leader
/// (`setsid` in `spawn_on_pty`), so signalling `-pid` reaches its whole group.
struct PtyShellControl {
    master: OwnedFd,
    pid: u32,
    exited: Arc<AtomicBool>,
    released: AtomicBool,
}

impl ShellControl for PtyShellControl {
    fn resize(&self, rows: u16, cols: u16) -> Result<(), String> {
        resize_pty(&self.master, rows, cols).map_err(|e| e.to_string())
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::Relaxed) {
            return;
        }
        if self.pid > 0 && !self.exited.load(Ordering::Relaxed) {
            #[allow(clippy::cast_possible_wrap)]
            let pgid = self.pid as i32;
            unsafe {
                libc::kill(-pgid, libc::SIGTERM);
            }
            // Escalate to SIGKILL if the client ignores SIGTERM.
            let exited = Arc::clone(&self.exited);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                if !exited.load(Ordering::Relaxed) {
                    unsafe {
                        libc::kill(-pgid, libc::SIGKILL);
                    }
                }
            });
        }
    }
}
