//! One bridged terminal session.
//!
//! A [`TerminalSession`] joins a dashboard WebSocket connection to a live
//! remote shell, full-duplex. Two background tasks carry the bytes:
//!
//! - **input writer** — frames queued by the WebSocket handler are written to
//!   the shell's input stream in order.
//! - **output pump** — shell output is read in 4 KiB chunks and forwarded to
//!   the owning connection's channel as soon as it becomes available.
//!
//! Neither task touches any other session; a stalled shell suspends only its
//! own pump. Closing either endpoint tears both tasks down: the shell handle
//! is released, the pump drains already-buffered output, and a session that
//! stays `closing` past the grace period is force-closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use super::connector::{ShellControl, ShellHandle};
use super::SessionError;
use crate::util::now_ms;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Shell handshake in progress (transient — the connector completes it
    /// before the session is inserted into the manager's table).
    Connecting,
    /// Bidirectional relay running.
    Active,
    /// Either side requested termination; buffered output is draining.
    Closing,
    /// Both handles released.
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

/// Output events pumped from the shell to the owning WebSocket connection.
pub enum SessionOutput {
    /// Chunk of shell output bytes.
    Data(Vec<u8>),
    /// The shell side reached EOF (remote shell exited or connection lost).
    Eof,
}

struct SessionTasks {
    input: tokio::task::JoinHandle<()>,
    output: tokio::task::JoinHandle<()>,
}

/// A live bridged session. Exclusively owned by the terminal manager; the
/// WebSocket handler interacts through the manager's API.
pub struct TerminalSession {
    pub id: String,
    /// Remote end as `host:port`.
    pub target: String,
    /// Epoch ms when the session reached `active`.
    pub created_at: u64,
    state: Mutex<SessionState>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    last_activity_ms: AtomicU64,
    input_tx: mpsc::Sender<Vec<u8>>,
    control: Arc<dyn ShellControl>,
    tasks: Mutex<Option<SessionTasks>>,
    close_grace: Duration,
}

impl TerminalSession {
    /// Wire an established shell to an output channel and start the relay
    /// tasks. The handshake already happened in the connector, so the session
    /// goes straight to `active`.
    pub(super) fn start(
        id: String,
        target: String,
        handle: ShellHandle,
        output_tx: mpsc::Sender<SessionOutput>,
        close_grace: Duration,
    ) -> Arc<Self> {
        let ShellHandle {
            mut reader,
            mut writer,
            control,
        } = handle;

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);

        let session = Arc::new(Self {
            id: id.clone(),
            target,
            created_at: now_ms(),
            state: Mutex::new(SessionState::Connecting),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(now_ms()),
            input_tx,
            control: Arc::from(control),
            tasks: Mutex::new(None),
            close_grace,
        });

        // Input writer task: queued frames → shell input, order preserved.
        let input_session = Arc::clone(&session);
        let input_task = tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
                input_session
                    .bytes_in
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                input_session.touch();
            }
        });

        // Output pump task: shell output → owning connection, chunk by chunk.
        // Dies when the shell reaches EOF or the connection side is dropped.
        let output_session = Arc::clone(&session);
        let output_task = tokio::spawn(async move {
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        output_session
                            .bytes_out
                            .fetch_add(n as u64, Ordering::Relaxed);
                        output_session.touch();
                        if output_tx
                            .send(SessionOutput::Data(tmp[..n].to_vec()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            debug!("Session {} shell output closed", output_session.id);
            let _ = output_tx.send(SessionOutput::Eof).await;
        });

        *session.tasks.try_lock().expect("tasks lock uncontended at start") =
            Some(SessionTasks {
                input: input_task,
                output: output_task,
            });
        // Handshake completed in the connector; with both relay tasks up the
        // session is active.
        *session
            .state
            .try_lock()
            .expect("state lock uncontended at start") = SessionState::Active;
        session
    }

    fn touch(&self) {
        self.last_activity_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last byte crossed the session in either
    /// direction.
    pub fn idle_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Queue raw bytes for the shell's input stream.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), SessionError> {
        if *self.state.lock().await != SessionState::Active {
            return Err(SessionError::NotActive(self.id.clone()));
        }
        self.input_tx
            .send(bytes)
            .await
            .map_err(|_| SessionError::Io("shell input closed".to_string()))
    }

    /// Propagate a terminal resize. Control frames are interpreted here, never
    /// written to the shell as input bytes.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        if *self.state.lock().await != SessionState::Active {
            return Err(SessionError::NotActive(self.id.clone()));
        }
        self.control.resize(rows, cols).map_err(SessionError::Io)
    }

    /// Tear the session down: release the shell handle, drain buffered output
    /// within the grace period, then mark the session `closed`. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().await;
            match *state {
                SessionState::Closing | SessionState::Closed => return,
                _ => *state = SessionState::Closing,
            }
        }
        debug!("Session {} closing", self.id);

        // Releasing the shell drives its output stream to EOF, which lets the
        // pump flush whatever was already buffered before it exits.
        self.control.release();

        let tasks = self.tasks.lock().await.take();
        if let Some(tasks) = tasks {
            tasks.input.abort();
            let mut output = tasks.output;
            if tokio::time::timeout(self.close_grace, &mut output)
                .await
                .is_err()
            {
                debug!(
                    "Session {}: drain exceeded {}ms grace, forcing close",
                    self.id,
                    self.close_grace.as_millis()
                );
                output.abort();
            }
        }

        *self.state.lock().await = SessionState::Closed;
        info!(
            "Session {} closed (in: {} B, out: {} B)",
            self.id,
            self.bytes_in(),
            self.bytes_out()
        );
    }
}
