//! Terminal session lifecycle management.
//!
//! [`TerminalManager`] is the single authority for opening, accessing, and
//! closing bridged terminal sessions. It enforces the concurrent-session cap
//! and owns every session for its whole lifetime; WebSocket handlers only
//! hold session ids.
//!
//! ## Concurrency
//!
//! The session table is behind an `RwLock`; per-session operations take a
//! read lock and go through the session's own synchronization. The live
//! count (including connects still in flight) is a single atomic, reserved
//! *before* the shell handshake so concurrent opens cannot overshoot the cap.

pub mod connector;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::info;
use uuid::Uuid;

use connector::{ConnectError, ConnectParams, ShellConnector};
use session::{SessionOutput, TerminalSession};

/// Errors for operations on an existing session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {0} is not active")]
    NotActive(String),
    #[error("shell I/O failed: {0}")]
    Io(String),
}

/// Summary of a session returned by [`TerminalManager::list`].
pub struct SessionListItem {
    pub session_id: String,
    pub target: String,
    pub state: &'static str,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub created_at: u64,
    pub idle_ms: u64,
}

/// A freshly-opened session: the handle plus the receiving end of its shell
/// output stream, owned by the requesting WebSocket connection.
pub struct OpenedSession {
    pub session: Arc<TerminalSession>,
    pub output_rx: mpsc::Receiver<SessionOutput>,
}

impl std::fmt::Debug for OpenedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedSession").finish_non_exhaustive()
    }
}

/// Manages the pool of bridged terminal sessions.
///
/// Cloneable — all clones share the same table, counter, and collaborators.
#[derive(Clone)]
pub struct TerminalManager {
    sessions: Arc<RwLock<HashMap<String, Arc<TerminalSession>>>>,
    /// Sessions alive plus connects in flight. The only cross-session shared
    /// counter.
    live: Arc<AtomicUsize>,
    max_sessions: usize,
    connector: Arc<dyn ShellConnector>,
    close_grace: Duration,
    /// Session lifecycle events for the dashboard stream.
    events: broadcast::Sender<Value>,
}

impl TerminalManager {
    pub fn new(
        max_sessions: usize,
        connector: Arc<dyn ShellConnector>,
        close_grace: Duration,
        events: broadcast::Sender<Value>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            live: Arc::new(AtomicUsize::new(0)),
            max_sessions,
            connector,
            close_grace,
            events,
        }
    }

    /// Open a new bridged session.
    ///
    /// The slot is reserved before the shell handshake and returned on
    /// failure, so the `cap+1`-th concurrent open fails with
    /// `resource_exhausted` no matter how slow the handshakes are.
    pub async fn open(&self, params: &ConnectParams) -> Result<OpenedSession, ConnectError> {
        if self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .is_err()
        {
            return Err(ConnectError::ResourceExhausted);
        }

        let handle = match self.connector.connect(params).await {
            Ok(handle) => handle,
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let session_id = Uuid::new_v4().to_string();
        let target = format!("{}:{}", params.host, params.port);
        let (output_tx, output_rx) = mpsc::channel(256);
        let session = TerminalSession::start(
            session_id.clone(),
            target.clone(),
            handle,
            output_tx,
            self.close_grace,
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.clone(), Arc::clone(&session));
        info!(
            "Session {session_id} opened ({target}), total: {}",
            sessions.len()
        );
        drop(sessions);

        let _ = self.events.send(json!({
            "type": "session.opened",
            "session_id": session_id,
            "target": target,
        }));

        Ok(OpenedSession { session, output_rx })
    }

    async fn get(&self, session_id: &str) -> Result<Arc<TerminalSession>, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Queue raw bytes for a session's shell input.
    pub async fn write(&self, session_id: &str, bytes: Vec<u8>) -> Result<(), SessionError> {
        self.get(session_id).await?.write(bytes).await
    }

    /// Resize a session's terminal.
    pub async fn resize(
        &self,
        session_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(), SessionError> {
        self.get(session_id).await?.resize(rows, cols).await
    }

    /// Close a session and remove it from the pool. The removal is the single
    /// point that gives the slot back, so the count can't be decremented
    /// twice.
    pub async fn close(&self, session_id: &str, reason: &str) -> Result<(), SessionError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?
        };

        session.close().await;
        self.live.fetch_sub(1, Ordering::SeqCst);

        let _ = self.events.send(json!({
            "type": "session.closed",
            "session_id": session_id,
            "reason": reason,
        }));
        Ok(())
    }

    /// Close every session (used during shutdown). Sessions drain
    /// concurrently, each bounded by its own grace period.
    pub async fn close_all(&self) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions.keys().cloned().collect()
        };
        if ids.is_empty() {
            return;
        }
        let count = ids.len();
        futures::future::join_all(
            ids.iter()
                .map(|id| self.close(id, "shutdown")),
        )
        .await;
        info!("Closed {count} session(s) on shutdown");
    }

    /// Close sessions idle longer than `idle_timeout`. Returns the closed ids.
    pub async fn sweep_idle(&self, idle_timeout: Duration) -> Vec<String> {
        let idle_ms = idle_timeout.as_millis() as u64;
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| s.idle_ms() > idle_ms)
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut closed = Vec::with_capacity(expired.len());
        for id in expired {
            if self.close(&id, "idle_timeout").await.is_ok() {
                closed.push(id);
            }
        }
        closed
    }

    /// Count of live sessions (including connects in flight).
    pub fn session_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Snapshot of all sessions for the REST surface.
    pub async fn list(&self) -> Vec<SessionListItem> {
        let sessions = self.sessions.read().await;
        let mut items = Vec::with_capacity(sessions.len());
        for (id, session) in sessions.iter() {
            items.push(SessionListItem {
                session_id: id.clone(),
                target: session.target.clone(),
                state: session.state().await.as_str(),
                bytes_in: session.bytes_in(),
                bytes_out: session.bytes_out(),
                created_at: session.created_at,
                idle_ms: session.idle_ms(),
            });
        }
        items.sort_by_key(|item| item.created_at);
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connector::{ShellControl, ShellHandle};
    use session::SessionState;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, SimplexStream};

    /// The far end of a mock shell, as seen by the test.
    struct MockShell {
        /// Bytes the session wrote to the shell's input.
        input: tokio::io::ReadHalf<SimplexStream>,
        /// Write end of the shell's output stream; dropping it is EOF.
        output: Option<DuplexStream>,
        released: Arc<AtomicBool>,
        resizes: Arc<StdMutex<Vec<(u16, u16)>>>,
    }

    struct MockControl {
        released: Arc<AtomicBool>,
        resizes: Arc<StdMutex<Vec<(u16, u16)>>>,
    }

    impl ShellControl for MockControl {
        fn resize(&self, rows: u16, cols: u16) -> Result<(), String> {
            self.resizes.lock().unwrap().push((rows, cols));
            Ok(())
        }

        fn release(&self) {
            self.released.store(true, Ordering::Relaxed);
        }
    }

    /// Connector that hands out in-memory shells and records their far ends.
    #[derive(Clone, Default)]
    struct MockConnector {
        spawned: Arc<tokio::sync::Mutex<Vec<MockShell>>>,
    }

    #[async_trait]
    impl ShellConnector for MockConnector {
        async fn connect(&self, _params: &ConnectParams) -> Result<ShellHandle, ConnectError> {
            let (input_read, input_write) = tokio::io::simplex(4096);
            let (output_read, output_write) = tokio::io::duplex(4096);
            let released = Arc::new(AtomicBool::new(false));
            let resizes = Arc::new(StdMutex::new(Vec::new()));

            self.spawned.lock().await.push(MockShell {
                input: input_read,
                output: Some(output_write),
                released: Arc::clone(&released),
                resizes: Arc::clone(&resizes),
            });

            Ok(ShellHandle {
                reader: Box::new(output_read),
                writer: Box::new(input_write),
                control: Box::new(MockControl { released, resizes }),
            })
        }
    }

    /// Connector that always fails with a fixed reason.
    struct FailingConnector(ConnectError);

    #[async_trait]
    impl ShellConnector for FailingConnector {
        async fn connect(&self, _params: &ConnectParams) -> Result<ShellHandle, ConnectError> {
            Err(match self.0 {
                ConnectError::AuthFailed => ConnectError::AuthFailed,
                ConnectError::Unreachable => ConnectError::Unreachable,
                ConnectError::Timeout => ConnectError::Timeout,
                ConnectError::ResourceExhausted => ConnectError::ResourceExhausted,
            })
        }
    }

    fn params(host: &str) -> ConnectParams {
        ConnectParams {
            host: host.to_string(),
            port: 22,
            username: None,
            credentials_ref: None,
            rows: None,
            cols: None,
        }
    }

    fn manager_with(connector: Arc<dyn ShellConnector>, max_sessions: usize) -> TerminalManager {
        let (tx, _) = broadcast::channel(64);
        TerminalManager::new(max_sessions, connector, Duration::from_millis(200), tx)
    }

    #[tokio::test]
    async fn open_at_cap_fails_with_resource_exhausted() {
        let connector = MockConnector::default();
        let manager = manager_with(Arc::new(connector), 2);

        let first = manager.open(&params("a")).await.unwrap();
        let second = manager.open(&params("b")).await.unwrap();

        let err = manager.open(&params("c")).await.unwrap_err();
        assert_eq!(err, ConnectError::ResourceExhausted);

        // Existing sessions are unaffected by the rejected open.
        assert_eq!(first.session.state().await, SessionState::Active);
        assert_eq!(second.session.state().await, SessionState::Active);
        assert_eq!(manager.session_count(), 2);

        // Freeing a slot makes open succeed again.
        manager.close(&first.session.id, "test").await.unwrap();
        assert!(manager.open(&params("d")).await.is_ok());
    }

    #[tokio::test]
    async fn failed_connect_returns_reason_and_slot() {
        let manager = manager_with(Arc::new(FailingConnector(ConnectError::Unreachable)), 1);

        let err = manager.open(&params("a")).await.unwrap_err();
        assert_eq!(err, ConnectError::Unreachable);
        // The reserved slot came back.
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn input_bytes_reach_the_shell_in_order() {
        let connector = MockConnector::default();
        let spawned = Arc::clone(&connector.spawned);
        let manager = manager_with(Arc::new(connector), 4);

        let opened = manager.open(&params("a")).await.unwrap();
        let mut shell = spawned.lock().await.pop().unwrap();

        manager
            .write(&opened.session.id, b"ls -la\n".to_vec())
            .await
            .unwrap();
        manager
            .write(&opened.session.id, b"pwd\n".to_vec())
            .await
            .unwrap();

        let mut buf = vec![0u8; 11];
        shell.input.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls -la\npwd\n");

        // The counter lands just after the bytes do; poll briefly.
        tokio::time::timeout(Duration::from_secs(1), async {
            while opened.session.bytes_in() != 11 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shell_output_is_pumped_then_eof_reported() {
        let connector = MockConnector::default();
        let spawned = Arc::clone(&connector.spawned);
        let manager = manager_with(Arc::new(connector), 4);

        let mut opened = manager.open(&params("a")).await.unwrap();
        let mut shell = spawned.lock().await.pop().unwrap();

        let mut output = shell.output.take().unwrap();
        output.write_all(b"total 0\r\n").await.unwrap();
        output.flush().await.unwrap();

        match opened.output_rx.recv().await.unwrap() {
            SessionOutput::Data(data) => assert_eq!(data, b"total 0\r\n"),
            SessionOutput::Eof => panic!("expected data before EOF"),
        }
        assert_eq!(opened.session.bytes_out(), 9);

        // Dropping the shell's write end simulates the remote shell exiting.
        drop(output);
        assert!(matches!(
            opened.output_rx.recv().await.unwrap(),
            SessionOutput::Eof
        ));
    }

    #[tokio::test]
    async fn close_releases_shell_within_grace_period() {
        let connector = MockConnector::default();
        let spawned = Arc::clone(&connector.spawned);
        let manager = manager_with(Arc::new(connector), 4);

        let opened = manager.open(&params("a")).await.unwrap();
        let shell = spawned.lock().await.pop().unwrap();

        let started = std::time::Instant::now();
        manager.close(&opened.session.id, "connection_lost").await.unwrap();

        assert_eq!(opened.session.state().await, SessionState::Closed);
        assert!(shell.released.load(Ordering::Relaxed), "shell handle released");
        // The mock never reaches EOF, so this exercises the forced path; it
        // must still complete within the 200 ms grace plus slack.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.session_count(), 0);
        assert!(manager.list().await.is_empty());

        // Closing again is NotFound, not a double free.
        assert!(matches!(
            manager.close(&opened.session.id, "again").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resize_goes_to_the_control_surface() {
        let connector = MockConnector::default();
        let spawned = Arc::clone(&connector.spawned);
        let manager = manager_with(Arc::new(connector), 4);

        let opened = manager.open(&params("a")).await.unwrap();
        let shell = spawned.lock().await.pop().unwrap();

        manager.resize(&opened.session.id, 40, 120).await.unwrap();
        assert_eq!(*shell.resizes.lock().unwrap(), vec![(40, 120)]);
    }

    #[tokio::test]
    async fn operations_on_unknown_session_are_not_found() {
        let manager = manager_with(Arc::new(MockConnector::default()), 4);
        assert!(matches!(
            manager.write("nope", b"x".to_vec()).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            manager.resize("nope", 24, 80).await,
            Err(SessionError::NotFound(_))
        ));
    }
}
