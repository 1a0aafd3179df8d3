//! Liveness probe transport.
//!
//! A probe is a lightweight reachability check, deliberately distinct from
//! terminal traffic. The default transport is a TCP connect round-trip; richer
//! checks (HTTP health endpoints, agent handshakes) plug in via [`Prober`].

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Probe transport seam used by the heartbeat monitor.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe `address` (`host:port`), returning round-trip latency on success.
    ///
    /// The caller wraps this in its own deadline; implementations don't need
    /// to time out on their own.
    async fn probe(&self, address: &str) -> io::Result<Duration>;
}

/// TCP-connect probe: a completed connection counts as liveness, and the
/// connect round-trip is the reported latency.
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str) -> io::Result<Duration> {
        let started = Instant::now();
        let stream = TcpStream::connect(address).await?;
        drop(stream);
        Ok(started.elapsed())
    }
}
