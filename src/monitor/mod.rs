//! Heartbeat monitoring with one independent timer per client.
//!
//! [`HeartbeatMonitor`] drives periodic health checks. Every registered client
//! gets its own async task on its own schedule, so a slow or unreachable
//! client never delays probes for the others. Each task:
//!
//! 1. Re-reads the shared [`PingConfig`] at the start of the cycle, so
//!    interval/threshold changes apply on the next tick without rescheduling.
//! 2. Sleeps for the configured interval (raced against cancellation).
//! 3. Probes the client's current address with the configured deadline.
//! 4. On success resets the consecutive-failure counter and reports
//!    `online` (or `degraded` above the latency threshold); on timeout/error
//!    increments the counter and flips the client `offline` only once the
//!    counter reaches `failure_threshold`. A single lost probe never flaps
//!    the status.
//!
//! Deregistration cancels the timer through a `watch` handle; a task whose
//! client disappears mid-probe discards the result and exits silently.

pub mod probe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info};

use crate::registry::{ClientRegistry, ClientStatus, RegistryError, StatusSnapshot};
use crate::util::now_ms;
use probe::Prober;

/// Probe schedule for one client (or the default).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbePolicy {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub failure_threshold: u32,
}

/// Mapping from client id (or `"default"`) to its [`ProbePolicy`].
///
/// Read by the monitor at the start of each scheduling cycle; mutated only by
/// `PUT /api/ping-config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PingConfig {
    policies: HashMap<String, ProbePolicy>,
}

/// Key whose policy applies to clients without an explicit override.
pub const DEFAULT_POLICY_KEY: &str = "default";

impl PingConfig {
    pub fn new(default: ProbePolicy) -> Self {
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_POLICY_KEY.to_string(), default);
        Self { policies }
    }

    /// Build from a raw mapping. Fails when the `"default"` entry is missing.
    pub fn from_map(policies: HashMap<String, ProbePolicy>) -> Result<Self, &'static str> {
        if !policies.contains_key(DEFAULT_POLICY_KEY) {
            return Err("ping config requires a \"default\" entry");
        }
        Ok(Self { policies })
    }

    /// Policy for `id`, falling back to the default entry.
    pub fn policy_for(&self, id: &str) -> ProbePolicy {
        self.policies
            .get(id)
            .or_else(|| self.policies.get(DEFAULT_POLICY_KEY))
            .copied()
            .expect("default policy always present")
    }
}

/// Drives per-client heartbeat timers.
///
/// Cloneable — all clones share the same timer table and collaborators.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    registry: ClientRegistry,
    prober: Arc<dyn Prober>,
    ping_config: Arc<RwLock<PingConfig>>,
    degraded_latency: Duration,
    /// Cancellation handles, keyed by client id.
    timers: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: ClientRegistry,
        prober: Arc<dyn Prober>,
        ping_config: Arc<RwLock<PingConfig>>,
        degraded_latency: Duration,
    ) -> Self {
        Self {
            registry,
            prober,
            ping_config,
            degraded_latency,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start (or restart) the heartbeat timer for a client id.
    pub async fn schedule(&self, id: &str) {
        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.remove(id) {
            let _ = old.send(true);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        timers.insert(id.to_string(), shutdown_tx);

        let registry = self.registry.clone();
        let prober = Arc::clone(&self.prober);
        let ping_config = Arc::clone(&self.ping_config);
        let degraded_latency = self.degraded_latency;
        let id = id.to_string();
        tokio::spawn(async move {
            run_client_timer(registry, prober, ping_config, degraded_latency, id, shutdown_rx)
                .await;
        });
    }

    /// Cancel the heartbeat timer for a client id. In-flight probes for it
    /// are discarded, not error-reported.
    pub async fn cancel(&self, id: &str) {
        let mut timers = self.timers.lock().await;
        if let Some(tx) = timers.remove(id) {
            let _ = tx.send(true);
            debug!("Heartbeat timer for {id} cancelled");
        }
    }

    /// Cancel every timer (used during shutdown).
    pub async fn shutdown(&self) {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, tx) in timers.drain() {
            let _ = tx.send(true);
        }
        if count > 0 {
            info!("Cancelled {count} heartbeat timer(s)");
        }
    }

    /// Number of clients currently scheduled.
    pub async fn timer_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

/// One client's probe loop. Exits on cancellation or when the client is no
/// longer registered.
async fn run_client_timer(
    registry: ClientRegistry,
    prober: Arc<dyn Prober>,
    ping_config: Arc<RwLock<PingConfig>>,
    degraded_latency: Duration,
    id: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        // Policy is re-read every cycle so reconfiguration applies next tick.
        let policy = ping_config.read().await.policy_for(&id);

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            () = tokio::time::sleep(Duration::from_millis(policy.interval_ms)) => {}
        }

        // Address can change on re-registration; a missing client means we
        // were deregistered and should stop scheduling.
        let address = match registry.get(&id).await {
            Ok(client) => client.address,
            Err(RegistryError::NotFound(_)) => break,
        };

        let deadline = Duration::from_millis(policy.timeout_ms);
        let result = tokio::time::timeout(deadline, prober.probe(&address)).await;
        let observed_at_ms = now_ms();

        match result {
            Ok(Ok(latency)) => {
                failures = 0;
                let status = if latency > degraded_latency {
                    ClientStatus::Degraded
                } else {
                    ClientStatus::Online
                };
                #[allow(clippy::cast_possible_truncation)]
                let snapshot = StatusSnapshot {
                    status,
                    latency_ms: Some(latency.as_millis() as u64),
                    observed_at_ms,
                };
                if registry.update_status(&id, snapshot).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                failures = failures.saturating_add(1);
                debug!("Probe for {id} failed ({e}), consecutive failures: {failures}");
                if failures >= policy.failure_threshold
                    && report_offline(&registry, &id, observed_at_ms).await.is_err()
                {
                    break;
                }
            }
            Err(_) => {
                failures = failures.saturating_add(1);
                debug!("Probe for {id} timed out, consecutive failures: {failures}");
                if failures >= policy.failure_threshold
                    && report_offline(&registry, &id, observed_at_ms).await.is_err()
                {
                    break;
                }
            }
        }
    }
    debug!("Heartbeat timer for {id} stopped");
}

async fn report_offline(
    registry: &ClientRegistry,
    id: &str,
    observed_at_ms: u64,
) -> Result<bool, RegistryError> {
    registry
        .update_status(
            id,
            StatusSnapshot {
                status: ClientStatus::Offline,
                latency_ms: None,
                observed_at_ms,
            },
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// Scripted prober: plays back a fixed sequence of outcomes, then repeats
    /// the last one.
    struct ScriptedProber {
        script: Mutex<VecDeque<Outcome>>,
        last: Outcome,
        calls: std::sync::atomic::AtomicU32,
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Ok(u64),
        Fail,
        Hang,
    }

    impl ScriptedProber {
        fn new(script: Vec<Outcome>, last: Outcome) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last,
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _address: &str) -> io::Result<Duration> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let outcome = self
                .script
                .lock()
                .await
                .pop_front()
                .unwrap_or(self.last);
            match outcome {
                Outcome::Ok(ms) => Ok(Duration::from_millis(ms)),
                Outcome::Fail => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
                Outcome::Hang => std::future::pending().await,
            }
        }
    }

    fn policy(interval_ms: u64, timeout_ms: u64, failure_threshold: u32) -> ProbePolicy {
        ProbePolicy {
            interval_ms,
            timeout_ms,
            failure_threshold,
        }
    }

    async fn monitor_with(
        prober: ScriptedProber,
        default: ProbePolicy,
        degraded_latency_ms: u64,
    ) -> (HeartbeatMonitor, ClientRegistry) {
        let (tx, _) = broadcast::channel(256);
        let registry = ClientRegistry::new(tx);
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            Arc::new(prober),
            Arc::new(RwLock::new(PingConfig::new(default))),
            Duration::from_millis(degraded_latency_ms),
        );
        (monitor, registry)
    }

    #[test]
    fn policy_for_falls_back_to_default() {
        let mut map = HashMap::new();
        map.insert(DEFAULT_POLICY_KEY.to_string(), policy(1000, 200, 3));
        map.insert("db-1".to_string(), policy(500, 100, 5));
        let config = PingConfig::from_map(map).unwrap();

        assert_eq!(config.policy_for("db-1"), policy(500, 100, 5));
        assert_eq!(config.policy_for("web-1"), policy(1000, 200, 3));
    }

    #[test]
    fn ping_config_requires_default_entry() {
        let mut map = HashMap::new();
        map.insert("web-1".to_string(), policy(1000, 200, 3));
        assert!(PingConfig::from_map(map).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_only_after_threshold_consecutive_failures() {
        // Probes 1-2 succeed, 3-5 hang past the 200 ms deadline. With
        // failure_threshold 3 the status must flip on probe 5, not earlier.
        let prober = ScriptedProber::new(
            vec![Outcome::Ok(10), Outcome::Ok(10)],
            Outcome::Hang,
        );
        let (monitor, registry) = monitor_with(prober, policy(1000, 200, 3), 500).await;

        registry.register("web-1", "10.0.0.1:22").await;
        monitor.schedule("web-1").await;

        let mut observed = Vec::new();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1300)).await;
            observed.push(registry.get("web-1").await.unwrap().status);
        }

        assert_eq!(
            observed,
            vec![
                ClientStatus::Online,
                ClientStatus::Online,
                ClientStatus::Online,
                ClientStatus::Online,
                ClientStatus::Offline,
            ]
        );
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_counter() {
        // Two failures, one success, two more failures: threshold 3 is never
        // reached in a row, so the client must stay online throughout.
        let prober = ScriptedProber::new(
            vec![
                Outcome::Ok(10),
                Outcome::Fail,
                Outcome::Fail,
                Outcome::Ok(10),
                Outcome::Fail,
                Outcome::Fail,
            ],
            Outcome::Ok(10),
        );
        let (monitor, registry) = monitor_with(prober, policy(1000, 200, 3), 500).await;

        registry.register("web-1", "10.0.0.1:22").await;
        monitor.schedule("web-1").await;

        tokio::time::sleep(Duration::from_millis(6500)).await;
        assert_eq!(
            registry.get("web-1").await.unwrap().status,
            ClientStatus::Online
        );
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_probe_reports_degraded() {
        let prober = ScriptedProber::new(vec![], Outcome::Ok(800));
        let (monitor, registry) = monitor_with(prober, policy(1000, 2000, 3), 500).await;

        registry.register("web-1", "10.0.0.1:22").await;
        monitor.schedule("web-1").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let client = registry.get("web-1").await.unwrap();
        assert_eq!(client.status, ClientStatus::Degraded);
        assert_eq!(client.latency_ms, Some(800));
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_scheduling_immediately() {
        let prober = ScriptedProber::new(vec![], Outcome::Ok(10));
        let (monitor, registry) = monitor_with(prober, policy(1000, 200, 3), 500).await;

        registry.register("web-1", "10.0.0.1:22").await;
        monitor.schedule("web-1").await;
        assert_eq!(monitor.timer_count().await, 1);

        monitor.cancel("web-1").await;
        assert_eq!(monitor.timer_count().await, 0);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        // No probe ever ran after the cancel landed before the first tick.
        assert_eq!(
            registry.get("web-1").await.unwrap().status,
            ClientStatus::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timer_exits_after_deregistration() {
        let prober = ScriptedProber::new(vec![], Outcome::Ok(10));
        let (monitor, registry) = monitor_with(prober, policy(1000, 200, 3), 500).await;

        registry.register("web-1", "10.0.0.1:22").await;
        monitor.schedule("web-1").await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            registry.get("web-1").await.unwrap().status,
            ClientStatus::Online
        );

        registry.deregister("web-1").await.unwrap();
        // The loop notices the missing client on its next cycle and exits
        // without reporting an error.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconfiguration_applies_on_next_tick() {
        let prober = Arc::new(ScriptedProber::new(vec![], Outcome::Ok(10)));
        let (tx, _) = broadcast::channel(256);
        let registry = ClientRegistry::new(tx);
        let ping_config = Arc::new(RwLock::new(PingConfig::new(policy(1000, 200, 3))));
        let monitor = HeartbeatMonitor::new(
            registry.clone(),
            Arc::clone(&prober) as Arc<dyn Prober>,
            Arc::clone(&ping_config),
            Duration::from_millis(500),
        );

        registry.register("web-1", "10.0.0.1:22").await;
        monitor.schedule("web-1").await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(prober.calls.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(
            registry.get("web-1").await.unwrap().status,
            ClientStatus::Online
        );

        // Stretch the interval to 60 s. The tick already scheduled on the old
        // policy still fires...
        *ping_config.write().await = PingConfig::new(policy(60_000, 200, 3));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(prober.calls.load(std::sync::atomic::Ordering::Relaxed), 2);

        // ...and the cycle after it runs on the new interval, so no further
        // probe lands for a long while.
        tokio::time::sleep(Duration::from_millis(30_000)).await;
        assert_eq!(prober.calls.load(std::sync::atomic::Ordering::Relaxed), 2);
        monitor.shutdown().await;
    }
}
