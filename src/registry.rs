//! Monitored-client registry.
//!
//! [`ClientRegistry`] is the single authority for the set of known monitored
//! clients and their latest health snapshot. The heartbeat monitor is the only
//! writer of health data; dashboard connections and REST handlers are
//! concurrent readers.
//!
//! ## Concurrency
//!
//! The id → entry map is behind an `RwLock`, but each entry is wrapped in its
//! own `Mutex`. Status updates take a read lock on the map plus the one
//! entry's lock, so heartbeat results for unrelated clients never contend.
//! Structural mutations (register, deregister, sweep) take the write lock.
//!
//! ## Ordering
//!
//! Every snapshot carries `observed_at_ms`. An update older than the one
//! already applied is discarded (`Ok(false)`), so late probe results can never
//! overwrite fresher ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};

use crate::util::now_ms;

/// Health state of a monitored client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    /// Registered but never successfully probed.
    Unknown,
    Online,
    /// Reachable, but the last probe exceeded the degraded-latency threshold.
    Degraded,
    Offline,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }
}

/// A monitored client and its latest health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoredClient {
    /// Opaque identifier, unique within the registry. Percent-decoded exactly
    /// once at the routing boundary before it reaches this type.
    pub id: String,
    /// Probe target as `host:port`.
    pub address: String,
    pub status: ClientStatus,
    /// Epoch ms of the last successful probe.
    pub last_seen_at: Option<u64>,
    /// Round-trip latency of the last successful probe.
    pub latency_ms: Option<u64>,
    /// Epoch ms when the client was registered.
    pub registered_at: u64,
}

/// One probe round-trip's result, as applied to the registry.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub status: ClientStatus,
    /// Set on successful probes, `None` when flipping offline.
    pub latency_ms: Option<u64>,
    /// Epoch ms when the probe completed. Drives the ordering check.
    pub observed_at_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} not found")]
    NotFound(String),
}

/// Events produced by [`ClientRegistry::sweep`] so the caller can cancel
/// heartbeat timers for removed clients.
pub enum SweepEvent {
    /// Client had no successful probe within the staleness threshold and was
    /// forced offline.
    WentStale(String),
    /// Client exceeded the retention window and was removed.
    Removed(String),
}

struct ClientEntry {
    client: MonitoredClient,
    /// `observed_at_ms` of the currently-applied snapshot.
    last_observed_ms: u64,
    /// Registration sequence for stable `list` ordering.
    seq: u64,
}

/// Registry of monitored clients.
///
/// Cloneable — all clones share the same inner maps and broadcast sender.
#[derive(Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<String, Arc<Mutex<ClientEntry>>>>>,
    next_seq: Arc<AtomicU64>,
    /// Change notifications consumed by dashboard event streams.
    events: broadcast::Sender<Value>,
}

impl ClientRegistry {
    pub fn new(events: broadcast::Sender<Value>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    /// Register a client. Idempotent on `id`: re-registering updates the
    /// address but keeps the existing snapshot and list position.
    ///
    /// Returns `true` if the client was newly created.
    pub async fn register(&self, id: &str, address: &str) -> bool {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get(id) {
            let mut entry = entry.lock().await;
            entry.client.address = address.to_string();
            return false;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let registered_at = now_ms();
        clients.insert(
            id.to_string(),
            Arc::new(Mutex::new(ClientEntry {
                client: MonitoredClient {
                    id: id.to_string(),
                    address: address.to_string(),
                    status: ClientStatus::Unknown,
                    last_seen_at: None,
                    latency_ms: None,
                    registered_at,
                },
                last_observed_ms: 0,
                seq,
            })),
        );
        info!("Client {id} registered ({address}), total: {}", clients.len());

        let _ = self.events.send(json!({
            "type": "client.registered",
            "client_id": id,
            "address": address,
        }));
        true
    }

    /// Look up one client's snapshot.
    pub async fn get(&self, id: &str) -> Result<MonitoredClient, RegistryError> {
        let clients = self.clients.read().await;
        match clients.get(id) {
            Some(entry) => Ok(entry.lock().await.client.clone()),
            None => Err(RegistryError::NotFound(id.to_string())),
        }
    }

    /// Snapshot of all clients, in stable registration order.
    pub async fn list(&self) -> Vec<MonitoredClient> {
        let clients = self.clients.read().await;
        let mut items = Vec::with_capacity(clients.len());
        for entry in clients.values() {
            let entry = entry.lock().await;
            items.push((entry.seq, entry.client.clone()));
        }
        items.sort_by_key(|(seq, _)| *seq);
        items.into_iter().map(|(_, c)| c).collect()
    }

    /// Apply a probe result to one client.
    ///
    /// Returns `Ok(true)` when applied, `Ok(false)` when the snapshot is older
    /// than the one already applied (discarded). Only the map read lock plus
    /// this client's entry lock are held — updates for other clients proceed
    /// concurrently.
    pub async fn update_status(
        &self,
        id: &str,
        snapshot: StatusSnapshot,
    ) -> Result<bool, RegistryError> {
        let entry = {
            let clients = self.clients.read().await;
            match clients.get(id) {
                Some(entry) => Arc::clone(entry),
                None => return Err(RegistryError::NotFound(id.to_string())),
            }
        };

        let mut entry = entry.lock().await;
        if snapshot.observed_at_ms < entry.last_observed_ms {
            return Ok(false);
        }
        entry.last_observed_ms = snapshot.observed_at_ms;

        let previous = entry.client.status;
        entry.client.status = snapshot.status;
        entry.client.latency_ms = snapshot.latency_ms;
        if matches!(snapshot.status, ClientStatus::Online | ClientStatus::Degraded) {
            entry.client.last_seen_at = Some(snapshot.observed_at_ms);
        }

        if previous != snapshot.status {
            info!(
                "Client {id}: {} -> {}",
                previous.as_str(),
                snapshot.status.as_str()
            );
            let _ = self.events.send(json!({
                "type": "client.status_changed",
                "client_id": id,
                "status": snapshot.status.as_str(),
                "latency_ms": snapshot.latency_ms,
                "observed_at_ms": snapshot.observed_at_ms,
            }));
        }
        Ok(true)
    }

    /// Remove a client. Returns `NotFound` for unknown ids.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut clients = self.clients.write().await;
        if clients.remove(id).is_none() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        info!("Client {id} deregistered, remaining: {}", clients.len());
        let _ = self.events.send(json!({
            "type": "client.removed",
            "client_id": id,
            "reason": "deregistered",
        }));
        Ok(())
    }

    /// Count of registered clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Periodic staleness/retention sweep:
    ///
    /// 1. Clients with no successful probe within `staleness` are forced
    ///    `offline` (the heartbeat hysteresis normally gets there first; this
    ///    covers probes that stopped producing results at all).
    /// 2. Clients with no successful probe within `retention` are removed.
    ///
    /// Never-probed clients age from their registration time. Returns events
    /// so the caller can cancel heartbeat timers for removed ids.
    pub async fn sweep(&self, staleness: Duration, retention: Duration) -> Vec<SweepEvent> {
        let now = now_ms();
        let staleness_ms = staleness.as_millis() as u64;
        let retention_ms = retention.as_millis() as u64;

        let mut events = Vec::new();
        let mut clients = self.clients.write().await;

        let mut expired: Vec<String> = Vec::new();
        for (id, entry) in clients.iter() {
            let mut entry = entry.lock().await;
            let reference = entry.client.last_seen_at.unwrap_or(entry.client.registered_at);
            let age = now.saturating_sub(reference);

            if age > retention_ms {
                expired.push(id.clone());
            } else if age > staleness_ms && entry.client.status != ClientStatus::Offline {
                entry.client.status = ClientStatus::Offline;
                entry.client.latency_ms = None;
                entry.last_observed_ms = now;
                warn!("Client {id} went stale (no probe success in {}s)", staleness.as_secs());
                let _ = self.events.send(json!({
                    "type": "client.status_changed",
                    "client_id": id,
                    "status": "offline",
                    "latency_ms": Value::Null,
                    "observed_at_ms": now,
                }));
                events.push(SweepEvent::WentStale(id.clone()));
            }
        }

        for id in expired {
            clients.remove(&id);
            info!("Client {id} removed (retention), remaining: {}", clients.len());
            let _ = self.events.send(json!({
                "type": "client.removed",
                "client_id": id,
                "reason": "retention",
            }));
            events.push(SweepEvent::Removed(id));
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry {
        let (tx, _) = broadcast::channel(64);
        ClientRegistry::new(tx)
    }

    fn snapshot(status: ClientStatus, latency_ms: Option<u64>, observed_at_ms: u64) -> StatusSnapshot {
        StatusSnapshot {
            status,
            latency_ms,
            observed_at_ms,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent_on_id() {
        let reg = registry();
        assert!(reg.register("web-1", "10.0.0.1:22").await);
        assert!(!reg.register("web-1", "10.0.0.2:22").await);
        assert_eq!(reg.client_count().await, 1);
        // Re-registration updates the address but keeps the snapshot
        let client = reg.get("web-1").await.unwrap();
        assert_eq!(client.address, "10.0.0.2:22");
        assert_eq!(client.status, ClientStatus::Unknown);
    }

    #[tokio::test]
    async fn list_preserves_registration_order() {
        let reg = registry();
        for id in ["c", "a", "b"] {
            reg.register(id, "127.0.0.1:1").await;
        }
        let ids: Vec<String> = reg.list().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn stale_update_never_overwrites_newer_snapshot() {
        let reg = registry();
        reg.register("web-1", "10.0.0.1:22").await;

        let applied = reg
            .update_status("web-1", snapshot(ClientStatus::Online, Some(12), 2000))
            .await
            .unwrap();
        assert!(applied);

        // An older observation arrives late (e.g. a slow probe round-trip)
        let applied = reg
            .update_status("web-1", snapshot(ClientStatus::Offline, None, 1000))
            .await
            .unwrap();
        assert!(!applied);

        let client = reg.get("web-1").await.unwrap();
        assert_eq!(client.status, ClientStatus::Online);
        assert_eq!(client.latency_ms, Some(12));
        assert_eq!(client.last_seen_at, Some(2000));
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let reg = registry();
        let err = reg
            .update_status("ghost", snapshot(ClientStatus::Online, Some(1), 1))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::NotFound("ghost".to_string()));
    }

    #[tokio::test]
    async fn deregister_removes_client() {
        let reg = registry();
        reg.register("web-1", "10.0.0.1:22").await;
        reg.deregister("web-1").await.unwrap();
        assert!(matches!(
            reg.get("web-1").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(reg.deregister("web-1").await.is_err());
    }

    #[tokio::test]
    async fn status_change_emits_notification() {
        let (tx, mut rx) = broadcast::channel(64);
        let reg = ClientRegistry::new(tx);
        reg.register("web-1", "10.0.0.1:22").await;
        // Drain the registration event
        let _ = rx.recv().await.unwrap();

        reg.update_status("web-1", snapshot(ClientStatus::Online, Some(5), 100))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "client.status_changed");
        assert_eq!(event["client_id"], "web-1");
        assert_eq!(event["status"], "online");
    }

    #[tokio::test]
    async fn sweep_flips_stale_clients_offline_and_removes_expired() {
        let reg = registry();
        reg.register("fresh", "10.0.0.1:22").await;
        reg.register("stale", "10.0.0.2:22").await;
        reg.register("ancient", "10.0.0.3:22").await;

        let now = now_ms();
        reg.update_status("fresh", snapshot(ClientStatus::Online, Some(3), now))
            .await
            .unwrap();
        reg.update_status(
            "stale",
            snapshot(ClientStatus::Online, Some(3), now.saturating_sub(10_000)),
        )
        .await
        .unwrap();
        reg.update_status(
            "ancient",
            snapshot(ClientStatus::Online, Some(3), now.saturating_sub(100_000)),
        )
        .await
        .unwrap();

        let events = reg
            .sweep(Duration::from_secs(5), Duration::from_secs(60))
            .await;

        let stale: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                SweepEvent::WentStale(id) => Some(id),
                SweepEvent::Removed(_) => None,
            })
            .collect();
        let removed: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                SweepEvent::Removed(id) => Some(id),
                SweepEvent::WentStale(_) => None,
            })
            .collect();

        assert_eq!(stale, vec!["stale"]);
        assert_eq!(removed, vec!["ancient"]);
        assert_eq!(reg.get("stale").await.unwrap().status, ClientStatus::Offline);
        assert_eq!(reg.get("fresh").await.unwrap().status, ClientStatus::Online);
        assert!(reg.get("ancient").await.is_err());
    }
}
