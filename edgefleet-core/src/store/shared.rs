use super::{
    from_millis, notify_all, to_millis, FleetChange, KeyValueBackend, NetworkSnapshot, NodeInfo, NodeRecord,
    StateStore, StoreEvent, Subscriber, Timestamp,
};
use crate::error::StoreError;
use crate::requests::registry::duration_ms;
use crate::requests::PathKey;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const NODE_INFO: &str = "node-info";
const UNIVERSE: &str = "universe";
const NETWORK: &str = "network";
const SUPERVISORS: &str = "supervisors";

const FLEET_CHANNEL: &str = "fleet";
const WATCH_ADD_CHANNEL: &str = "watch-add";
const WATCH_REMOVE_CHANNEL: &str = "watch-remove";
const STICKY_CHANNEL: &str = "sticky-session";

/// Bounded retry budget for compound check-then-act sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    pub retries: u32,
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// Expiry of a held lock.
    #[serde(with = "duration_ms", rename = "ttl_ms")]
    pub ttl: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            interval: Duration::from_millis(50),
            ttl: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatchMessage {
    request_id: String,
    paths: Vec<PathKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StickyMessage {
    session_id: String,
}

type Subscribers = Arc<RwLock<Vec<Arc<dyn Subscriber>>>>;

/// Store whose records live in an external backend shared by several processes.
///
/// Broadcasts go through the backend's pub/sub channels and come back to every
/// `SharedStore` on that backend, this one included, as [`StoreEvent`]s.
pub struct SharedStore {
    backend: Arc<dyn KeyValueBackend>,
    prefix: String,
    lock: LockPolicy,
    subscribers: Subscribers,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl SharedStore {
    pub async fn connect(
        backend: Arc<dyn KeyValueBackend>,
        prefix: impl Into<String>,
        lock: LockPolicy,
    ) -> Result<Self, StoreError> {
        let store = Self {
            backend,
            prefix: prefix.into(),
            lock,
            subscribers: Arc::new(RwLock::new(Vec::new())),
            pumps: Mutex::new(Vec::new()),
        };
        for channel in [FLEET_CHANNEL, WATCH_ADD_CHANNEL, WATCH_REMOVE_CHANNEL, STICKY_CHANNEL] {
            store.spawn_pump(channel).await?;
        }
        Ok(store)
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    async fn spawn_pump(&self, channel: &'static str) -> Result<(), StoreError> {
        let mut rx = self.backend.subscribe(&self.key(channel)).await?;
        let subscribers = self.subscribers.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => match decode_event(channel, &message) {
                        Ok(event) => notify_all(&subscribers, &event),
                        Err(e) => warn!(channel, error = %e, "undecodable broadcast"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(channel, skipped, "broadcast receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.pumps.lock().push(handle);
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        notify_all(&self.subscribers, &event);
    }

    /// Takes the lock at `key`. The returned token proves ownership on release.
    async fn acquire(&self, key: &str) -> Result<String, StoreError> {
        let token = Uuid::new_v4().to_string();
        let attempts = self.lock.retries.max(1);
        for attempt in 1..=attempts {
            if self.backend.set_nx(key, token.clone(), self.lock.ttl).await? {
                return Ok(token);
            }
            if attempt < attempts {
                tokio::time::sleep(self.lock.interval).await;
            }
        }
        warn!(key, attempts, "lock acquisition exhausted");
        Err(StoreError::LockUnavailable {
            key: key.to_string(),
            attempts,
        })
    }

    /// Releases the lock only if `token` still holds it; an expired lock may belong to someone else.
    async fn release(&self, key: &str, token: &str) {
        match self.backend.del_if_eq(key, token).await {
            Ok(true) => {}
            Ok(false) => warn!(key, "lock expired before release"),
            Err(e) => warn!(key, error = %e, "lock release failed, waiting for ttl"),
        }
    }

    fn seen_lock(&self, address: &str) -> String {
        self.key(&format!("lock:seen:{address}"))
    }

    /// Writes a heartbeat record without moving last-seen backwards. Caller holds the seen lock.
    async fn write_node_record(&self, address: &str, mut record: NodeRecord) -> Result<(), StoreError> {
        let universe = self.key(UNIVERSE);
        let seen = self
            .backend
            .hget(&universe, address)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(from_millis);
        match seen {
            Some(seen) if seen > record.last_seen => record.last_seen = seen,
            _ => {
                self.backend
                    .hset(&universe, address, to_millis(record.last_seen).to_string())
                    .await?
            }
        }
        self.backend
            .hset(&self.key(NODE_INFO), address, serde_json::to_string(&record)?)
            .await
    }

    async fn advance_last_seen(&self, address: &str, timestamp: Timestamp) -> Result<bool, StoreError> {
        let universe = self.key(UNIVERSE);
        if let Some(raw) = self.backend.hget(&universe, address).await? {
            if raw.parse::<i64>().is_ok_and(|seen| seen > to_millis(timestamp)) {
                return Ok(false);
            }
        }
        self.backend
            .hset(&universe, address, to_millis(timestamp).to_string())
            .await?;

        let nodes = self.key(NODE_INFO);
        if let Some(raw) = self.backend.hget(&nodes, address).await? {
            let mut record: NodeRecord = serde_json::from_str(&raw)?;
            record.last_seen = timestamp;
            self.backend.hset(&nodes, address, serde_json::to_string(&record)?).await?;
        }
        Ok(true)
    }
}

impl Drop for SharedStore {
    fn drop(&mut self) {
        for handle in self.pumps.lock().drain(..) {
            handle.abort();
        }
    }
}

fn decode_event(channel: &str, message: &str) -> Result<StoreEvent, serde_json::Error> {
    Ok(match channel {
        FLEET_CHANNEL => StoreEvent::FleetChanged(serde_json::from_str(message)?),
        WATCH_ADD_CHANNEL => {
            let m: WatchMessage = serde_json::from_str(message)?;
            StoreEvent::RequestWatched {
                request_id: m.request_id,
                paths: m.paths,
            }
        }
        WATCH_REMOVE_CHANNEL => {
            let m: WatchMessage = serde_json::from_str(message)?;
            StoreEvent::RequestIgnored {
                request_id: m.request_id,
                paths: m.paths,
            }
        }
        _ => {
            let m: StickyMessage = serde_json::from_str(message)?;
            StoreEvent::StickySession { session_id: m.session_id }
        }
    })
}

#[async_trait]
impl StateStore for SharedStore {
    async fn node_info_update(&self, info: NodeInfo) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let record = NodeRecord {
            last_seen: now,
            alias: info.alias,
            data: info.data,
        };
        let lock = self.seen_lock(&info.address);
        let token = self.acquire(&lock).await?;
        let result = self.write_node_record(&info.address, record).await;
        self.release(&lock, &token).await;
        result?;
        self.emit(StoreEvent::NodeUpdated { address: info.address });
        Ok(())
    }

    async fn get_universe(&self) -> Result<HashMap<String, Timestamp>, StoreError> {
        let raw = self.backend.hgetall(&self.key(UNIVERSE)).await?;
        let mut universe = HashMap::with_capacity(raw.len());
        for (address, millis) in raw {
            match millis.parse::<i64>() {
                Ok(ms) => {
                    universe.insert(address, from_millis(ms));
                }
                Err(_) => warn!(%address, %millis, "unparsable universe entry"),
            }
        }
        Ok(universe)
    }

    async fn get_node_info(&self, address: &str) -> Result<Option<NodeRecord>, StoreError> {
        match self.backend.hget(&self.key(NODE_INFO), address).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn mark_node_as_seen(&self, address: &str, timestamp: Timestamp) -> Result<bool, StoreError> {
        let lock = self.seen_lock(address);
        let token = self.acquire(&lock).await?;
        let result = self.advance_last_seen(address, timestamp).await;
        self.release(&lock, &token).await;
        result
    }

    async fn update_network_snapshot(
        &self,
        supervisor: &str,
        snapshot: NetworkSnapshot,
    ) -> Result<bool, StoreError> {
        if snapshot.status.is_empty() {
            return Ok(false);
        }
        let first_seen = to_millis(OffsetDateTime::now_utc()).to_string();
        self.backend
            .hset_nx(&self.key(SUPERVISORS), supervisor, first_seen)
            .await?;
        self.backend
            .hset(&self.key(NETWORK), supervisor, serde_json::to_string(&snapshot)?)
            .await?;
        self.emit(StoreEvent::NetworkUpdated {
            supervisor: supervisor.to_string(),
        });
        Ok(true)
    }

    async fn get_network_snapshot(&self, supervisor: &str) -> Result<Option<NetworkSnapshot>, StoreError> {
        match self.backend.hget(&self.key(NETWORK), supervisor).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn get_network_supervisors(&self) -> Result<Vec<String>, StoreError> {
        let raw = self.backend.hgetall(&self.key(SUPERVISORS)).await?;
        let mut supervisors: Vec<(i64, String)> = raw
            .into_iter()
            .map(|(id, first_seen)| (first_seen.parse().unwrap_or(i64::MAX), id))
            .collect();
        supervisors.sort();
        Ok(supervisors.into_iter().map(|(_, id)| id).collect())
    }

    async fn broadcast_update_fleet(&self, change: FleetChange) -> Result<(), StoreError> {
        debug!(?change, "publishing fleet change");
        self.backend
            .publish(&self.key(FLEET_CHANNEL), serde_json::to_string(&change)?)
            .await
    }

    async fn broadcast_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError> {
        let message = WatchMessage {
            request_id: request_id.to_string(),
            paths: paths.to_vec(),
        };
        self.backend
            .publish(&self.key(WATCH_ADD_CHANNEL), serde_json::to_string(&message)?)
            .await
    }

    async fn broadcast_ignore_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError> {
        let message = WatchMessage {
            request_id: request_id.to_string(),
            paths: paths.to_vec(),
        };
        self.backend
            .publish(&self.key(WATCH_REMOVE_CHANNEL), serde_json::to_string(&message)?)
            .await
    }

    async fn broadcast_sticky_session(&self, session_id: &str) -> Result<(), StoreError> {
        let message = StickyMessage {
            session_id: session_id.to_string(),
        };
        self.backend
            .publish(&self.key(STICKY_CHANNEL), serde_json::to_string(&message)?)
            .await
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().push(subscriber);
    }
}
