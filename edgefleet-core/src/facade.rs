/**
 * STATE FACADE - Coordination layer over one store variant
 *
 * ROLE:
 * Adds what the raw stores do not know about: the configured fleet, liveness, which
 * supervisor's network view to trust, and lookups into running configs carried by heartbeats.
 *
 * ARCHITECTURE: Local or shared store behind `StateStore`. Fleet changes are broadcast and
 * applied by every facade when its own subscription hears them, the sender included.
 */

use crate::config::{StateConfig, StateMode};
use crate::error::StoreError;
use crate::requests::PathKey;
use crate::schema::Config;
use crate::store::{
    FleetChange, KeyValueBackend, LocalStore, NetworkSnapshot, NodeInfo, NodeRecord, SharedStore, StateStore,
    StoreEvent, Subscriber, ThreadKind, ThreadRegistry, Timestamp,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, warn};

/// A node is online while its last sighting is at most this old.
pub const OFFLINE_CUTOFF: Duration = Duration::seconds(60);

/// Supervisor snapshots older than this are stale.
pub const NETWORK_FRESHNESS: Duration = Duration::seconds(30);

const ALL_NODES: &str = "all";

/// Nodes this client is responsible for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FleetRepr", into = "FleetRepr")]
pub enum Fleet {
    /// Every node ever observed.
    #[default]
    All,
    Nodes(Vec<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FleetRepr {
    Keyword(String),
    Nodes(Vec<String>),
}

impl TryFrom<FleetRepr> for Fleet {
    type Error = String;

    fn try_from(repr: FleetRepr) -> Result<Self, Self::Error> {
        match repr {
            FleetRepr::Keyword(k) if k.eq_ignore_ascii_case(ALL_NODES) => Ok(Fleet::All),
            FleetRepr::Keyword(k) => Err(format!("unknown fleet keyword {k:?}, expected \"{ALL_NODES}\" or a list")),
            FleetRepr::Nodes(nodes) => Ok(Fleet::Nodes(nodes)),
        }
    }
}

impl From<Fleet> for FleetRepr {
    fn from(fleet: Fleet) -> Self {
        match fleet {
            Fleet::All => FleetRepr::Keyword(ALL_NODES.to_string()),
            Fleet::Nodes(nodes) => FleetRepr::Nodes(nodes),
        }
    }
}

impl Fleet {
    fn apply(&mut self, change: &FleetChange) {
        match (self, change) {
            (Fleet::All, _) => debug!(?change, "fleet covers all nodes, change ignored"),
            (Fleet::Nodes(nodes), FleetChange::Add(address)) => {
                if !nodes.contains(address) {
                    nodes.push(address.clone());
                }
            }
            (Fleet::Nodes(nodes), FleetChange::Remove(address)) => nodes.retain(|n| n != address),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub online: bool,
    pub last_seen: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetMember {
    pub address: String,
    /// Alias the node reported in its last heartbeat.
    pub node: Option<String>,
    pub status: NodeStatus,
}

/// Store variant chosen at construction.
pub enum StoreMode {
    Internal(Arc<LocalStore>),
    Shared(Arc<SharedStore>),
}

pub struct StateFacade {
    store: Arc<dyn StateStore>,
    threads: Option<Arc<dyn ThreadRegistry>>,
    fleet: RwLock<Fleet>,
}

/// Applies fleet changes broadcast by any process to this facade's filter.
struct FleetFollower(Weak<StateFacade>);

impl Subscriber for FleetFollower {
    fn notify(&self, event: &StoreEvent) {
        if let (StoreEvent::FleetChanged(change), Some(facade)) = (event, self.0.upgrade()) {
            facade.fleet.write().apply(change);
        }
    }
}

impl StateFacade {
    pub fn new(mode: StoreMode, fleet: Fleet) -> Arc<Self> {
        let (store, threads): (Arc<dyn StateStore>, Option<Arc<dyn ThreadRegistry>>) = match mode {
            StoreMode::Internal(local) => (local.clone(), Some(local)),
            StoreMode::Shared(shared) => (shared, None),
        };
        let facade = Arc::new(Self {
            store,
            threads,
            fleet: RwLock::new(fleet),
        });
        facade
            .store
            .subscribe(Arc::new(FleetFollower(Arc::downgrade(&facade))));
        facade
    }

    /// Builds the store variant `state.mode` names. Shared mode needs a backend.
    pub async fn from_config(
        state: &StateConfig,
        fleet: Fleet,
        backend: Option<Arc<dyn KeyValueBackend>>,
    ) -> Result<Arc<Self>, StoreError> {
        let mode = match (state.mode, backend) {
            (StateMode::Internal, _) => StoreMode::Internal(Arc::new(LocalStore::new())),
            (StateMode::Shared, Some(backend)) => StoreMode::Shared(Arc::new(
                SharedStore::connect(backend, state.key_prefix.clone(), state.lock).await?,
            )),
            (StateMode::Shared, None) => return Err(StoreError::Unsupported("shared state without a backend")),
        };
        Ok(Self::new(mode, fleet))
    }

    pub fn is_internal(&self) -> bool {
        self.threads.is_some()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn fleet(&self) -> Fleet {
        self.fleet.read().clone()
    }

    pub async fn get_fleet(&self) -> Result<Vec<FleetMember>, StoreError> {
        self.get_fleet_at(OffsetDateTime::now_utc()).await
    }

    /// Liveness of every fleet node as of `now`. Never observed nodes are offline with no last-seen.
    pub async fn get_fleet_at(&self, now: Timestamp) -> Result<Vec<FleetMember>, StoreError> {
        let universe = self.store.get_universe().await?;
        let addresses = match self.fleet() {
            Fleet::Nodes(nodes) => nodes,
            Fleet::All => {
                let mut all: Vec<String> = universe.keys().cloned().collect();
                all.sort();
                all
            }
        };

        let mut members = Vec::with_capacity(addresses.len());
        for address in addresses {
            let last_seen = universe.get(&address).copied();
            let node = match last_seen {
                Some(_) => self.store.get_node_info(&address).await?.and_then(|r| r.alias),
                None => None,
            };
            members.push(FleetMember {
                status: NodeStatus {
                    online: last_seen.is_some_and(|seen| now - seen <= OFFLINE_CUTOFF),
                    last_seen,
                },
                address,
                node,
            });
        }
        Ok(members)
    }

    /// `data.pipelines[pipeline].config` of the node's last heartbeat.
    pub async fn get_running_pipeline_config(
        &self,
        node: &str,
        pipeline: &str,
    ) -> Result<Option<Config>, StoreError> {
        let record = self.store.get_node_info(node).await?;
        Ok(record.and_then(|r| running_pipeline(&r, pipeline)?.get("config")?.as_object().cloned()))
    }

    /// `data.pipelines[pipeline].plugins[*][instance].config`, searching every signature.
    pub async fn get_running_instance_config(
        &self,
        node: &str,
        pipeline: &str,
        instance: &str,
    ) -> Result<Option<Config>, StoreError> {
        let record = self.store.get_node_info(node).await?;
        Ok(record.and_then(|r| {
            let plugins = running_pipeline(&r, pipeline)?.get("plugins")?.as_object()?;
            plugins
                .values()
                .filter_map(|instances| instances.get(instance))
                .find_map(|i| i.get("config")?.as_object().cloned())
        }))
    }

    /// Records the network view carried by a supervisor payload. No-op without `CURRENT_NETWORK`.
    pub async fn store_network_info(&self, payload: &Value) -> Result<bool, StoreError> {
        let Some(status) = payload
            .get("CURRENT_NETWORK")
            .and_then(Value::as_object)
            .filter(|s| !s.is_empty())
        else {
            return Ok(false);
        };
        let Some(address) = payload.get("EE_SENDER").and_then(Value::as_str) else {
            warn!("network payload without sender dropped");
            return Ok(false);
        };
        let snapshot = NetworkSnapshot {
            name: payload
                .get("EE_ID")
                .and_then(Value::as_str)
                .unwrap_or(address)
                .to_string(),
            address: address.to_string(),
            status: status.clone(),
            timestamp: payload
                .get("TIMESTAMP_EXECUTION")
                .and_then(parse_execution_timestamp)
                .unwrap_or_else(OffsetDateTime::now_utc),
        };
        self.store.update_network_snapshot(address, snapshot).await
    }

    pub async fn get_network_status(&self, supervisor: Option<&str>) -> Result<Option<NetworkSnapshot>, StoreError> {
        self.get_network_status_at(supervisor, OffsetDateTime::now_utc()).await
    }

    /// One supervisor's snapshot, or the best one: largest fresh snapshot, else the most recent.
    pub async fn get_network_status_at(
        &self,
        supervisor: Option<&str>,
        now: Timestamp,
    ) -> Result<Option<NetworkSnapshot>, StoreError> {
        if let Some(supervisor) = supervisor {
            return self.store.get_network_snapshot(supervisor).await;
        }
        let mut snapshots = Vec::new();
        for supervisor in self.store.get_network_supervisors().await? {
            if let Some(snapshot) = self.store.get_network_snapshot(&supervisor).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(select_network_snapshot(snapshots, now))
    }

    /// Returns whether the handle was registered; shared stores have no thread registry.
    pub fn register_thread(&self, kind: ThreadKind, handle: Arc<dyn Subscriber>) -> bool {
        match &self.threads {
            Some(threads) => {
                threads.register_thread(kind, handle);
                true
            }
            None => {
                debug!(?kind, "thread registration skipped on shared store");
                false
            }
        }
    }

    /// Broadcasts a fleet change; every facade on the store, this one included, applies it.
    pub async fn update_fleet(&self, change: FleetChange) -> Result<(), StoreError> {
        self.store.broadcast_update_fleet(change).await
    }

    pub async fn node_info_update(&self, info: NodeInfo) -> Result<(), StoreError> {
        self.store.node_info_update(info).await
    }

    pub async fn get_node_info(&self, address: &str) -> Result<Option<NodeRecord>, StoreError> {
        self.store.get_node_info(address).await
    }

    pub async fn get_universe(&self) -> Result<HashMap<String, Timestamp>, StoreError> {
        self.store.get_universe().await
    }

    pub async fn mark_node_as_seen(&self, address: &str, timestamp: Timestamp) -> Result<bool, StoreError> {
        self.store.mark_node_as_seen(address, timestamp).await
    }

    pub async fn broadcast_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError> {
        self.store.broadcast_request_id(request_id, paths).await
    }

    pub async fn broadcast_ignore_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError> {
        self.store.broadcast_ignore_request_id(request_id, paths).await
    }

    pub async fn broadcast_sticky_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.store.broadcast_sticky_session(session_id).await
    }
}

fn running_pipeline<'a>(record: &'a NodeRecord, pipeline: &str) -> Option<&'a Value> {
    record.data.get("pipelines")?.get(pipeline)
}

pub(crate) fn select_network_snapshot(snapshots: Vec<NetworkSnapshot>, now: Timestamp) -> Option<NetworkSnapshot> {
    let (fresh, stale): (Vec<_>, Vec<_>) = snapshots
        .into_iter()
        .partition(|s| now - s.timestamp <= NETWORK_FRESHNESS);

    if !fresh.is_empty() {
        return fresh.into_iter().reduce(|best, s| {
            if s.status.len() > best.status.len() { s } else { best }
        });
    }
    stale
        .into_iter()
        .reduce(|best, s| if s.timestamp > best.timestamp { s } else { best })
}

/// Accepts unix seconds/milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS[.ffffff]` in UTC.
fn parse_execution_timestamp(raw: &Value) -> Option<Timestamp> {
    if let Some(n) = raw.as_f64() {
        let ms = if n > 1e12 { n } else { n * 1000.0 };
        return Some(crate::store::from_millis(ms as i64));
    }
    let s = raw.as_str()?.trim();
    if let Ok(ts) = OffsetDateTime::parse(s, &Rfc3339) {
        return Some(ts);
    }
    let with_fraction = format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]");
    let plain = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    PrimitiveDateTime::parse(s, with_fraction)
        .or_else(|_| PrimitiveDateTime::parse(s, plain))
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}
