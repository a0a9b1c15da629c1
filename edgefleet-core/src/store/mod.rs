//! State stores: what the client knows about the fleet.
//!
//! Two variants expose the same [`StateStore`] capability set:
//! - [`LocalStore`]: in-process maps, broadcasts fanned out directly to registered threads.
//! - [`SharedStore`]: records kept in an external [`KeyValueBackend`], broadcasts sent over its
//!   pub/sub channels so every process sharing the backend converges.
//!
//! Only the local variant implements [`ThreadRegistry`]; registering a process-local worker
//! against a store shared between processes has no meaning.

pub mod backend;
pub mod local;
pub mod shared;

pub use backend::{KeyValueBackend, MemoryBackend};
pub use local::LocalStore;
pub use shared::{LockPolicy, SharedStore};

use crate::error::StoreError;
use crate::requests::PathKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Timestamp = OffsetDateTime;

pub fn to_millis(ts: Timestamp) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(ms: i64) -> Timestamp {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub(crate) mod millis {
    use super::{from_millis, to_millis, Timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(to_millis(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        i64::deserialize(d).map(from_millis)
    }
}

/// Decoded heartbeat as handed over by the dispatch layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    pub address: String,
    pub alias: Option<String>,
    pub data: Value,
}

/// Last known state of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(with = "millis")]
    pub last_seen: Timestamp,
    #[serde(default)]
    pub alias: Option<String>,
    pub data: Value,
}

/// One supervisor's view of the network at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub name: String,
    pub address: String,
    pub status: Map<String, Value>,
    #[serde(with = "millis")]
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "address", rename_all = "snake_case")]
pub enum FleetChange {
    Add(String),
    Remove(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Heartbeats,
    Notifications,
    Payloads,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    NodeUpdated { address: String },
    NetworkUpdated { supervisor: String },
    FleetChanged(FleetChange),
    RequestWatched { request_id: String, paths: Vec<PathKey> },
    RequestIgnored { request_id: String, paths: Vec<PathKey> },
    StickySession { session_id: String },
}

impl StoreEvent {
    /// Whether a worker thread of `kind` has to hear about this event.
    pub fn concerns(&self, kind: ThreadKind) -> bool {
        match self {
            StoreEvent::RequestWatched { .. } | StoreEvent::RequestIgnored { .. } => {
                kind == ThreadKind::Notifications
            }
            StoreEvent::FleetChanged(_) | StoreEvent::StickySession { .. } => true,
            StoreEvent::NodeUpdated { .. } | StoreEvent::NetworkUpdated { .. } => false,
        }
    }
}

/// Observer invoked synchronously on each relevant store mutation or broadcast.
pub trait Subscriber: Send + Sync {
    fn notify(&self, event: &StoreEvent);
}

/// Notifies a snapshot of `subscribers` taken before any callback runs, so callbacks may subscribe.
pub(crate) fn notify_all(subscribers: &RwLock<Vec<Arc<dyn Subscriber>>>, event: &StoreEvent) {
    let snapshot: Vec<Arc<dyn Subscriber>> = subscribers.read().clone();
    for subscriber in snapshot {
        subscriber.notify(event);
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Upserts the node record and refreshes the universe entry, fleet membership regardless.
    async fn node_info_update(&self, info: NodeInfo) -> Result<(), StoreError>;

    async fn get_universe(&self) -> Result<HashMap<String, Timestamp>, StoreError>;

    async fn get_node_info(&self, address: &str) -> Result<Option<NodeRecord>, StoreError>;

    /// Advances last-seen without a payload. Returns false when `timestamp` is older than what is stored.
    async fn mark_node_as_seen(&self, address: &str, timestamp: Timestamp) -> Result<bool, StoreError>;

    /// Stores the snapshot unless its status is empty, in which case nothing happens and false is returned.
    async fn update_network_snapshot(
        &self,
        supervisor: &str,
        snapshot: NetworkSnapshot,
    ) -> Result<bool, StoreError>;

    async fn get_network_snapshot(&self, supervisor: &str) -> Result<Option<NetworkSnapshot>, StoreError>;

    /// Supervisors in the order they were first seen.
    async fn get_network_supervisors(&self) -> Result<Vec<String>, StoreError>;

    async fn broadcast_update_fleet(&self, change: FleetChange) -> Result<(), StoreError>;

    async fn broadcast_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError>;

    async fn broadcast_ignore_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError>;

    async fn broadcast_sticky_session(&self, session_id: &str) -> Result<(), StoreError>;

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>);
}

/// Process-local worker registration, only meaningful for [`LocalStore`].
pub trait ThreadRegistry: Send + Sync {
    fn register_thread(&self, kind: ThreadKind, handle: Arc<dyn Subscriber>);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Subscriber recording every event it is notified of.
    #[derive(Default)]
    pub struct Recorder {
        pub events: Mutex<Vec<StoreEvent>>,
    }

    impl Recorder {
        pub fn taken(&self) -> Vec<StoreEvent> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl Subscriber for Recorder {
        fn notify(&self, event: &StoreEvent) {
            self.events.lock().push(event.clone());
        }
    }
}
