use super::{
    notify_all, FleetChange, NetworkSnapshot, NodeInfo, NodeRecord, StateStore, StoreEvent, Subscriber,
    ThreadKind, ThreadRegistry, Timestamp,
};
use crate::error::StoreError;
use crate::requests::PathKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

#[derive(Default)]
struct Maps {
    nodes: HashMap<String, NodeRecord>,
    universe: HashMap<String, Timestamp>,
    network: HashMap<String, NetworkSnapshot>,
    supervisors: Vec<String>,
}

/// Single-process store. Operations never fail; they are async only to match [`SharedStore`].
///
/// [`SharedStore`]: super::SharedStore
#[derive(Default)]
pub struct LocalStore {
    maps: RwLock<Maps>,
    threads: RwLock<Vec<(ThreadKind, Arc<dyn Subscriber>)>>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: StoreEvent) {
        notify_all(&self.subscribers, &event);
    }

    fn fan_out(&self, event: StoreEvent) {
        let threads: Vec<Arc<dyn Subscriber>> = self
            .threads
            .read()
            .iter()
            .filter(|(kind, _)| event.concerns(*kind))
            .map(|(_, handle)| handle.clone())
            .collect();
        let delivered = threads.len();
        for handle in threads {
            handle.notify(&event);
        }
        debug!(?event, delivered, "local broadcast");
        self.emit(event);
    }
}

#[async_trait]
impl StateStore for LocalStore {
    async fn node_info_update(&self, info: NodeInfo) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        {
            let mut maps = self.maps.write();
            let seen = maps.universe.entry(info.address.clone()).or_insert(now);
            *seen = (*seen).max(now);
            let last_seen = *seen;
            maps.nodes.insert(
                info.address.clone(),
                NodeRecord {
                    last_seen,
                    alias: info.alias,
                    data: info.data,
                },
            );
        }
        self.emit(StoreEvent::NodeUpdated { address: info.address });
        Ok(())
    }

    async fn get_universe(&self) -> Result<HashMap<String, Timestamp>, StoreError> {
        Ok(self.maps.read().universe.clone())
    }

    async fn get_node_info(&self, address: &str) -> Result<Option<NodeRecord>, StoreError> {
        Ok(self.maps.read().nodes.get(address).cloned())
    }

    async fn mark_node_as_seen(&self, address: &str, timestamp: Timestamp) -> Result<bool, StoreError> {
        let mut maps = self.maps.write();
        if maps.universe.get(address).is_some_and(|seen| *seen > timestamp) {
            return Ok(false);
        }
        maps.universe.insert(address.to_string(), timestamp);
        if let Some(record) = maps.nodes.get_mut(address) {
            record.last_seen = timestamp;
        }
        Ok(true)
    }

    async fn update_network_snapshot(
        &self,
        supervisor: &str,
        snapshot: NetworkSnapshot,
    ) -> Result<bool, StoreError> {
        if snapshot.status.is_empty() {
            return Ok(false);
        }
        {
            let mut maps = self.maps.write();
            if !maps.supervisors.iter().any(|s| s == supervisor) {
                maps.supervisors.push(supervisor.to_string());
            }
            maps.network.insert(supervisor.to_string(), snapshot);
        }
        self.emit(StoreEvent::NetworkUpdated {
            supervisor: supervisor.to_string(),
        });
        Ok(true)
    }

    async fn get_network_snapshot(&self, supervisor: &str) -> Result<Option<NetworkSnapshot>, StoreError> {
        Ok(self.maps.read().network.get(supervisor).cloned())
    }

    async fn get_network_supervisors(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.maps.read().supervisors.clone())
    }

    async fn broadcast_update_fleet(&self, change: FleetChange) -> Result<(), StoreError> {
        self.fan_out(StoreEvent::FleetChanged(change));
        Ok(())
    }

    async fn broadcast_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError> {
        self.fan_out(StoreEvent::RequestWatched {
            request_id: request_id.to_string(),
            paths: paths.to_vec(),
        });
        Ok(())
    }

    async fn broadcast_ignore_request_id(&self, request_id: &str, paths: &[PathKey]) -> Result<(), StoreError> {
        self.fan_out(StoreEvent::RequestIgnored {
            request_id: request_id.to_string(),
            paths: paths.to_vec(),
        });
        Ok(())
    }

    async fn broadcast_sticky_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.fan_out(StoreEvent::StickySession {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.subscribers.write().push(subscriber);
    }
}

impl ThreadRegistry for LocalStore {
    fn register_thread(&self, kind: ThreadKind, handle: Arc<dyn Subscriber>) {
        debug!(?kind, "thread registered");
        self.threads.write().push((kind, handle));
    }
}
