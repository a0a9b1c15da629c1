/**
 * DISPATCHER - Inbound node messages
 *
 * ROLE: Routes every decoded message from a node to the state layer or to a pending request.
 *
 * HOW IT WORKS: Heartbeats update the node record, payloads may carry a supervisor's network
 * view, notifications go to the tracker indexed under their path. Any message marks its
 * sender as seen, on a best effort basis.
 */

use crate::error::StoreError;
use crate::facade::StateFacade;
use crate::requests::{Notification, Processed, RequestRegistry};
use crate::store::NodeInfo;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

const EVENT_TYPE_KEY: &str = "EE_EVENT_TYPE";
const STREAMS_KEY: &str = "CONFIG_STREAMS";
const PIPELINES_KEY: &str = "pipelines";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Heartbeat,
    Payload,
    Notification,
}

impl EventType {
    pub fn of(message: &Value) -> Option<Self> {
        match message.get(EVENT_TYPE_KEY)?.as_str()?.to_ascii_uppercase().as_str() {
            "HEARTBEAT" => Some(Self::Heartbeat),
            "PAYLOAD" => Some(Self::Payload),
            "NOTIFICATION" => Some(Self::Notification),
            _ => None,
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// No sender address; nothing recorded.
    Dropped,
    Heartbeat,
    Payload { network_stored: bool },
    /// `None` when no open request watches the notification's path.
    Notification(Option<Processed>),
    Unknown,
}

pub struct Dispatcher {
    facade: Arc<StateFacade>,
    registry: RequestRegistry,
}

impl Dispatcher {
    pub fn new(facade: Arc<StateFacade>, registry: RequestRegistry) -> Self {
        Self { facade, registry }
    }

    pub async fn dispatch(&self, message: &Value) -> Result<Dispatched, StoreError> {
        let Some(sender) = message.get("EE_SENDER").and_then(Value::as_str) else {
            warn!("message without EE_SENDER dropped");
            return Ok(Dispatched::Dropped);
        };
        // liveness is best effort; the message is routed either way
        if let Err(e) = self.facade.mark_node_as_seen(sender, OffsetDateTime::now_utc()).await {
            warn!(sender, error = %e, "failed to mark node as seen");
        }

        match EventType::of(message) {
            Some(EventType::Heartbeat) => {
                self.facade
                    .node_info_update(NodeInfo {
                        address: sender.to_string(),
                        alias: message.get("EE_ID").and_then(Value::as_str).map(str::to_string),
                        data: heartbeat_data(message),
                    })
                    .await?;
                Ok(Dispatched::Heartbeat)
            }
            Some(EventType::Payload) => {
                let network_stored = self.facade.store_network_info(message).await?;
                Ok(Dispatched::Payload { network_stored })
            }
            Some(EventType::Notification) => Ok(Dispatched::Notification(self.route_notification(message))),
            None => {
                debug!(sender, "message of unknown event type");
                Ok(Dispatched::Unknown)
            }
        }
    }

    fn route_notification(&self, message: &Value) -> Option<Processed> {
        let notification = Notification::from_message(message)?;
        let key = notification.path.key();
        let Some(tracker) = self.registry.find(&key) else {
            debug!(path = %key, "notification for unwatched path");
            return None;
        };
        Some(tracker.process(notification))
    }
}

/// Heartbeat content with `CONFIG_STREAMS` reindexed as
/// `pipelines[name] = {config, plugins[signature][instance] = {config}}`.
pub(crate) fn heartbeat_data(message: &Value) -> Value {
    let mut data = message.as_object().cloned().unwrap_or_default();
    let Some(Value::Array(streams)) = data.remove(STREAMS_KEY) else {
        return Value::Object(data);
    };

    let mut pipelines = Map::new();
    for stream in streams {
        let Value::Object(mut config) = stream else {
            continue;
        };
        let Some(name) = config.get("NAME").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let mut plugins = Map::new();
        if let Some(Value::Array(groups)) = config.remove("PLUGINS") {
            for group in groups {
                let Some(signature) = group.get("SIGNATURE").and_then(Value::as_str) else {
                    continue;
                };
                let instances: Map<String, Value> = group
                    .get("INSTANCES")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|instance| {
                        let mut config = instance.as_object()?.clone();
                        let id = config.remove("INSTANCE_ID")?.as_str()?.to_string();
                        Some((id, json!({ "config": config })))
                    })
                    .collect();
                plugins.insert(signature.to_string(), Value::Object(instances));
            }
        }
        pipelines.insert(name, json!({ "config": config, "plugins": plugins }));
    }
    data.insert(PIPELINES_KEY.into(), Value::Object(pipelines));
    Value::Object(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::{Fleet, StoreMode};
    use crate::requests::{AllTargetsOk, NotificationPath};
    use crate::store::{LocalStore, LockPolicy, MemoryBackend, SharedStore};

    fn dispatcher() -> (Dispatcher, Arc<StateFacade>, RequestRegistry) {
        let facade = StateFacade::new(StoreMode::Internal(Arc::new(LocalStore::new())), Fleet::All);
        let registry = RequestRegistry::default();
        (Dispatcher::new(facade.clone(), registry.clone()), facade, registry)
    }

    #[test]
    fn test_heartbeat_streams_are_reindexed() {
        let data = heartbeat_data(&json!({
            "EE_ID": "edge-a",
            "CPU": 12,
            "CONFIG_STREAMS": [{
                "NAME": "cam",
                "TYPE": "VideoStream",
                "URL": "rtsp://x",
                "PLUGINS": [{"SIGNATURE": "DETECT", "INSTANCES": [{"INSTANCE_ID": "d-1", "THRESHOLD": 0.4}]}]
            }]
        }));
        assert_eq!(data["CPU"], json!(12));
        assert!(data.get("CONFIG_STREAMS").is_none());
        assert_eq!(data["pipelines"]["cam"]["config"]["URL"], json!("rtsp://x"));
        assert_eq!(
            data["pipelines"]["cam"]["plugins"]["DETECT"]["d-1"]["config"],
            json!({"THRESHOLD": 0.4})
        );
    }

    #[tokio::test]
    async fn test_heartbeat_updates_node_info() {
        let (dispatcher, facade, _) = dispatcher();
        let outcome = dispatcher
            .dispatch(&json!({
                "EE_SENDER": "0xai_a",
                "EE_ID": "edge-a",
                "EE_EVENT_TYPE": "HEARTBEAT",
                "CONFIG_STREAMS": [{"NAME": "cam", "TYPE": "VideoStream", "PLUGINS": []}]
            }))
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Heartbeat);
        let record = facade.get_node_info("0xai_a").await.unwrap().unwrap();
        assert_eq!(record.alias.as_deref(), Some("edge-a"));
        let config = facade.get_running_pipeline_config("0xai_a", "cam").await.unwrap().unwrap();
        assert_eq!(config["TYPE"], json!("VideoStream"));
    }

    #[tokio::test]
    async fn test_every_message_marks_sender_seen() {
        let (dispatcher, facade, _) = dispatcher();
        let outcome = dispatcher
            .dispatch(&json!({"EE_SENDER": "0xai_b", "EE_EVENT_TYPE": "SOMETHING_NEW"}))
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Unknown);
        assert!(facade.get_universe().await.unwrap().contains_key("0xai_b"));

        assert_eq!(
            dispatcher.dispatch(&json!({"EE_EVENT_TYPE": "HEARTBEAT"})).await.unwrap(),
            Dispatched::Dropped
        );
    }

    #[tokio::test]
    async fn test_network_payload_is_stored() {
        let (dispatcher, facade, _) = dispatcher();
        let outcome = dispatcher
            .dispatch(&json!({
                "EE_SENDER": "0xai_sup",
                "EE_EVENT_TYPE": "PAYLOAD",
                "CURRENT_NETWORK": {"edge-a": {"working": "ONLINE"}}
            }))
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Payload { network_stored: true });
        assert!(facade.get_network_status(None).await.unwrap().is_some());

        let plain = dispatcher
            .dispatch(&json!({"EE_SENDER": "0xai_a", "EE_EVENT_TYPE": "PAYLOAD", "DATA": 1}))
            .await
            .unwrap();
        assert_eq!(plain, Dispatched::Payload { network_stored: false });
    }

    #[tokio::test]
    async fn test_notification_reaches_watching_tracker() {
        let (dispatcher, _, registry) = dispatcher();
        let handle = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        registry
            .watch_all(handle.tracker(), [NotificationPath::pipeline("0xai_a", "cam")])
            .unwrap();

        let unrelated = dispatcher
            .dispatch(&json!({
                "EE_SENDER": "0xai_a",
                "EE_EVENT_TYPE": "NOTIFICATION",
                "EE_PAYLOAD_PATH": ["edge-a", "other", null, null]
            }))
            .await
            .unwrap();
        assert_eq!(unrelated, Dispatched::Notification(None));

        let outcome = dispatcher
            .dispatch(&json!({
                "EE_SENDER": "0xai_a",
                "EE_EVENT_TYPE": "NOTIFICATION",
                "EE_PAYLOAD_PATH": ["edge-a", "cam", null, null],
                "NOTIFICATION_TYPE": "NORMAL",
                "NOTIFICATION_CODE": 0
            }))
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Notification(Some(Processed::Resolved)));
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_notification_routed_when_liveness_write_fails() {
        let backend = Arc::new(MemoryBackend::new());
        let policy = LockPolicy {
            retries: 1,
            ..LockPolicy::default()
        };
        let store = SharedStore::connect(backend.clone(), "fleet", policy).await.unwrap();
        let facade = StateFacade::new(StoreMode::Shared(Arc::new(store)), Fleet::All);
        let registry = RequestRegistry::default();
        let dispatcher = Dispatcher::new(facade.clone(), registry.clone());
        let handle = registry.create_request("ARCHIVE_CONFIG", Arc::new(AllTargetsOk));
        registry
            .watch_all(handle.tracker(), [NotificationPath::pipeline("0xai_a", "cam")])
            .unwrap();

        backend.fail_operation("set_nx");
        let outcome = dispatcher
            .dispatch(&json!({
                "EE_SENDER": "0xai_a",
                "EE_EVENT_TYPE": "NOTIFICATION",
                "EE_PAYLOAD_PATH": ["edge-a", "cam", null, null],
                "NOTIFICATION_TYPE": "NORMAL"
            }))
            .await
            .unwrap();
        assert_eq!(outcome, Dispatched::Notification(Some(Processed::Resolved)));
        assert!(handle.tracker().is_closed());
        assert!(handle.wait().await.is_ok());
        assert!(facade.get_universe().await.unwrap().is_empty());
    }
}
