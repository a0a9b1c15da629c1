/**
 * FLEET CLIENT - Outbound commands to edge nodes
 *
 * ROLE:
 * Turns pipeline edits into node commands and waits for the nodes to confirm them.
 *
 * HOW IT WORKS:
 * - Wraps the action in the envelope (EE_ID, SESSION_ID, TIME, INITIATOR_ID) and signs it
 * - Creates a tracker, watches then indexes every expected notification path
 * - Broadcasts the watched paths so other processes route answers here
 * - Publishes, awaits the outcome, and withdraws the paths when the publish fails
 */

use crate::error::ClientError;
use crate::facade::StateFacade;
use crate::models::{Pipeline, PluginInstance};
use crate::requests::{
    AllTargetsOk, NotificationPath, PathKey, RequestHandle, RequestRegistry, Resolution,
    ResolutionStrategy,
};
use crate::schema::{compute_differences, Config};
use crate::store::to_millis;
use crate::transport::{Signer, Transport, Unsigned};
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const UPDATE_CONFIG: &str = "UPDATE_CONFIG";
pub const UPDATE_PIPELINE_INSTANCE: &str = "UPDATE_PIPELINE_INSTANCE";
pub const ARCHIVE_CONFIG: &str = "ARCHIVE_CONFIG";
pub const INSTANCE_COMMAND: &str = "INSTANCE_COMMAND";

pub struct FleetClient {
    initiator_id: String,
    session_id: String,
    facade: Arc<StateFacade>,
    registry: RequestRegistry,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    strategy: Arc<dyn ResolutionStrategy>,
}

impl FleetClient {
    pub fn new(
        initiator_id: impl Into<String>,
        facade: Arc<StateFacade>,
        registry: RequestRegistry,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            initiator_id: initiator_id.into(),
            session_id: Uuid::new_v4().to_string(),
            facade,
            registry,
            transport,
            signer: Arc::new(Unsigned),
            strategy: Arc::new(AllTargetsOk),
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    /// Strategy used by every command that does not pass its own.
    pub fn with_strategy(mut self, strategy: Arc<dyn ResolutionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn initiator_id(&self) -> &str {
        &self.initiator_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn facade(&self) -> &Arc<StateFacade> {
        &self.facade
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Announces this session so every process sharing the store routes its notifications here.
    pub async fn start_session(&self) -> Result<(), ClientError> {
        self.facade.broadcast_sticky_session(&self.session_id).await?;
        info!(session_id = %self.session_id, initiator = %self.initiator_id, "session started");
        Ok(())
    }

    /// Deploys (or redeploys) a whole pipeline. Clears its dirty state on success.
    pub async fn deploy_pipeline(&self, node: &str, pipeline: &mut Pipeline) -> Result<Resolution, ClientError> {
        let mut paths = vec![NotificationPath::pipeline(node, pipeline.name())];
        paths.extend(pipeline.instances().iter().map(|i| {
            NotificationPath::instance(node, pipeline.name(), i.signature(), i.id())
        }));
        let resolution = self
            .send_command(node, UPDATE_CONFIG, pipeline.to_payload(), paths, None)
            .await?;
        pipeline.clear_dirty();
        Ok(resolution)
    }

    /// Sends only what differs from the instance config the node last reported.
    /// Returns `None` without sending anything when nothing differs.
    pub async fn update_instance(
        &self,
        node: &str,
        pipeline: &mut Pipeline,
        instance_id: &str,
    ) -> Result<Option<Resolution>, ClientError> {
        let name = pipeline.name().to_string();
        let instance = pipeline
            .get_instance_mut(instance_id)
            .ok_or_else(|| ClientError::UnknownInstance {
                pipeline_id: name.clone(),
                instance_id: instance_id.to_string(),
            })?;

        let desired = instance_config(instance);
        let running = self
            .facade
            .get_running_instance_config(node, &name, instance_id)
            .await?;
        let patch = match running {
            Some(running) => compute_differences(&running, &desired),
            None => Some(desired),
        };
        let Some(patch) = patch else {
            debug!(node, pipeline = %name, instance = instance_id, "instance already up to date");
            instance.clear_dirty();
            return Ok(None);
        };

        let payload = json!({
            "NAME": name,
            "SIGNATURE": instance.signature(),
            "INSTANCE_ID": instance_id,
            "INSTANCE_CONFIG": patch,
        });
        let path = NotificationPath::instance(node, &name, instance.signature(), instance_id);
        let resolution = self
            .send_command(node, UPDATE_PIPELINE_INSTANCE, payload, vec![path], None)
            .await?;
        instance.clear_dirty();
        Ok(Some(resolution))
    }

    pub async fn close_pipeline(&self, node: &str, pipeline: &str) -> Result<Resolution, ClientError> {
        let path = NotificationPath::pipeline(node, pipeline);
        self.send_command(node, ARCHIVE_CONFIG, Value::String(pipeline.to_string()), vec![path], None)
            .await
    }

    pub async fn send_instance_command(
        &self,
        node: &str,
        pipeline: &str,
        signature: &str,
        instance: &str,
        command: Value,
    ) -> Result<Resolution, ClientError> {
        let payload = json!({
            "NAME": pipeline,
            "SIGNATURE": signature,
            "INSTANCE_ID": instance,
            "INSTANCE_CONFIG": { (INSTANCE_COMMAND): command },
        });
        let path = NotificationPath::instance(node, pipeline, signature, instance);
        self.send_command(node, UPDATE_PIPELINE_INSTANCE, payload, vec![path], None)
            .await
    }

    /// Issues one command and waits for it to settle.
    ///
    /// Paths are watched and indexed before anything is published, so an answer arriving
    /// immediately still finds its request.
    pub async fn send_command(
        &self,
        node: &str,
        action: &str,
        payload: Value,
        paths: Vec<NotificationPath>,
        strategy: Option<Arc<dyn ResolutionStrategy>>,
    ) -> Result<Resolution, ClientError> {
        let handle = self
            .registry
            .create_request(action, strategy.unwrap_or_else(|| self.strategy.clone()));
        let keys = match self.registry.watch_all(handle.tracker(), paths) {
            Ok(keys) => keys,
            Err(e) => {
                handle.tracker().close();
                return Err(e.into());
            }
        };

        if let Err(e) = self.publish(node, action, payload, &handle, &keys).await {
            warn!(request_id = %handle.id(), node, action, error = %e, "command not sent");
            handle.tracker().close();
            self.ignore(handle.id(), &keys).await;
            return Err(e);
        }

        let request_id = handle.id().to_string();
        let outcome = handle.wait().await;
        self.ignore(&request_id, &keys).await;
        match &outcome {
            Ok(_) => info!(%request_id, node, action, "command succeeded"),
            Err(e) => warn!(%request_id, node, action, error = %e, "command failed"),
        }
        outcome.map_err(ClientError::from)
    }

    async fn publish(
        &self,
        node: &str,
        action: &str,
        payload: Value,
        handle: &RequestHandle,
        keys: &[PathKey],
    ) -> Result<(), ClientError> {
        self.facade.broadcast_request_id(handle.id(), keys).await?;
        let alias = self
            .facade
            .get_node_info(node)
            .await?
            .and_then(|record| record.alias)
            .unwrap_or_else(|| node.to_string());
        let envelope = json!({
            "ACTION": action,
            "PAYLOAD": payload,
            "EE_ID": alias,
            "INITIATOR_ID": self.initiator_id,
            "SESSION_ID": self.session_id,
            "TIME": to_millis(OffsetDateTime::now_utc()),
        });
        let signed = self.signer.sign(envelope)?;
        self.transport.publish(node, signed).await?;
        debug!(request_id = %handle.id(), node, action, paths = keys.len(), "command published");
        Ok(())
    }

    async fn ignore(&self, request_id: &str, keys: &[PathKey]) {
        if let Err(e) = self.facade.broadcast_ignore_request_id(request_id, keys).await {
            warn!(request_id, error = %e, "failed to broadcast request ignore");
        }
    }
}

/// Instance payload without its id, comparable to what heartbeats report.
fn instance_config(instance: &PluginInstance) -> Config {
    let mut config = match instance.to_payload() {
        Value::Object(config) => config,
        _ => Config::new(),
    };
    config.remove("INSTANCE_ID");
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Dispatcher;
    use crate::error::{RequestError, TransportError};
    use crate::facade::{Fleet, StoreMode};
    use crate::models::DataCaptureThread;
    use crate::requests::RequestTimeouts;
    use crate::store::LocalStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, Value)>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for Recording {
        async fn publish(&self, node: &str, message: Value) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Publish("broker unreachable".into()));
            }
            self.sent.lock().push((node.to_string(), message));
            Ok(())
        }
    }

    struct Setup {
        client: FleetClient,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<Recording>,
    }

    fn setup(transport: Recording, timeouts: RequestTimeouts) -> Setup {
        let facade = StateFacade::new(StoreMode::Internal(Arc::new(LocalStore::new())), Fleet::All);
        let registry = RequestRegistry::new(timeouts);
        let transport = Arc::new(transport);
        let dispatcher = Arc::new(Dispatcher::new(facade.clone(), registry.clone()));
        let client = FleetClient::new("ops", facade, registry, transport.clone());
        Setup {
            client,
            dispatcher,
            transport,
        }
    }

    fn pipeline() -> Pipeline {
        let dct = DataCaptureThread::make(
            json!({"TYPE": "VideoStream", "URL": "rtsp://cam"}).as_object().cloned().unwrap(),
            None,
            None,
        )
        .unwrap();
        let mut pipeline = Pipeline::new("cam", dct);
        pipeline
            .add_instance(
                PluginInstance::make("d-1", "DETECT", json!({"THRESHOLD": 0.4}).as_object().cloned().unwrap(), None)
                    .unwrap(),
            )
            .unwrap();
        pipeline
    }

    fn ack(path: [Value; 4]) -> Value {
        json!({
            "EE_SENDER": "0xai_a",
            "EE_EVENT_TYPE": "NOTIFICATION",
            "EE_PAYLOAD_PATH": path,
            "NOTIFICATION_TYPE": "NORMAL",
            "NOTIFICATION_CODE": 1
        })
    }

    /// Answers with `messages` once a request is watching.
    fn respond(setup: &Setup, messages: Vec<Value>) {
        let registry = setup.client.registry().clone();
        let dispatcher = setup.dispatcher.clone();
        tokio::spawn(async move {
            while registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            for message in messages {
                dispatcher.dispatch(&message).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_deploy_pipeline_resolves_on_all_acks() {
        let setup = setup(Recording::default(), RequestTimeouts::default());
        let mut pipeline = pipeline();
        assert!(pipeline.is_dirty());
        respond(
            &setup,
            vec![
                ack([json!("edge-a"), json!("cam"), json!("DETECT"), json!("d-1")]),
                ack([json!("edge-a"), json!("cam"), Value::Null, Value::Null]),
            ],
        );

        let resolution = setup.client.deploy_pipeline("0xai_a", &mut pipeline).await.unwrap();
        assert_eq!(resolution.targets.len(), 2);
        assert!(!pipeline.is_dirty());
        assert!(setup.client.registry().is_empty());

        let sent = setup.transport.sent.lock();
        assert_eq!(sent.len(), 1);
        let (node, message) = &sent[0];
        assert_eq!(node, "0xai_a");
        assert_eq!(message["ACTION"], json!(UPDATE_CONFIG));
        assert_eq!(message["INITIATOR_ID"], json!("ops"));
        assert_eq!(message["SESSION_ID"], json!(setup.client.session_id()));
        assert_eq!(message["EE_ID"], json!("0xai_a"));
        assert_eq!(message["PAYLOAD"]["PLUGINS"][0]["INSTANCES"][0]["INSTANCE_ID"], json!("d-1"));
    }

    #[tokio::test]
    async fn test_update_instance_sends_only_differences() {
        let setup = setup(Recording::default(), RequestTimeouts::default());
        setup
            .dispatcher
            .dispatch(&json!({
                "EE_SENDER": "0xai_a",
                "EE_ID": "edge-a",
                "EE_EVENT_TYPE": "HEARTBEAT",
                "CONFIG_STREAMS": [{
                    "NAME": "cam", "TYPE": "VideoStream",
                    "PLUGINS": [{"SIGNATURE": "DETECT", "INSTANCES": [{"INSTANCE_ID": "d-1", "THRESHOLD": 0.4}]}]
                }]
            }))
            .await
            .unwrap();

        let mut pipeline = pipeline();
        assert!(setup.client.update_instance("0xai_a", &mut pipeline, "d-1").await.unwrap().is_none());
        assert!(setup.transport.sent.lock().is_empty());

        pipeline
            .get_instance_mut("d-1")
            .unwrap()
            .update_config(json!({"THRESHOLD": 0.8}).as_object().cloned().unwrap())
            .unwrap();
        respond(&setup, vec![ack([json!("edge-a"), json!("cam"), json!("DETECT"), json!("d-1")])]);
        let resolution = setup.client.update_instance("0xai_a", &mut pipeline, "d-1").await.unwrap();
        assert!(resolution.is_some());
        assert!(!pipeline.get_instance("d-1").unwrap().is_dirty());

        let sent = setup.transport.sent.lock();
        let message = &sent[0].1;
        assert_eq!(message["ACTION"], json!(UPDATE_PIPELINE_INSTANCE));
        assert_eq!(message["EE_ID"], json!("edge-a"));
        assert_eq!(message["PAYLOAD"]["INSTANCE_CONFIG"], json!({"THRESHOLD": 0.8}));
    }

    #[tokio::test]
    async fn test_update_unknown_instance() {
        let setup = setup(Recording::default(), RequestTimeouts::default());
        let err = setup
            .client
            .update_instance("0xai_a", &mut pipeline(), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::UnknownInstance { .. }));
    }

    #[tokio::test]
    async fn test_publish_failure_releases_paths() {
        let setup = setup(
            Recording {
                fail: true,
                ..Recording::default()
            },
            RequestTimeouts::default(),
        );
        let err = setup.client.close_pipeline("0xai_a", "cam").await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(TransportError::Publish(_))));
        assert!(setup.client.registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_times_out() {
        let setup = setup(
            Recording::default(),
            RequestTimeouts {
                first_response: Duration::from_secs(1),
                completion: Duration::from_secs(5),
            },
        );
        let err = setup
            .client
            .send_instance_command("0xai_a", "cam", "DETECT", "d-1", json!("RESTART"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Request(RequestError::NoResponse { .. })));

        let sent = setup.transport.sent.lock();
        assert_eq!(sent[0].1["PAYLOAD"]["INSTANCE_CONFIG"], json!({"INSTANCE_COMMAND": "RESTART"}));
    }

    #[tokio::test]
    async fn test_concurrent_command_on_watched_path_is_refused() {
        let setup = setup(Recording::default(), RequestTimeouts::default());
        let busy = setup
            .client
            .registry()
            .create_request(ARCHIVE_CONFIG, Arc::new(AllTargetsOk));
        setup
            .client
            .registry()
            .watch_all(busy.tracker(), [NotificationPath::pipeline("0xai_a", "cam")])
            .unwrap();

        let err = setup.client.close_pipeline("0xai_a", "cam").await.unwrap_err();
        assert!(matches!(err, ClientError::Request(RequestError::PathAlreadyWatched(_))));
        assert!(setup.transport.sent.lock().is_empty());
    }
}
