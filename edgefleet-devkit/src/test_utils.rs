/*!
Test harness wiring a complete in-process fleet client

- local store, facade, request registry and dispatcher
- `FleetClient` publishing through a [`MockTransport`]
- simulated edge nodes answering commands
*/

use crate::mqtt_stub::{EdgeMessageBuilder, MockMessage, MockTransport};
use anyhow::Result;
use edgefleet_core::client::{ARCHIVE_CONFIG, UPDATE_CONFIG, UPDATE_PIPELINE_INSTANCE};
use edgefleet_core::{
    Dispatched, Dispatcher, FleetClient, Fleet, LocalStore, RequestRegistry, RequestTimeouts,
    StateFacade, StoreMode,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How simulated nodes answer commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Reject,
    /// Answers only the first path of each command.
    Partial,
    Silent,
}

pub struct TestHarness {
    pub transport: MockTransport,
    pub facade: Arc<StateFacade>,
    pub registry: RequestRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub client: FleetClient,
    nodes: HashMap<String, String>,
    responder: Option<JoinHandle<()>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(Fleet::All, RequestTimeouts::default())
    }

    pub fn with_settings(fleet: Fleet, timeouts: RequestTimeouts) -> Self {
        init_tracing();
        let facade = StateFacade::new(StoreMode::Internal(Arc::new(LocalStore::new())), fleet);
        let registry = RequestRegistry::new(timeouts);
        let transport = MockTransport::new();
        let dispatcher = Arc::new(Dispatcher::new(facade.clone(), registry.clone()));
        let client = FleetClient::new(
            "devkit",
            facade.clone(),
            registry.clone(),
            Arc::new(transport.clone()),
        );
        Self {
            transport,
            facade,
            registry,
            dispatcher,
            client,
            nodes: HashMap::new(),
            responder: None,
        }
    }

    /// Registers a simulated node; its alias appears in every message it sends.
    pub fn node(&mut self, address: &str, alias: &str) -> EdgeMessageBuilder {
        self.nodes.insert(address.to_string(), alias.to_string());
        EdgeMessageBuilder::new(address, alias)
    }

    pub async fn deliver(&self, message: &Value) -> Result<Dispatched> {
        Ok(self.dispatcher.dispatch(message).await?)
    }

    pub async fn send_heartbeat(&self, address: &str, streams: Vec<Value>) -> Result<()> {
        let message = self.builder(address)?.heartbeat(streams);
        self.deliver(&message).await?;
        debug!(address, "heartbeat delivered");
        Ok(())
    }

    fn builder(&self, address: &str) -> Result<EdgeMessageBuilder> {
        let alias = self
            .nodes
            .get(address)
            .ok_or_else(|| anyhow::anyhow!("unknown simulated node {address}"))?;
        Ok(EdgeMessageBuilder::new(address, alias.as_str()))
    }

    /// Starts answering every published command the way `reply` says, replacing any previous responder.
    pub fn respond_with(&mut self, reply: Reply) {
        if let Some(previous) = self.responder.take() {
            previous.abort();
        }
        let mut commands = self.transport.setup_receiver();
        let dispatcher = self.dispatcher.clone();
        let nodes = self.nodes.clone();
        self.responder = Some(tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                let Some(alias) = nodes.get(&command.node) else {
                    continue;
                };
                let node = EdgeMessageBuilder::new(command.node.clone(), alias.as_str());
                for message in answers(&node, &command, reply) {
                    if let Err(e) = dispatcher.dispatch(&message).await {
                        warn!(error = %e, "simulated answer not dispatched");
                    }
                }
            }
        }));
        info!(?reply, "responder started");
    }

    /// Waits until `count` commands were published or `timeout_ms` elapsed.
    pub async fn wait_for_commands(&self, count: usize, timeout_ms: u64) -> Vec<MockMessage> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let published = self.transport.get_published_messages();
            if published.len() >= count || tokio::time::Instant::now() >= deadline {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn assert_command_sent(&self, node: &str, action: &str) -> Result<MockMessage> {
        self.transport
            .find_messages_by_node(node)
            .into_iter()
            .rev()
            .find(|m| m.action() == Some(action))
            .ok_or_else(|| anyhow::anyhow!("no {action} command sent to {node}"))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(responder) = self.responder.take() {
            responder.abort();
        }
    }
}

/// Paths a node reports on for `command`, as `(pipeline, Some((signature, instance)))`.
fn answered_paths(command: &MockMessage) -> Vec<(String, Option<(String, String)>)> {
    let payload = &command.payload["PAYLOAD"];
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
    match command.action() {
        Some(UPDATE_CONFIG) => {
            let pipeline = text(&payload["NAME"]);
            let mut paths = vec![(pipeline.clone(), None)];
            for group in payload["PLUGINS"].as_array().into_iter().flatten() {
                for instance in group["INSTANCES"].as_array().into_iter().flatten() {
                    paths.push((
                        pipeline.clone(),
                        Some((text(&group["SIGNATURE"]), text(&instance["INSTANCE_ID"]))),
                    ));
                }
            }
            paths
        }
        Some(UPDATE_PIPELINE_INSTANCE) => vec![(
            text(&payload["NAME"]),
            Some((text(&payload["SIGNATURE"]), text(&payload["INSTANCE_ID"]))),
        )],
        Some(ARCHIVE_CONFIG) => vec![(text(payload), None)],
        _ => Vec::new(),
    }
}

fn answers(node: &EdgeMessageBuilder, command: &MockMessage, reply: Reply) -> Vec<Value> {
    let paths = answered_paths(command);
    let take = match reply {
        Reply::Silent => 0,
        Reply::Partial => 1,
        Reply::Ack | Reply::Reject => paths.len(),
    };
    paths
        .iter()
        .take(take)
        .map(|(pipeline, instance)| {
            let instance = instance.as_ref().map(|(s, i)| (s.as_str(), i.as_str()));
            match reply {
                Reply::Reject => node.reject(pipeline, instance),
                _ => node.ack(pipeline, instance),
            }
        })
        .collect()
}

/// Installs a `tracing` subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Declares an async test running against a fresh [`TestHarness`].
///
/// ```ignore
/// fleet_test!(test_close, |harness| {
///     harness.node("0xai_a", "edge-a");
///     harness.respond_with(Reply::Ack);
///     harness.client.close_pipeline("0xai_a", "cam").await?;
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! fleet_test {
    ($name:ident, |$harness:ident| $body:block) => {
        #[tokio::test]
        async fn $name() {
            async fn run($harness: &mut $crate::test_utils::TestHarness) -> anyhow::Result<()> $body

            let mut harness = $crate::test_utils::TestHarness::new();
            if let Err(e) = run(&mut harness).await {
                panic!("test '{}' failed: {}", stringify!($name), e);
            }
        }
    };
}
