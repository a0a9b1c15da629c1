use super::Transport;
use crate::dispatch::Dispatcher;
use crate::error::TransportError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Inbound streams, one per message family, each under `{topic_root}/{node}/`.
const INBOUND_STREAMS: [&str; 3] = ["heartbeats", "notifications", "payloads"];
const COMMAND_STREAM: &str = "config";
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_root: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "edgefleet-client".into(),
            topic_root: "edgefleet".into(),
            keep_alive_secs: 15,
        }
    }
}

impl MqttSettings {
    pub fn command_topic(&self, node: &str) -> String {
        format!("{}/{node}/{COMMAND_STREAM}", self.topic_root)
    }

    pub fn inbound_topics(&self) -> Vec<String> {
        INBOUND_STREAMS
            .iter()
            .map(|stream| format!("{}/+/{stream}", self.topic_root))
            .collect()
    }

    pub fn options(&self) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &self.host, self.port);
        opts.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        opts
    }
}

/// Publishes JSON commands on `{topic_root}/{node}/config`.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    settings: MqttSettings,
}

impl MqttTransport {
    /// The event loop must be driven, typically by [`spawn_listener`], for publishes to go out.
    pub fn new(settings: MqttSettings) -> (Self, EventLoop) {
        let (client, eventloop) = AsyncClient::new(settings.options(), 64);
        (Self { client, settings }, eventloop)
    }

    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, node: &str, message: Value) -> Result<(), TransportError> {
        let topic = self.settings.command_topic(node);
        let payload = serde_json::to_vec(&message)?;
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        debug!(%topic, "command published");
        Ok(())
    }
}

/// Subscribes to the inbound streams and feeds every decoded message to `dispatcher`.
pub fn spawn_listener(
    transport: &MqttTransport,
    eventloop: EventLoop,
    dispatcher: Arc<Dispatcher>,
) -> JoinHandle<()> {
    let client = transport.client.clone();
    let topics = transport.settings.inbound_topics();
    tokio::spawn(async move {
        if let Err(e) = listen(client, eventloop, topics, dispatcher).await {
            error!(error = %e, "mqtt listener stopped");
        }
    })
}

async fn listen(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: Vec<String>,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    for topic in &topics {
        client.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    info!(?topics, "mqtt listener subscribed");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                let message: Value = match serde_json::from_slice(&p.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(topic = %p.topic, error = %e, "invalid JSON message dropped");
                        continue;
                    }
                };
                if let Err(e) = dispatcher.dispatch(&message).await {
                    warn!(topic = %p.topic, error = %e, "message dispatch failed");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = ?e, "mqtt connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics() {
        let settings = MqttSettings {
            topic_root: "fleet".into(),
            ..MqttSettings::default()
        };
        assert_eq!(settings.command_topic("0xai_a"), "fleet/0xai_a/config");
        assert_eq!(
            settings.inbound_topics(),
            vec!["fleet/+/heartbeats", "fleet/+/notifications", "fleet/+/payloads"]
        );
    }

    #[test]
    fn test_settings_defaults_fill_missing_keys() {
        let settings: MqttSettings = serde_yaml::from_str("host: broker.local").unwrap();
        assert_eq!(settings.host, "broker.local");
        assert_eq!(settings.port, 1883);
        assert_eq!(settings.keep_alive_secs, 15);
    }
}
