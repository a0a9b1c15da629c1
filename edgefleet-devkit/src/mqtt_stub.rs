/*!
Mock transport for running a fleet client without a broker

Records every published command and can forward them to a channel so a test can play the
part of the edge nodes.
*/

use async_trait::async_trait;
use edgefleet_core::error::TransportError;
use edgefleet_core::transport::{MqttSettings, Transport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub node: String,
    pub topic: String,
    pub payload: Value,
}

impl MockMessage {
    pub fn action(&self) -> Option<&str> {
        self.payload.get("ACTION").and_then(Value::as_str)
    }
}

/// Stand-in for [`edgefleet_core::MqttTransport`].
#[derive(Clone, Default)]
pub struct MockTransport {
    settings: MqttSettings,
    published: Arc<Mutex<Vec<MockMessage>>>,
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published from now on is also sent on the returned channel.
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(sender);
        receiver
    }

    /// Makes every publish fail with `reason` until [`restore`](Self::restore).
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    pub fn restore(&self) {
        *self.failure.lock() = None;
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_node(&self, node: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.node == node)
            .cloned()
            .collect()
    }

    pub fn find_messages_by_action(&self, action: &str) -> Vec<MockMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.action() == Some(action))
            .cloned()
            .collect()
    }

    pub fn last_message(&self) -> Option<MockMessage> {
        self.published.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, node: &str, message: Value) -> Result<(), TransportError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(TransportError::Publish(reason));
        }
        let message = MockMessage {
            node: node.to_string(),
            topic: self.settings.command_topic(node),
            payload: message,
        };
        info!(topic = %message.topic, action = ?message.action(), "[mock] published");
        self.published.lock().push(message.clone());
        if let Some(sender) = self.sender.lock().as_ref() {
            // receiver gone means nobody is scripting replies
            let _ = sender.send(message);
        }
        Ok(())
    }
}

/// Builds inbound messages shaped like the ones edge nodes emit.
pub struct EdgeMessageBuilder {
    address: String,
    alias: String,
}

impl EdgeMessageBuilder {
    pub fn new(address: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            alias: alias.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn base(&self, event_type: &str) -> Value {
        json!({
            "EE_SENDER": self.address,
            "EE_ID": self.alias,
            "EE_EVENT_TYPE": event_type,
            "EE_TIMESTAMP": now_rfc3339(),
        })
    }

    /// Heartbeat reporting `streams` as its running `CONFIG_STREAMS`.
    pub fn heartbeat(&self, streams: Vec<Value>) -> Value {
        let mut message = self.base("HEARTBEAT");
        message["CONFIG_STREAMS"] = Value::Array(streams);
        message["CPU_USED"] = json!(12.5);
        message
    }

    /// Notification about `pipeline`, and about one instance when `instance` is `(signature, id)`.
    pub fn notification(
        &self,
        pipeline: &str,
        instance: Option<(&str, &str)>,
        kind: &str,
        code: i64,
    ) -> Value {
        let (signature, id) = match instance {
            Some((signature, id)) => (json!(signature), json!(id)),
            None => (Value::Null, Value::Null),
        };
        let mut message = self.base("NOTIFICATION");
        message["EE_PAYLOAD_PATH"] = json!([self.alias, pipeline, signature, id]);
        message["NOTIFICATION_TYPE"] = json!(kind);
        message["NOTIFICATION_CODE"] = json!(code);
        message["NOTIFICATION"] = json!(format!("{kind} {code}"));
        message
    }

    pub fn ack(&self, pipeline: &str, instance: Option<(&str, &str)>) -> Value {
        self.notification(pipeline, instance, "NORMAL", 1)
    }

    pub fn reject(&self, pipeline: &str, instance: Option<(&str, &str)>) -> Value {
        self.notification(pipeline, instance, "EXCEPTION", -1)
    }

    /// Supervisor payload carrying its view of the network.
    pub fn network_payload(&self, nodes: &[&str], timestamp: OffsetDateTime) -> Value {
        let status: serde_json::Map<String, Value> = nodes
            .iter()
            .map(|n| (n.to_string(), json!({"working": "ONLINE"})))
            .collect();
        let mut message = self.base("PAYLOAD");
        message["CURRENT_NETWORK"] = Value::Object(status);
        message["TIMESTAMP_EXECUTION"] = json!(timestamp.format(&Rfc3339).unwrap_or_default());
        message
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_and_forwards() {
        let transport = MockTransport::new();
        let mut rx = transport.setup_receiver();

        transport
            .publish("0xai_a", json!({"ACTION": "ARCHIVE_CONFIG", "PAYLOAD": "cam"}))
            .await
            .unwrap();

        let messages = transport.get_published_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "edgefleet/0xai_a/config");
        assert_eq!(transport.find_messages_by_action("ARCHIVE_CONFIG").len(), 1);
        assert!(transport.find_messages_by_node("0xai_b").is_empty());
        assert_eq!(rx.recv().await.unwrap().node, "0xai_a");
    }

    #[tokio::test]
    async fn test_mock_transport_failure() {
        let transport = MockTransport::new();
        transport.fail_with("broker down");
        assert!(transport.publish("0xai_a", json!({})).await.is_err());
        transport.restore();
        assert!(transport.publish("0xai_a", json!({})).await.is_ok());
        assert_eq!(transport.get_published_messages().len(), 1);
    }

    #[test]
    fn test_message_builders() {
        let node = EdgeMessageBuilder::new("0xai_a", "edge-a");
        let heartbeat = node.heartbeat(vec![json!({"NAME": "cam"})]);
        assert_eq!(heartbeat["EE_EVENT_TYPE"], "HEARTBEAT");
        assert_eq!(heartbeat["CONFIG_STREAMS"][0]["NAME"], "cam");

        let ack = node.ack("cam", Some(("DETECT", "d-1")));
        assert_eq!(ack["EE_PAYLOAD_PATH"], json!(["edge-a", "cam", "DETECT", "d-1"]));
        let reject = node.reject("cam", None);
        assert_eq!(reject["EE_PAYLOAD_PATH"][2], Value::Null);
        assert_eq!(reject["NOTIFICATION_CODE"], -1);
    }
}
