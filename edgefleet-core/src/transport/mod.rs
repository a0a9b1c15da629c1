//! Outbound side of the wire: publishing commands and signing them.

pub mod mqtt;

pub use mqtt::{spawn_listener, MqttSettings, MqttTransport};

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;

/// Publishes a command to one node. Fire-and-forget: confirmation comes back as notifications.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, node: &str, message: Value) -> Result<(), TransportError>;
}

/// Identity collaborator: turns a command into its signed envelope.
pub trait Signer: Send + Sync {
    fn sign(&self, message: Value) -> Result<Value, TransportError>;
}

/// Passes commands through untouched, for brokers that do not verify senders.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsigned;

impl Signer for Unsigned {
    fn sign(&self, message: Value) -> Result<Value, TransportError> {
        Ok(message)
    }
}
