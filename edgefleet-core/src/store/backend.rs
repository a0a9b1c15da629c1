//! Contract of the external key-value store behind [`SharedStore`](super::SharedStore).
//!
//! Each call is an independent, atomic, per-key operation: no transactions. Pub/sub messages
//! are plain strings; subscribers receive every message published after they subscribed.

use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), StoreError>;
    /// Sets the field only if absent. Returns whether it was written.
    async fn hset_nx(&self, key: &str, field: &str, value: String) -> Result<bool, StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;
    /// Sets a plain key only if absent (or expired), with a time-to-live.
    async fn set_nx(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Deletes a plain key only while it is live and still holds `value`. Returns whether it was deleted.
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    async fn publish(&self, channel: &str, message: String) -> Result<(), StoreError>;
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError>;
}

#[derive(Default)]
struct Data {
    hashes: HashMap<String, HashMap<String, String>>,
    keys: HashMap<String, (String, Instant)>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

/// Backend kept in process memory. Several [`SharedStore`](super::SharedStore)s built on
/// clones of the same `Arc<MemoryBackend>` behave like processes sharing one external store.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Data>,
    unavailable: Mutex<HashSet<&'static str>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the named operation (`"hset"`, `"publish"`, ...) fail until restored.
    pub fn fail_operation(&self, operation: &'static str) {
        self.unavailable.lock().insert(operation);
    }

    pub fn restore_operation(&self, operation: &'static str) {
        self.unavailable.lock().remove(operation);
    }

    fn check(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.unavailable.lock().contains(operation) {
            return Err(StoreError::Backend(format!("{operation} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check("hget")?;
        Ok(self.data.lock().hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: String) -> Result<(), StoreError> {
        self.check("hset")?;
        self.data
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: String) -> Result<bool, StoreError> {
        self.check("hset_nx")?;
        let mut data = self.data.lock();
        let hash = data.hashes.entry(key.to_string()).or_default();
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value);
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check("hgetall")?;
        Ok(self.data.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_nx(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError> {
        self.check("set_nx")?;
        let mut data = self.data.lock();
        let now = Instant::now();
        if data.keys.get(key).is_some_and(|(_, expiry)| *expiry > now) {
            return Ok(false);
        }
        data.keys.insert(key.to_string(), (value, now + ttl));
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.check("del")?;
        let mut data = self.data.lock();
        data.keys.remove(key);
        data.hashes.remove(key);
        Ok(())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check("del")?;
        let mut data = self.data.lock();
        let owned = data
            .keys
            .get(key)
            .is_some_and(|(held, expiry)| held == value && *expiry > Instant::now());
        if owned {
            data.keys.remove(key);
        }
        Ok(owned)
    }

    async fn publish(&self, channel: &str, message: String) -> Result<(), StoreError> {
        self.check("publish")?;
        if let Some(sender) = self.data.lock().channels.get(channel) {
            // no receivers is not an error for pub/sub
            let _ = sender.send(message);
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>, StoreError> {
        self.check("subscribe")?;
        let mut data = self.data.lock();
        let sender = data
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
