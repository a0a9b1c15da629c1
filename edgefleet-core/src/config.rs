use crate::error::ConfigError;
use crate::facade::Fleet;
use crate::requests::RequestTimeouts;
use crate::store::LockPolicy;
use crate::transport::MqttSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

pub const CONFIG_ENV: &str = "EDGEFLEET_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "edgefleet.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity stamped on every command as `INITIATOR_ID`.
    pub initiator_id: String,
    pub fleet: Fleet,
    pub state: StateConfig,
    pub requests: RequestTimeouts,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateMode {
    #[default]
    Internal,
    Shared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub mode: StateMode,
    /// Namespace of every key and channel in a shared backend.
    pub key_prefix: String,
    pub lock: LockPolicy,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            mode: StateMode::Internal,
            key_prefix: "edgefleet".into(),
            lock: LockPolicy::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initiator_id: "edgefleet-client".into(),
            fleet: Fleet::All,
            state: StateConfig::default(),
            requests: RequestTimeouts::default(),
            mqtt: Some(MqttSettings::default()),
        }
    }
}

impl ClientConfig {
    /// Strict parse; an empty document yields the defaults.
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await?;
        Self::from_yaml_str(&txt)
    }
}

/// Loads `.env`, then the YAML file named by `EDGEFLEET_CONFIG` (default `edgefleet.yaml`).
/// A missing or invalid file falls back to the defaults.
pub async fn load_config() -> ClientConfig {
    dotenvy::dotenv().ok();
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    if !Path::new(&path).exists() {
        warn!(%path, "no config file, using defaults");
        return ClientConfig::default();
    }
    ClientConfig::from_file(&path).await.unwrap_or_else(|e| {
        warn!(%path, error = %e, "invalid config, using defaults");
        ClientConfig::default()
    })
}
