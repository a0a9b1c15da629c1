//! Error types shared across the fleet client.
//!
//! Absence of state (unknown node, missing pipeline, no snapshot) is never an error here:
//! lookups return `Option`. These types cover the failures a caller has to act on.

use crate::requests::{PathKey, Target};

/// Schema type mismatch or missing mandatory field, with one message per offending field.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}", messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
}

impl ValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

/// Failures of a state store operation. Each operation fails on its own; nothing is transactional.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock {key} unavailable after {attempts} attempts")]
    LockUnavailable { key: String, attempts: u32 },
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

/// Terminal failures of a tracked request, and misuse of the registry index.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error("request {request_id} got no response")]
    NoResponse { request_id: String },
    #[error("request {request_id} timed out with {} of {} targets answered", answered(.targets), .targets.len())]
    Incomplete {
        request_id: String,
        targets: Vec<Target>,
    },
    #[error("request {request_id} rejected by remote node")]
    Rejected {
        request_id: String,
        targets: Vec<Target>,
    },
    #[error("path {0} is already watched by an open request")]
    PathAlreadyWatched(PathKey),
    #[error("request {request_id} does not watch path {path}")]
    PathNotWatched { request_id: String, path: PathKey },
    #[error("request {0} is already closed")]
    Closed(String),
    #[error("request {0} was dropped before settling")]
    Dropped(String),
}

fn answered(targets: &[Target]) -> usize {
    targets.iter().filter(|t| t.received).count()
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid schema definition in {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything that can go wrong while issuing a command through the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("instance {instance_id} not found in pipeline {pipeline_id}")]
    UnknownInstance {
        pipeline_id: String,
        instance_id: String,
    },
}
