//! Request/response correlation.
//!
//! A command sent to a node is answered asynchronously by notifications, each carrying the
//! path (`node / pipeline / signature / instance`) it is about. A [`RequestTracker`] watches one
//! or more paths and settles exactly once; the [`RequestRegistry`] routes inbound notifications
//! to the tracker watching their path.

pub mod registry;
pub mod tracker;

pub use registry::{RequestHandle, RequestRegistry, RequestTimeouts};
pub use tracker::{Processed, RequestTracker, Resolution};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const KEY_SEPARATOR: char = '/';
const WILDCARD: &str = "*";

/// Normalized, immutable index key for a watched path.
///
/// Built only through [`PathKey::from_parts`] (or [`NotificationPath::key`]) so that watching,
/// indexing, lookups and removal always agree on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathKey(String);

impl PathKey {
    /// Joins trimmed segments; empty segments become a wildcard and trailing wildcards are dropped.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut segments: Vec<String> = parts
            .into_iter()
            .map(|p| {
                let p = p.as_ref().trim();
                if p.is_empty() { WILDCARD.to_string() } else { p.to_string() }
            })
            .collect();
        while segments.last().is_some_and(|s| s == WILDCARD) {
            segments.pop();
        }
        Self(segments.join(&KEY_SEPARATOR.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Location a notification refers to. Only `node` is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationPath {
    pub node: String,
    pub pipeline: Option<String>,
    pub signature: Option<String>,
    pub instance: Option<String>,
}

impl NotificationPath {
    pub fn pipeline(node: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            pipeline: Some(pipeline.into()),
            signature: None,
            instance: None,
        }
    }

    pub fn instance(
        node: impl Into<String>,
        pipeline: impl Into<String>,
        signature: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            pipeline: Some(pipeline.into()),
            signature: Some(signature.into()),
            instance: Some(instance.into()),
        }
    }

    pub fn key(&self) -> PathKey {
        PathKey::from_parts([
            self.node.as_str(),
            self.pipeline.as_deref().unwrap_or_default(),
            self.signature.as_deref().unwrap_or_default(),
            self.instance.as_deref().unwrap_or_default(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Normal,
    Abnormal,
    Exception,
    Other(String),
}

impl NotificationKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Self::Normal,
            "ABNORMAL" | "ABNORMAL FUNCTIONING" => Self::Abnormal,
            "EXCEPTION" => Self::Exception,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Decoded notification, correlated to requests through its path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub path: NotificationPath,
    pub kind: NotificationKind,
    pub code: Option<i64>,
    pub message: Option<String>,
    pub payload: Value,
}

impl Notification {
    /// Decodes a transport message. The node is the sender address; the rest of the path comes
    /// from `EE_PAYLOAD_PATH[1..4]`.
    pub fn from_message(message: &Value) -> Option<Self> {
        let node = message.get("EE_SENDER")?.as_str()?.to_string();
        let raw_path = message.get("EE_PAYLOAD_PATH").and_then(Value::as_array);
        let segment = |i: usize| {
            raw_path
                .and_then(|p| p.get(i))
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            path: NotificationPath {
                node,
                pipeline: segment(1),
                signature: segment(2),
                instance: segment(3),
            },
            kind: message
                .get("NOTIFICATION_TYPE")
                .and_then(Value::as_str)
                .map(NotificationKind::parse)
                .unwrap_or(NotificationKind::Normal),
            code: message.get("NOTIFICATION_CODE").and_then(Value::as_i64),
            message: message
                .get("NOTIFICATION")
                .and_then(Value::as_str)
                .map(str::to_string),
            payload: message.clone(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.kind == NotificationKind::Normal && self.code.is_none_or(|c| c >= 0)
    }
}

/// One watched path and what arrived for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub path: NotificationPath,
    pub received: bool,
    pub notifications: Vec<Notification>,
}

impl Target {
    fn new(path: NotificationPath) -> Self {
        Self {
            path,
            received: false,
            notifications: Vec::new(),
        }
    }

    pub fn latest(&self) -> Option<&Notification> {
        self.notifications.last()
    }
}

/// Decides whether a completed request succeeded.
pub trait ResolutionStrategy: Send + Sync {
    fn can_resolve(&self, targets: &[Target]) -> bool;
}

impl<F> ResolutionStrategy for F
where
    F: Fn(&[Target]) -> bool + Send + Sync,
{
    fn can_resolve(&self, targets: &[Target]) -> bool {
        self(targets)
    }
}

/// Succeeds when the latest notification of every target signals success.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllTargetsOk;

impl ResolutionStrategy for AllTargetsOk {
    fn can_resolve(&self, targets: &[Target]) -> bool {
        targets
            .iter()
            .all(|t| t.latest().is_some_and(Notification::is_success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_path_key_normalization() {
        let pipeline = NotificationPath::pipeline("0xai_a", "cam-1");
        assert_eq!(pipeline.key(), PathKey::from_parts(["0xai_a", "cam-1"]));
        assert_eq!(pipeline.key(), PathKey::from_parts([" 0xai_a ", "cam-1", "", ""]));
        assert_eq!(pipeline.key().as_str(), "0xai_a/cam-1");

        let instance = NotificationPath::instance("0xai_a", "cam-1", "DETECT", "d-1");
        assert_eq!(instance.key().as_str(), "0xai_a/cam-1/DETECT/d-1");
        assert_ne!(instance.key(), pipeline.key());

        let sparse = NotificationPath {
            node: "n".into(),
            pipeline: None,
            signature: Some("S".into()),
            instance: None,
        };
        assert_eq!(sparse.key().as_str(), "n/*/S");
    }

    #[test]
    fn test_notification_from_message() {
        let message = json!({
            "EE_SENDER": "0xai_a",
            "EE_ID": "edge-a",
            "EE_PAYLOAD_PATH": ["edge-a", "cam-1", "DETECT", "d-1"],
            "NOTIFICATION_TYPE": "EXCEPTION",
            "NOTIFICATION_CODE": -2,
            "NOTIFICATION": "plugin crashed"
        });
        let n = Notification::from_message(&message).unwrap();
        assert_eq!(n.path, NotificationPath::instance("0xai_a", "cam-1", "DETECT", "d-1"));
        assert_eq!(n.kind, NotificationKind::Exception);
        assert_eq!(n.code, Some(-2));
        assert!(!n.is_success());

        let pipeline_level = json!({
            "EE_SENDER": "0xai_a",
            "EE_PAYLOAD_PATH": ["edge-a", "cam-1", null, null],
            "NOTIFICATION_TYPE": "NORMAL"
        });
        let n = Notification::from_message(&pipeline_level).unwrap();
        assert_eq!(n.path.key(), PathKey::from_parts(["0xai_a", "cam-1"]));
        assert!(n.is_success());

        assert!(Notification::from_message(&json!({"EE_PAYLOAD_PATH": []})).is_none());
    }

    #[test]
    fn test_all_targets_ok() {
        let ok = Notification::from_message(&json!({"EE_SENDER": "n", "NOTIFICATION_CODE": 1})).unwrap();
        let failed = Notification::from_message(&json!({"EE_SENDER": "n", "NOTIFICATION_CODE": -1})).unwrap();
        let mut target = Target::new(ok.path.clone());
        assert!(!AllTargetsOk.can_resolve(std::slice::from_ref(&target)));

        target.notifications.push(failed);
        assert!(!AllTargetsOk.can_resolve(std::slice::from_ref(&target)));
        target.notifications.push(ok);
        assert!(AllTargetsOk.can_resolve(&[target]));
    }
}
