use super::tracker::Outcome;
use super::{NotificationPath, PathKey, RequestTracker, Resolution, ResolutionStrategy};
use crate::error::RequestError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Path index. Entries are weak: the tracker belongs to whoever awaits its outcome.
pub(crate) type Index = Mutex<HashMap<PathKey, Weak<RequestTracker>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestTimeouts {
    /// No notification at all within this bound rejects the request.
    #[serde(with = "duration_ms", rename = "first_response_ms")]
    pub first_response: Duration,
    /// Not every target answered within this bound rejects with the partial answers.
    #[serde(with = "duration_ms", rename = "completion_ms")]
    pub completion: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            first_response: Duration::from_secs(10),
            completion: Duration::from_secs(60),
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Owner side of a tracked request: the tracker plus the channel its outcome arrives on.
#[derive(Debug)]
pub struct RequestHandle {
    tracker: Arc<RequestTracker>,
    outcome: oneshot::Receiver<Outcome>,
}

impl RequestHandle {
    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn id(&self) -> &str {
        self.tracker.id()
    }

    /// Waits for the request to settle.
    pub async fn wait(self) -> Result<Resolution, RequestError> {
        let id = self.tracker.id().to_string();
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) if self.tracker.is_closed() => Err(RequestError::Closed(id)),
            Err(_) => Err(RequestError::Dropped(id)),
        }
    }
}

/// Indexes live trackers by watched path so inbound notifications find their request in O(1).
#[derive(Clone, Default)]
pub struct RequestRegistry {
    index: Arc<Index>,
    timeouts: RequestTimeouts,
}

impl RequestRegistry {
    pub fn new(timeouts: RequestTimeouts) -> Self {
        Self {
            index: Arc::new(Mutex::new(HashMap::new())),
            timeouts,
        }
    }

    /// Creates an OPEN tracker with both timeouts armed. It is not indexed under any path yet.
    pub fn create_request(
        &self,
        action: impl Into<String>,
        strategy: Arc<dyn ResolutionStrategy>,
    ) -> RequestHandle {
        let (tx, rx) = oneshot::channel();
        let tracker = RequestTracker::new(
            Uuid::new_v4().to_string(),
            action.into(),
            strategy,
            Arc::downgrade(&self.index),
            tx,
        );
        tracker.arm(self.timeouts.first_response, self.timeouts.completion);
        debug!(request_id = %tracker.id(), action = %tracker.action(), "request created");
        RequestHandle {
            tracker,
            outcome: rx,
        }
    }

    /// Indexes `tracker` under `path`, which it must already watch.
    ///
    /// A path held by another open tracker is refused; entries of closed or dropped trackers
    /// are replaced.
    pub fn index(&self, path: &PathKey, tracker: &Arc<RequestTracker>) -> Result<(), RequestError> {
        if tracker.is_closed() {
            return Err(RequestError::Closed(tracker.id().to_string()));
        }
        if !tracker.watches(path) {
            return Err(RequestError::PathNotWatched {
                request_id: tracker.id().to_string(),
                path: path.clone(),
            });
        }
        // outlives the guard: dropping the last reference takes the index lock
        let current;
        let mut index = self.index.lock();
        current = index.get(path).and_then(Weak::upgrade);
        if let Some(current) = &current {
            if Arc::ptr_eq(current, tracker) {
                return Ok(());
            }
            if !current.is_closed() {
                warn!(%path, holder = %current.id(), "path already watched");
                return Err(RequestError::PathAlreadyWatched(path.clone()));
            }
        }
        index.insert(path.clone(), Arc::downgrade(tracker));
        Ok(())
    }

    /// Watches then indexes every path, in that order, so no fast answer can slip through.
    pub fn watch_all(
        &self,
        tracker: &Arc<RequestTracker>,
        paths: impl IntoIterator<Item = NotificationPath>,
    ) -> Result<Vec<PathKey>, RequestError> {
        let mut keys = Vec::new();
        for path in paths {
            let key = tracker.watch(path)?;
            self.index(&key, tracker)?;
            keys.push(key);
        }
        Ok(keys)
    }

    pub fn find(&self, path: &PathKey) -> Option<Arc<RequestTracker>> {
        self.index.lock().get(path).and_then(Weak::upgrade)
    }

    pub fn destroy(&self, path: &PathKey) -> bool {
        self.index.lock().remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeouts(&self) -> RequestTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{AllTargetsOk, Notification, NotificationKind, Processed};
    use serde_json::json;

    fn notification(path: &NotificationPath) -> Notification {
        Notification {
            path: path.clone(),
            kind: NotificationKind::Normal,
            code: None,
            message: None,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_find_routes_and_close_unindexes() {
        let registry = RequestRegistry::default();
        let handle = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        let pipeline = NotificationPath::pipeline("0xai_a", "cam");
        let instance = NotificationPath::instance("0xai_a", "cam", "DETECT", "d-1");
        let keys = registry
            .watch_all(handle.tracker(), [pipeline.clone(), instance.clone()])
            .unwrap();
        assert_eq!(registry.len(), 2);

        let found = registry.find(&keys[0]).unwrap();
        assert_eq!(found.process(notification(&pipeline)), Processed::Recorded);
        let found = registry.find(&instance.key()).unwrap();
        assert_eq!(found.process(notification(&instance)), Processed::Resolved);

        assert!(registry.is_empty());
        assert!(registry.find(&keys[0]).is_none());
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_index_requires_watch() {
        let registry = RequestRegistry::default();
        let handle = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        let key = NotificationPath::pipeline("0xai_a", "cam").key();
        assert!(matches!(
            registry.index(&key, handle.tracker()),
            Err(RequestError::PathNotWatched { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_open_tracker_on_same_path_is_refused() {
        let registry = RequestRegistry::default();
        let path = NotificationPath::pipeline("0xai_a", "cam");
        let first = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        registry.watch_all(first.tracker(), [path.clone()]).unwrap();
        // re-indexing by the same tracker is fine
        registry.index(&path.key(), first.tracker()).unwrap();

        let second = registry.create_request("ARCHIVE_CONFIG", Arc::new(AllTargetsOk));
        assert!(matches!(
            registry.watch_all(second.tracker(), [path.clone()]),
            Err(RequestError::PathAlreadyWatched(_))
        ));

        first.tracker().close();
        registry.watch_all(second.tracker(), [path.clone()]).unwrap();
        assert_eq!(registry.find(&path.key()).unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_dropped_tracker_does_not_block_path() {
        let registry = RequestRegistry::default();
        let path = NotificationPath::pipeline("0xai_a", "cam");
        {
            let abandoned = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
            registry.watch_all(abandoned.tracker(), [path.clone()]).unwrap();
        }
        tokio::task::yield_now().await;
        assert!(registry.find(&path.key()).is_none());
        assert!(registry.is_empty());

        let next = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        registry.watch_all(next.tracker(), [path.clone()]).unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_requests_do_not_accumulate() {
        let registry = RequestRegistry::default();
        for i in 0..100 {
            let handle = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
            let paths = [
                NotificationPath::pipeline(format!("0xai_{i}"), "cam"),
                NotificationPath::instance(format!("0xai_{i}"), "cam", "DETECT", "d-1"),
            ];
            registry.watch_all(handle.tracker(), paths).unwrap();
            assert_eq!(registry.len(), 2);
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_destroy() {
        let registry = RequestRegistry::default();
        let handle = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        let keys = registry
            .watch_all(handle.tracker(), [NotificationPath::pipeline("0xai_a", "cam")])
            .unwrap();
        assert!(registry.destroy(&keys[0]));
        assert!(!registry.destroy(&keys[0]));
        assert!(registry.find(&keys[0]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_from_registry() {
        let registry = RequestRegistry::new(RequestTimeouts {
            first_response: Duration::from_millis(100),
            completion: Duration::from_secs(1),
        });
        let handle = registry.create_request("UPDATE_CONFIG", Arc::new(AllTargetsOk));
        registry
            .watch_all(handle.tracker(), [NotificationPath::pipeline("0xai_a", "cam")])
            .unwrap();
        assert!(matches!(handle.wait().await, Err(RequestError::NoResponse { .. })));
        assert!(registry.is_empty());
    }
}
