use super::registry::Index;
use super::{Notification, NotificationPath, PathKey, ResolutionStrategy, Target};
use crate::error::RequestError;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type Outcome = Result<Resolution, RequestError>;

/// Successful settlement: every target answered and the strategy accepted the answers.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub request_id: String,
    pub targets: Vec<Target>,
}

/// What [`RequestTracker::process`] did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Tracker closed or path not watched; nothing changed.
    Ignored,
    Recorded,
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
enum Timer {
    FirstResponse,
    Completion,
}

struct State {
    closed: bool,
    responded: bool,
    targets: BTreeMap<PathKey, Target>,
    first_response: Option<JoinHandle<()>>,
    completion: Option<JoinHandle<()>>,
    settle: Option<oneshot::Sender<Outcome>>,
}

/// Lifecycle of one outbound command: `OPEN` until it resolves, rejects, times out or is
/// closed, then `CLOSED` for good.
///
/// All transitions go through one check-and-set on `closed` under the state lock, so a timeout
/// racing the final notification settles the request exactly once.
pub struct RequestTracker {
    id: String,
    action: String,
    strategy: Arc<dyn ResolutionStrategy>,
    state: Mutex<State>,
    index: Weak<Index>,
}

impl RequestTracker {
    pub(crate) fn new(
        id: String,
        action: String,
        strategy: Arc<dyn ResolutionStrategy>,
        index: Weak<Index>,
        settle: oneshot::Sender<Outcome>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            action,
            strategy,
            state: Mutex::new(State {
                closed: false,
                responded: false,
                targets: BTreeMap::new(),
                first_response: None,
                completion: None,
                settle: Some(settle),
            }),
            index,
        })
    }

    /// Arms both timeouts. Must run inside a tokio runtime.
    pub(crate) fn arm(self: &Arc<Self>, first_response: Duration, completion: Duration) {
        let first = self.spawn_timer(Timer::FirstResponse, first_response);
        let complete = self.spawn_timer(Timer::Completion, completion);
        let mut state = self.state.lock();
        state.first_response = Some(first);
        state.completion = Some(complete);
    }

    fn spawn_timer(self: &Arc<Self>, timer: Timer, after: Duration) -> JoinHandle<()> {
        let tracker = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_timeout(timer);
            }
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Registers a target for `path`. Watching an already watched path is a no-op.
    pub fn watch(&self, path: NotificationPath) -> Result<PathKey, RequestError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(RequestError::Closed(self.id.clone()));
        }
        let key = path.key();
        state
            .targets
            .entry(key.clone())
            .or_insert_with(|| Target::new(path));
        Ok(key)
    }

    pub fn watches(&self, key: &PathKey) -> bool {
        self.state.lock().targets.contains_key(key)
    }

    pub fn watched_paths(&self) -> Vec<PathKey> {
        self.state.lock().targets.keys().cloned().collect()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.state.lock().targets.values().cloned().collect()
    }

    /// True once every watched target has received at least one notification.
    pub fn is_complete(&self) -> bool {
        complete(&self.state.lock())
    }

    pub fn can_resolve(&self) -> bool {
        let targets = self.targets();
        self.strategy.can_resolve(&targets)
    }

    pub fn process(&self, notification: Notification) -> Processed {
        let key = notification.path.key();
        let targets = {
            let mut state = self.state.lock();
            if state.closed {
                debug!(request_id = %self.id, path = %key, "notification after close ignored");
                return Processed::Ignored;
            }
            let Some(target) = state.targets.get_mut(&key) else {
                warn!(request_id = %self.id, path = %key, "notification for unwatched path");
                return Processed::Ignored;
            };
            target.received = true;
            target.notifications.push(notification);

            if !state.responded {
                state.responded = true;
                if let Some(timer) = state.first_response.take() {
                    timer.abort();
                }
            }

            if !complete(&state) {
                return Processed::Recorded;
            }
            state.targets.values().cloned().collect::<Vec<Target>>()
        };

        // the strategy runs unlocked and may call back into this tracker
        let accepted = self.strategy.can_resolve(&targets);

        let (processed, settled) = {
            let mut state = self.state.lock();
            if state.closed {
                debug!(request_id = %self.id, path = %key, "settled while the strategy ran");
                return Processed::Ignored;
            }
            if accepted {
                let resolution = Resolution {
                    request_id: self.id.clone(),
                    targets,
                };
                (Processed::Resolved, self.settle(&mut state, Ok(resolution)))
            } else {
                let error = RequestError::Rejected {
                    request_id: self.id.clone(),
                    targets,
                };
                (Processed::Rejected, self.settle(&mut state, Err(error)))
            }
        };
        self.unindex(&settled);
        processed
    }

    /// Closes without settling; a pending waiter observes [`RequestError::Closed`]. Idempotent.
    pub fn close(&self) {
        let released = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.settle.take();
            self.shut(&mut state)
        };
        debug!(request_id = %self.id, "request closed");
        self.unindex(&released);
    }

    fn on_timeout(&self, timer: Timer) {
        let released = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            let error = match timer {
                Timer::FirstResponse if !state.responded => {
                    warn!(request_id = %self.id, action = %self.action, "no response, node presumed unreachable");
                    RequestError::NoResponse {
                        request_id: self.id.clone(),
                    }
                }
                Timer::FirstResponse => return,
                Timer::Completion => {
                    warn!(request_id = %self.id, action = %self.action, "request incomplete at deadline");
                    RequestError::Incomplete {
                        request_id: self.id.clone(),
                        targets: state.targets.values().cloned().collect(),
                    }
                }
            };
            self.settle(&mut state, Err(error))
        };
        self.unindex(&released);
    }

    /// The single CLOSED transition that delivers an outcome.
    fn settle(&self, state: &mut State, outcome: Outcome) -> Vec<PathKey> {
        match &outcome {
            Ok(_) => info!(request_id = %self.id, action = %self.action, "request resolved"),
            Err(e) => info!(request_id = %self.id, action = %self.action, error = %e, "request rejected"),
        }
        if let Some(sender) = state.settle.take() {
            if sender.send(outcome).is_err() {
                debug!(request_id = %self.id, "request settled with nobody waiting");
            }
        }
        self.shut(state)
    }

    fn shut(&self, state: &mut State) -> Vec<PathKey> {
        state.closed = true;
        for timer in [state.first_response.take(), state.completion.take()].into_iter().flatten() {
            timer.abort();
        }
        state.targets.keys().cloned().collect()
    }

    /// Drops index entries that still point at this tracker.
    fn unindex(&self, paths: &[PathKey]) {
        let Some(index) = self.index.upgrade() else {
            return;
        };
        let mut index = index.lock();
        for path in paths {
            let owned = index
                .get(path)
                .is_some_and(|w| std::ptr::eq(w.as_ptr(), self as *const Self));
            if owned {
                index.remove(path);
            }
        }
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for timer in [state.first_response.take(), state.completion.take()].into_iter().flatten() {
            timer.abort();
        }
        let paths: Vec<PathKey> = state.targets.keys().cloned().collect();
        self.unindex(&paths);
    }
}

fn complete(state: &State) -> bool {
    state.targets.values().all(|t| t.received)
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RequestTracker")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("closed", &state.closed)
            .field("targets", &state.targets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{AllTargetsOk, NotificationKind};
    use serde_json::json;

    fn tracker() -> (Arc<RequestTracker>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let tracker = RequestTracker::new(
            "req-1".into(),
            "UPDATE_CONFIG".into(),
            Arc::new(AllTargetsOk),
            Weak::new(),
            tx,
        );
        (tracker, rx)
    }

    fn ok(path: &NotificationPath) -> Notification {
        Notification {
            path: path.clone(),
            kind: NotificationKind::Normal,
            code: Some(1),
            message: None,
            payload: json!({}),
        }
    }

    fn failed(path: &NotificationPath) -> Notification {
        Notification {
            code: Some(-1),
            ..ok(path)
        }
    }

    fn paths(n: usize) -> Vec<NotificationPath> {
        (0..n)
            .map(|i| NotificationPath::instance("0xai_a", "cam", "DETECT", format!("d-{i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_resolves_in_order() {
        let (tracker, rx) = tracker();
        let paths = paths(3);
        for p in &paths {
            tracker.watch(p.clone()).unwrap();
        }
        assert_eq!(tracker.process(ok(&paths[0])), Processed::Recorded);
        assert_eq!(tracker.process(ok(&paths[1])), Processed::Recorded);
        assert!(!tracker.is_complete());
        assert_eq!(tracker.process(ok(&paths[2])), Processed::Resolved);
        assert!(tracker.is_closed());

        let resolution = rx.await.unwrap().unwrap();
        assert_eq!(resolution.targets.len(), 3);
    }

    #[tokio::test]
    async fn test_resolves_in_reverse_order_with_duplicates() {
        let (tracker, rx) = tracker();
        let paths = paths(3);
        for p in &paths {
            tracker.watch(p.clone()).unwrap();
        }
        assert_eq!(tracker.process(ok(&paths[2])), Processed::Recorded);
        // duplicate before completion is appended, completion unchanged
        assert_eq!(tracker.process(ok(&paths[2])), Processed::Recorded);
        assert_eq!(tracker.process(ok(&paths[1])), Processed::Recorded);
        assert_eq!(tracker.process(ok(&paths[0])), Processed::Resolved);
        // duplicates after completion change nothing
        assert_eq!(tracker.process(ok(&paths[0])), Processed::Ignored);

        let resolution = rx.await.unwrap().unwrap();
        let last = resolution.targets.iter().find(|t| t.path == paths[2]).unwrap();
        assert_eq!(last.notifications.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_when_strategy_refuses() {
        let (tracker, rx) = tracker();
        let paths = paths(2);
        for p in &paths {
            tracker.watch(p.clone()).unwrap();
        }
        tracker.process(ok(&paths[0]));
        assert_eq!(tracker.process(failed(&paths[1])), Processed::Rejected);
        assert!(matches!(rx.await.unwrap(), Err(RequestError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_unwatched_path_is_ignored() {
        let (tracker, _rx) = tracker();
        tracker.watch(NotificationPath::pipeline("0xai_a", "cam")).unwrap();
        let stray = NotificationPath::pipeline("0xai_b", "cam");
        assert_eq!(tracker.process(ok(&stray)), Processed::Ignored);
        assert!(!tracker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_response_timeout() {
        let (tracker, rx) = tracker();
        tracker.watch(NotificationPath::pipeline("0xai_a", "cam")).unwrap();
        tracker.arm(Duration::from_secs(5), Duration::from_secs(30));

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(RequestError::NoResponse { .. })));
        assert!(tracker.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_timeout_keeps_partial_answers() {
        let (tracker, rx) = tracker();
        let paths = paths(2);
        for p in &paths {
            tracker.watch(p.clone()).unwrap();
        }
        tracker.arm(Duration::from_secs(5), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tracker.process(ok(&paths[0]));

        match rx.await.unwrap() {
            Err(RequestError::Incomplete { targets, .. }) => {
                assert_eq!(targets.iter().filter(|t| t.received).count(), 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_racing_final_notification_settles_once() {
        let (tracker, rx) = tracker();
        let path = NotificationPath::pipeline("0xai_a", "cam");
        tracker.watch(path.clone()).unwrap();
        tracker.arm(Duration::from_secs(5), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let processed = tracker.process(ok(&path));
        tokio::task::yield_now().await;

        let outcome = rx.await.unwrap();
        match processed {
            Processed::Resolved => assert!(outcome.is_ok()),
            Processed::Ignored => assert!(outcome.is_err()),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(tracker.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drops_waiter() {
        let (tracker, rx) = tracker();
        tracker.watch(NotificationPath::pipeline("0xai_a", "cam")).unwrap();
        tracker.close();
        tracker.close();
        assert!(rx.await.is_err());
        assert!(matches!(
            tracker.watch(NotificationPath::pipeline("0xai_a", "other")),
            Err(RequestError::Closed(_))
        ));
    }

    /// Strategy that inspects the tracker it is deciding for.
    struct Reentrant(std::sync::OnceLock<Weak<RequestTracker>>);

    impl ResolutionStrategy for Reentrant {
        fn can_resolve(&self, targets: &[Target]) -> bool {
            let tracker = self.0.get().and_then(Weak::upgrade);
            tracker.is_some_and(|t| {
                t.is_complete() && !t.is_closed() && t.targets().len() == targets.len()
            })
        }
    }

    #[tokio::test]
    async fn test_strategy_may_call_back_into_tracker() {
        let (tx, rx) = oneshot::channel();
        let strategy = Arc::new(Reentrant(std::sync::OnceLock::new()));
        let tracker = RequestTracker::new(
            "req-1".into(),
            "UPDATE_CONFIG".into(),
            strategy.clone(),
            Weak::new(),
            tx,
        );
        strategy.0.get_or_init(|| Arc::downgrade(&tracker));

        let path = NotificationPath::pipeline("0xai_a", "cam");
        tracker.watch(path.clone()).unwrap();
        assert_eq!(tracker.process(ok(&path)), Processed::Resolved);
        assert!(tracker.is_closed());
        assert!(rx.await.unwrap().is_ok());
    }
}
