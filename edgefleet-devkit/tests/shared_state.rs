use edgefleet_core::requests::RequestTimeouts;
use edgefleet_core::store::{LockPolicy, StoreEvent};
use edgefleet_core::{
    Dispatcher, Fleet, FleetClient, MemoryBackend, RequestRegistry, SharedStore, StateFacade, StoreMode,
    Subscriber,
};
use edgefleet_devkit::{init_tracing, EdgeMessageBuilder, MockTransport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Seen(Mutex<Vec<StoreEvent>>);

impl Subscriber for Seen {
    fn notify(&self, event: &StoreEvent) {
        self.0.lock().push(event.clone());
    }
}

async fn shared_facade(backend: &Arc<MemoryBackend>, fleet: Fleet) -> Arc<StateFacade> {
    let store = SharedStore::connect(backend.clone(), "fleet", LockPolicy::default())
        .await
        .unwrap();
    StateFacade::new(StoreMode::Shared(Arc::new(store)), fleet)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_processes_share_node_state() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let a = shared_facade(&backend, Fleet::All).await;
    let b = shared_facade(&backend, Fleet::All).await;

    let dispatcher = Dispatcher::new(a.clone(), RequestRegistry::new(RequestTimeouts::default()));
    let node = EdgeMessageBuilder::new("0xai_a", "edge-a");
    dispatcher
        .dispatch(&node.heartbeat(vec![serde_json::json!({
            "NAME": "gate",
            "TYPE": "VideoStream",
            "PLUGINS": [{"SIGNATURE": "DETECT", "INSTANCES": [{"INSTANCE_ID": "d-1", "THRESHOLD": 0.3}]}]
        })]))
        .await
        .unwrap();

    let fleet = b.get_fleet().await.unwrap();
    assert_eq!(fleet.len(), 1);
    assert_eq!(fleet[0].node.as_deref(), Some("edge-a"));
    assert!(fleet[0].status.online);
    let running = b
        .get_running_instance_config("0xai_a", "gate", "d-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running["THRESHOLD"], 0.3);
}

#[tokio::test]
async fn test_broadcasts_reach_other_processes() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let a = shared_facade(&backend, Fleet::Nodes(vec!["0xai_a".into()])).await;
    let b = shared_facade(&backend, Fleet::Nodes(vec!["0xai_a".into()])).await;
    let seen = Arc::new(Seen::default());
    b.store().subscribe(seen.clone());

    let transport = MockTransport::new();
    let client = FleetClient::new(
        "ops",
        a.clone(),
        RequestRegistry::new(RequestTimeouts::default()),
        Arc::new(transport.clone()),
    );
    client.start_session().await.unwrap();
    a.update_fleet(edgefleet_core::store::FleetChange::Add("0xai_b".into()))
        .await
        .unwrap();
    settle().await;

    assert_eq!(b.fleet(), Fleet::Nodes(vec!["0xai_a".into(), "0xai_b".into()]));
    let events = seen.0.lock().clone();
    assert!(events.contains(&StoreEvent::StickySession {
        session_id: client.session_id().to_string()
    }));

    // a failed publish still announces then withdraws its watched paths
    transport.fail_with("broker down");
    assert!(client.close_pipeline("0xai_a", "gate").await.is_err());
    settle().await;
    let events = seen.0.lock().clone();
    assert!(events.iter().any(|e| matches!(e, StoreEvent::RequestWatched { .. })));
    assert!(events.iter().any(|e| matches!(e, StoreEvent::RequestIgnored { .. })));
}
