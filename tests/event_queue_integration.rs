use parking_lot::Mutex;
use serde_json::{json, Value};
use slv_net::networking::capabilities::{
    EventHandlerRegistry, EventQueueClient, EventQueueConfig, EventQueueServer,
    EventQueueServerConfig, EventQueueState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const PATH: &str = "/cap/event_queue";

async fn spawn_server(poll_timeout: Duration) -> (EventQueueServer, String) {
    let server = EventQueueServer::new(EventQueueServerConfig {
        poll_timeout,
        max_batch: 100,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}{}", listener.local_addr().unwrap(), PATH);

    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener, PATH).await;
    });
    (server, url)
}

fn client_config() -> EventQueueConfig {
    EventQueueConfig {
        request_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(50),
    }
}

struct Recorded {
    registry: Arc<EventHandlerRegistry>,
    events: Arc<Mutex<Vec<(String, Value)>>>,
    connected: Arc<AtomicUsize>,
}

fn recording_registry() -> Recorded {
    let registry = Arc::new(EventHandlerRegistry::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let connected = Arc::new(AtomicUsize::new(0));

    let sink = Arc::clone(&events);
    registry.register_fallback(move |message, body| {
        sink.lock().push((message.to_string(), body.clone()));
    });
    let counter = Arc::clone(&connected);
    registry.register_connected(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    Recorded { registry, events, connected }
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (server, url) = spawn_server(Duration::from_millis(200)).await;
    let recorded = recording_registry();
    let client =
        EventQueueClient::with_reqwest(&url, recorded.registry.clone(), client_config()).unwrap();

    client.start().unwrap();
    wait_until(|| recorded.connected.load(Ordering::SeqCst) == 1).await;
    assert_eq!(client.state(), EventQueueState::Open);

    server.enqueue("EnableSimulator", json!({"port": 13005})).unwrap();
    server.enqueue("TeleportFinish", json!({"region_handle": 7})).unwrap();
    wait_until(|| recorded.events.lock().len() == 2).await;

    server.enqueue("CrossedRegion", json!({})).unwrap();
    wait_until(|| recorded.events.lock().len() == 3).await;

    let names: Vec<String> = recorded.events.lock().iter().map(|(m, _)| m.clone()).collect();
    assert_eq!(names, vec!["EnableSimulator", "TeleportFinish", "CrossedRegion"]);
    assert_eq!(recorded.events.lock()[0].1, json!({"port": 13005}));
    // Batch boundaries depend on when the parked poll wakes
    wait_until(|| matches!(client.last_ack(), Some(id) if id >= 2)).await;
    assert_eq!(recorded.connected.load(Ordering::SeqCst), 1);

    client.stop(true);
    client.wait_closed().await;
}

#[tokio::test]
async fn test_idle_polls_keep_channel_open() {
    let (server, url) = spawn_server(Duration::from_millis(50)).await;
    let recorded = recording_registry();
    let client =
        EventQueueClient::with_reqwest(&url, recorded.registry.clone(), client_config()).unwrap();

    client.start().unwrap();

    // Several 502 long-poll timeouts go by without closing the channel
    wait_until(|| client.requests_sent() >= 4).await;
    assert!(client.is_running());
    assert_eq!(client.last_ack(), None);

    server.enqueue("ParcelProperties", json!({"local_id": 1})).unwrap();
    wait_until(|| recorded.events.lock().len() == 1).await;
    wait_until(|| client.last_ack() == Some(1)).await;

    client.stop(true);
    client.wait_closed().await;
}

#[tokio::test]
async fn test_graceful_stop_releases_server_queue() {
    let (server, url) = spawn_server(Duration::from_millis(100)).await;
    let recorded = recording_registry();
    let client =
        EventQueueClient::with_reqwest(&url, recorded.registry.clone(), client_config()).unwrap();

    client.start().unwrap();
    server.enqueue("AgentGroupDataUpdate", json!({})).unwrap();
    wait_until(|| recorded.events.lock().len() == 1).await;

    client.stop(false);
    tokio::time::timeout(Duration::from_secs(5), client.wait_closed()).await.unwrap();

    assert_eq!(client.state(), EventQueueState::Closed);
    assert!(server.is_closed());
    assert_eq!(recorded.events.lock().len(), 1);
}

#[tokio::test]
async fn test_server_close_revokes_client() {
    let (server, url) = spawn_server(Duration::from_secs(5)).await;
    let recorded = recording_registry();
    let client =
        EventQueueClient::with_reqwest(&url, recorded.registry.clone(), client_config()).unwrap();

    client.start().unwrap();
    wait_until(|| recorded.connected.load(Ordering::SeqCst) == 1).await;

    server.close();
    tokio::time::timeout(Duration::from_secs(5), client.wait_closed()).await.unwrap();
    assert_eq!(client.state(), EventQueueState::Closed);
}

#[tokio::test]
async fn test_malformed_request_gets_bad_request() {
    let (_server, url) = spawn_server(Duration::from_millis(50)).await;

    let response = reqwest::Client::new()
        .post(&url)
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let response = reqwest::Client::new()
        .post(&url)
        .json(&json!({"ack": null, "done": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);
}
