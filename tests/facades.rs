use std::time::Duration;

use facade_bridge::facades;
use facade_bridge::rpc::{BindMode, ClientError, Event, RpcClient, RpcServer, ServerSettings};
use serde_json::{Value, json};
use tokio::time::timeout;

async fn connect() -> (RpcServer, RpcClient) {
    let server = RpcServer::new(ServerSettings::default(), facades::all()).expect("registry");
    let addr = server.start(BindMode::Loopback).await.expect("start");
    let client = RpcClient::connect(addr, server.secret())
        .await
        .expect("connect");
    (server, client)
}

#[tokio::test]
async fn test_client_calls_and_errors() {
    let (server, mut client) = connect().await;

    let pong: String = client.call_as("ping", vec![]).await.unwrap();
    assert_eq!(pong, "pong");
    assert_eq!(client.call("add", vec![json!(2), json!(3)]).await.unwrap(), json!(5));
    assert_eq!(
        client.call("echo", vec![json!({"nested": [1, null]})]).await.unwrap(),
        json!({"nested": [1, null]})
    );

    match client.call("doesNotExist", vec![]).await {
        Err(ClientError::Rpc(message)) => assert_eq!(message, "Unknown RPC: doesNotExist"),
        other => panic!("expected RPC error, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_secret_is_reported_as_closed() {
    let server = RpcServer::new(ServerSettings::default(), facades::all()).unwrap();
    let addr = server.start(BindMode::Loopback).await.unwrap();

    let mut client = RpcClient::connect(addr, "wrong").await.unwrap();
    let err = client.call("ping", vec![]).await.unwrap_err();
    assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));

    server.stop().await;
}

#[tokio::test]
async fn test_event_post_poll_and_clear() {
    let (server, mut client) = connect().await;

    client
        .call("eventPost", vec![json!("first"), json!({"n": 1})])
        .await
        .unwrap();
    client.call("eventPost", vec![json!("second")]).await.unwrap();
    client
        .call("eventPost", vec![json!("transient"), Value::Null, json!(false)])
        .await
        .unwrap();

    let polled: Vec<Event> = client.call_as("eventPoll", vec![]).await.unwrap();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].name, "first");
    assert_eq!(polled[0].data, json!({"n": 1}));

    client.call("eventClearBuffer", vec![]).await.unwrap();
    let polled: Vec<Event> = client.call_as("eventPoll", vec![json!(10)]).await.unwrap();
    assert!(polled.is_empty());

    let waited = client.call("eventWait", vec![json!(20)]).await.unwrap();
    assert_eq!(waited, Value::Null);

    server.stop().await;
}

#[tokio::test]
async fn test_events_posted_by_host_reach_waiting_client() {
    let (server, mut client) = connect().await;
    let queue = server.events().clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.post("sensor", json!({"x": 0.5}));
    });

    let event: Option<Event> = client
        .call_as("eventWaitFor", vec![json!("sensor"), json!(2000)])
        .await
        .unwrap();
    let event = event.expect("event before timeout");
    assert_eq!(event.data, json!({"x": 0.5}));

    // eventWaitFor leaves it queued; eventWait removes it.
    let event: Option<Event> = client.call_as("eventWait", vec![json!(100)]).await.unwrap();
    assert_eq!(event.unwrap().name, "sensor");
    assert!(server.events().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_event_wait_sees_event_posted_without_enqueue() {
    let (server, mut waiter) = connect().await;
    let addr = server.local_addr().expect("address");
    let mut poster = RpcClient::connect(addr, server.secret()).await.unwrap();

    let wait = tokio::spawn(async move {
        waiter
            .call_as::<Option<Event>>("eventWait", vec![json!(2000)])
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    poster
        .call("eventPost", vec![json!("flash"), Value::Null, json!(false)])
        .await
        .unwrap();

    let event = wait.await.unwrap().unwrap().expect("event before timeout");
    assert_eq!(event.name, "flash");
    assert!(server.events().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_deprecated_aliases_still_work() {
    let (server, mut client) = connect().await;

    client
        .call("postEvent", vec![json!("legacy"), json!(1)])
        .await
        .unwrap();
    let event: Option<Event> = client.call_as("receiveEvent", vec![]).await.unwrap();
    assert_eq!(event.unwrap().name, "legacy");

    client.call("postEvent", vec![json!("again")]).await.unwrap();
    let event: Option<Event> = client
        .call_as("waitForEvent", vec![json!("again"), json!(500)])
        .await
        .unwrap();
    assert_eq!(event.unwrap().name, "again");

    server.stop().await;
}

#[tokio::test]
async fn test_timer_events_and_shutdown() {
    let (server, mut client) = connect().await;

    let started: bool = client
        .call_as("timerStart", vec![json!("beat"), json!(20)])
        .await
        .unwrap();
    assert!(started);
    let again: bool = client
        .call_as("timerStart", vec![json!("beat")])
        .await
        .unwrap();
    assert!(!again);

    let names: Vec<String> = client.call_as("timerList", vec![]).await.unwrap();
    assert_eq!(names, vec!["beat".to_string()]);

    let event: Option<Event> = client
        .call_as("eventWaitFor", vec![json!("beat"), json!(2000)])
        .await
        .unwrap();
    assert!(event.is_some());

    let err = client
        .call("timerStart", vec![json!("bad"), json!(0)])
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Rpc(_)));

    let report = server.stop().await;
    assert!(report.shut_down.contains(&facades::timer::NAME.to_string()));
    assert!(report.is_clean());

    // No more ticks after shutdown.
    let events = server.events().clone();
    tokio::time::sleep(Duration::from_millis(30)).await;
    events.clear();
    let late = timeout(Duration::from_millis(100), events.wait_any(None)).await;
    assert!(late.is_err());
}
