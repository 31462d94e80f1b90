//! End-to-end tests: a real server on ephemeral ports, WebSocket clients via
//! `tokio-tungstenite` and backends over plain TCP.

use std::net::SocketAddr;
use std::time::Duration;

use consistency_core::ResourceId;
use consistency_server::{ServerBuilder, ServerHandle};
use consistency_settings::ConsistencySettings;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUIET: Duration = Duration::from_millis(200);

fn settings() -> ConsistencySettings {
    let mut settings = ConsistencySettings::default();
    settings.client.host = "127.0.0.1".into();
    settings.client.port = 0;
    settings.backend.host = "127.0.0.1".into();
    settings.backend.port = 0;
    settings
}

async fn boot() -> ServerHandle {
    ServerBuilder::new(settings()).start().await.unwrap()
}

async fn connect(server: &ServerHandle, path: &str) -> Client {
    let url = format!("ws://{}{path}", server.client_addr());
    let (ws, _response) = connect_async(url).await.unwrap();
    ws
}

fn envelope(kind: &str, uri: &str) -> String {
    serde_json::json!({"message": kind, "data": {"uri": uri}}).to_string()
}

async fn watch(client: &mut Client, server: &ServerHandle, uri: &str) {
    let before = server.registry().subscriber_count(&ResourceId::new(uri));
    client
        .send(Message::text(envelope("watch", uri)))
        .await
        .unwrap();
    wait_until(|| server.registry().subscriber_count(&ResourceId::new(uri)) > before).await;
}

async fn send_backend(addr: SocketAddr, payload: &[u8]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
}

async fn update(server: &ServerHandle, uri: &str) {
    let line = format!("{}\n", envelope("update", uri));
    send_backend(server.backend_addr(), line.as_bytes()).await;
}

/// Next text frame, skipping control frames. `None` on timeout or close.
async fn next_text(client: &mut Client, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            Ok(Message::Binary(_)) => panic!("server sent a binary frame"),
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
}

async fn expect_invalidate(client: &mut Client, uri: &str) {
    let text = next_text(client, Duration::from_secs(5))
        .await
        .expect("expected an invalidate frame");
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["message"], "invalidate");
    assert_eq!(json["data"]["uri"], uri);
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn watch_then_update_delivers_exactly_one_invalidate() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;

    watch(&mut a, &server, "r1").await;
    update(&server, "r1").await;

    expect_invalidate(&mut a, "r1").await;
    assert_eq!(next_text(&mut a, QUIET).await, None);

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn every_watcher_of_a_resource_is_notified() {
    let server = boot().await;
    let mut a = connect(&server, "/ws").await;
    let mut b = connect(&server, "/").await;

    watch(&mut a, &server, "r1").await;
    watch(&mut b, &server, "r1").await;
    assert_eq!(server.registry().resource_count(), 1);
    assert_eq!(server.registry().subscriber_count(&ResourceId::new("r1")), 2);

    update(&server, "r1").await;
    expect_invalidate(&mut a, "r1").await;
    expect_invalidate(&mut b, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn updates_are_isolated_per_resource() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    let mut b = connect(&server, "/").await;

    watch(&mut a, &server, "r1").await;
    watch(&mut b, &server, "r2").await;
    update(&server, "r1").await;

    expect_invalidate(&mut a, "r1").await;
    assert_eq!(next_text(&mut b, QUIET).await, None);

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn duplicate_watch_still_yields_one_invalidate() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;

    watch(&mut a, &server, "r1").await;
    a.send(Message::text(envelope("watch", "r1"))).await.unwrap();
    a.send(Message::text(envelope("watch", "r2"))).await.unwrap();
    wait_until(|| server.registry().contains(&ResourceId::new("r2"))).await;
    assert_eq!(server.registry().subscriber_count(&ResourceId::new("r1")), 1);

    update(&server, "r1").await;
    expect_invalidate(&mut a, "r1").await;
    assert_eq!(next_text(&mut a, QUIET).await, None);

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn update_for_unknown_resource_is_a_noop() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;

    update(&server, "unknown").await;
    assert_eq!(next_text(&mut a, QUIET).await, None);
    assert!(!server.registry().contains(&ResourceId::new("unknown")));
    assert_eq!(server.registry().resource_count(), 1);

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn disconnect_removes_sole_watcher_resource() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;

    a.close(None).await.unwrap();
    drop(a);
    wait_until(|| !server.registry().contains(&ResourceId::new("r1"))).await;

    update(&server, "r1").await;
    tokio::time::sleep(QUIET).await;
    assert_eq!(server.registry().resource_count(), 0);

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn disconnect_keeps_resource_for_remaining_watchers() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    let mut b = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;
    watch(&mut b, &server, "r1").await;

    drop(a);
    wait_until(|| server.registry().subscriber_count(&ResourceId::new("r1")) == 1).await;

    update(&server, "r1").await;
    expect_invalidate(&mut b, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn malformed_backend_frame_keeps_connection_open() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;

    let mut backend = TcpStream::connect(server.backend_addr()).await.unwrap();
    let mut other = TcpStream::connect(server.backend_addr()).await.unwrap();

    backend.write_all(b"this is not json\n").await.unwrap();
    backend.write_all(b"{\"message\":\"update\"}\n").await.unwrap();
    let line = format!("{}\n", envelope("update", "r1"));
    backend.write_all(line.as_bytes()).await.unwrap();
    expect_invalidate(&mut a, "r1").await;

    other.write_all(line.as_bytes()).await.unwrap();
    expect_invalidate(&mut a, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn one_shot_backend_without_trailing_newline() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;

    send_backend(server.backend_addr(), envelope("update", "r1").as_bytes()).await;
    expect_invalidate(&mut a, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn several_updates_on_one_backend_connection() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;
    watch(&mut a, &server, "r2").await;

    let payload = format!(
        "{}\r\n{}\n",
        envelope("update", "r2"),
        envelope("update", "r1")
    );
    send_backend(server.backend_addr(), payload.as_bytes()).await;

    expect_invalidate(&mut a, "r2").await;
    expect_invalidate(&mut a, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn malformed_client_frame_closes_that_client_only() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    let mut b = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;
    watch(&mut b, &server, "r1").await;

    a.send(Message::text("definitely not json".to_string())).await.unwrap();
    assert_eq!(next_text(&mut a, Duration::from_secs(5)).await, None);
    wait_until(|| server.registry().subscriber_count(&ResourceId::new("r1")) == 1).await;

    update(&server, "r1").await;
    expect_invalidate(&mut b, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn unknown_client_message_is_ignored() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;

    a.send(Message::text(envelope("subscribe", "r1"))).await.unwrap();
    a.send(Message::binary(vec![1, 2, 3])).await.unwrap();
    watch(&mut a, &server, "r1").await;

    update(&server, "r1").await;
    expect_invalidate(&mut a, "r1").await;

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn health_endpoint_reports_live_counts() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;

    let url = format!("http://{}/health", server.client_addr());
    let json: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["connections"], 1);
    assert_eq!(json["resources"], 1);

    assert!(server.shutdown(None).await);
}

#[tokio::test]
async fn shutdown_closes_clients_and_empties_registry() {
    let server = boot().await;
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;
    let registry = std::sync::Arc::clone(server.registry());
    let backend_addr = server.backend_addr();

    assert!(server.shutdown(Some(Duration::from_secs(5))).await);

    assert_eq!(next_text(&mut a, Duration::from_secs(5)).await, None);
    assert_eq!(registry.resource_count(), 0);
    assert!(TcpStream::connect(backend_addr).await.is_err());
}

#[tokio::test]
async fn silent_client_times_out_and_is_released() {
    let mut settings = settings();
    settings.client.heartbeat_interval_secs = 1;
    settings.client.client_timeout_secs = 2;
    let server = ServerBuilder::new(settings).start().await.unwrap();

    // Never polled again, so the server's pings go unanswered.
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, "r1").await;

    wait_until(|| server.registry().resource_count() == 0).await;
    assert!(!server.registry().contains(&ResourceId::new("r1")));

    assert!(server.shutdown(None).await);
    drop(a);
}

#[tokio::test]
async fn client_that_stops_reading_is_evicted_and_released() {
    let mut settings = settings();
    settings.client.max_send_queue = 1;
    settings.client.max_consecutive_drops = 1;
    settings.client.max_message_bytes = 1024 * 1024;
    settings.backend.max_frame_bytes = 1024 * 1024;
    let server = ServerBuilder::new(settings).start().await.unwrap();

    // Large URIs so the socket buffers fill quickly once the client stops reading.
    let uri = "r".repeat(64 * 1024);
    let mut a = connect(&server, "/").await;
    watch(&mut a, &server, &uri).await;
    let mut b = connect(&server, "/").await;
    watch(&mut b, &server, "other").await;

    let backend_addr = server.backend_addr();
    let line = format!("{}\n", envelope("update", &uri));
    let backend = tokio::spawn(async move {
        let mut stream = TcpStream::connect(backend_addr).await.unwrap();
        for _ in 0..600 {
            if stream.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = stream.shutdown().await;
    });

    wait_until(|| !server.registry().contains(&ResourceId::new(uri.as_str()))).await;
    assert_eq!(server.registry().resource_count(), 1);

    // The reading client is unaffected.
    update(&server, "other").await;
    expect_invalidate(&mut b, "other").await;

    let _ = backend.await;
    assert!(server.shutdown(None).await);
    drop(a);
}
