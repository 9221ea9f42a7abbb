//! End-to-end tests against a real listener using WebSocket and HTTP clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use vendlink_core::SystemClock;
use vendlink_server::dispatch::{DirectCommand, DirectTransport, TransportError};
use vendlink_server::{InMemoryMachineStore, MachineRecord, Services, VendServer};
use vendlink_settings::{HeartbeatSettings, ServerSettings, VendlinkSettings};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<(String, DirectCommand)>>,
}

#[async_trait]
impl DirectTransport for RecordingTransport {
    async fn send(&self, address: &str, command: DirectCommand) -> Result<(), TransportError> {
        self.calls.lock().push((address.to_string(), command));
        Ok(())
    }
}

struct TestServer {
    addr: SocketAddr,
    server: VendServer,
    transport: Arc<RecordingTransport>,
}

impl TestServer {
    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

async fn boot(heartbeat: Option<HeartbeatSettings>) -> TestServer {
    let mut settings = VendlinkSettings::default();
    settings.server = ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerSettings::default()
    };
    let store = Arc::new(InMemoryMachineStore::with_machines([
        MachineRecord::new("M1", Some("10.0.0.5:8080")),
        MachineRecord::new("M2", Some("10.0.0.6:8080")),
    ]));
    let transport = Arc::new(RecordingTransport::default());
    let services = Services::build(&settings, store, transport.clone(), Arc::new(SystemClock));
    let server = VendServer::new(
        settings.server.clone(),
        services,
        vendlink_telemetry::metrics::detached_handle(),
    );
    if let Some(hb) = heartbeat {
        let _ = server
            .services()
            .heartbeat(&hb)
            .spawn(server.shutdown().token());
    }
    let (addr, _handle) = server.listen().await.unwrap();
    TestServer {
        addr,
        server,
        transport,
    }
}

async fn connect(server: &TestServer) -> WsStream {
    let (ws, _) = timeout(TIMEOUT, connect_async(server.ws_url()))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    ws
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next JSON text frame. `None` once the socket closed.
async fn recv(ws: &mut WsStream) -> Option<Value> {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.expect("recv timed out");
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn recv_type(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let frame = recv(ws).await.unwrap_or_else(|| panic!("closed before {kind}"));
        if frame["type"] == kind {
            return frame;
        }
    }
}

async fn register(server: &TestServer, machine_id: &str) -> WsStream {
    let mut ws = connect(server).await;
    send(&mut ws, json!({ "type": "register", "machineId": machine_id })).await;
    let ack = recv_type(&mut ws, "registered").await;
    assert_eq!(ack["machineId"], machine_id);
    ws
}

async fn get_json(url: &str) -> Value {
    reqwest::get(url).await.unwrap().json().await.unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn registered_device_shows_online() {
    let server = boot(None).await;
    let _device = register(&server, "M1").await;

    let status = get_json(&server.http_url("/api/machines/M1/status")).await;
    assert_eq!(status["status"], "online");
    assert_eq!(status["connected"], true);

    let all = get_json(&server.http_url("/api/machines/status")).await;
    assert_eq!(all.as_array().unwrap().len(), 1);

    let health = get_json(&server.http_url("/health")).await;
    assert_eq!(health["devices"], 1);
}

#[tokio::test]
async fn malformed_frames_do_not_drop_the_socket() {
    let server = boot(None).await;
    let mut ws = connect(&server).await;
    ws.send(Message::text("garbage")).await.unwrap();
    send(&mut ws, json!({ "type": "unknown" })).await;
    send(&mut ws, json!({ "type": "register", "machineId": "M1" })).await;
    let ack = recv_type(&mut ws, "registered").await;
    assert_eq!(ack["machineId"], "M1");
}

#[tokio::test]
async fn binary_frames_are_accepted() {
    let server = boot(None).await;
    let mut ws = connect(&server).await;
    let body = json!({ "type": "register", "machineId": "M1" }).to_string();
    ws.send(Message::binary(body.into_bytes())).await.unwrap();
    let _ = recv_type(&mut ws, "registered").await;
}

#[tokio::test]
async fn observer_sees_snapshot_then_transitions() {
    let server = boot(None).await;
    let _m1 = register(&server, "M1").await;

    let mut observer = connect(&server).await;
    send(&mut observer, json!({ "type": "subscribe" })).await;
    let snapshot = recv(&mut observer).await.unwrap();
    assert_eq!(snapshot["type"], "machine_update");
    assert_eq!(snapshot["machines"][0]["machineId"], "M1");
    let ack = recv(&mut observer).await.unwrap();
    assert_eq!(ack["type"], "subscribed");

    let mut m2 = register(&server, "M2").await;
    let online = recv_type(&mut observer, "machine_update").await;
    assert_eq!(online["machineId"], "M2");
    assert_eq!(online["status"], "online");

    m2.close(None).await.unwrap();
    let offline = recv_type(&mut observer, "machine_update").await;
    assert_eq!(offline["machineId"], "M2");
    assert_eq!(offline["status"], "offline");
    assert_eq!(offline["connected"], false);
}

#[tokio::test]
async fn reregistration_closes_the_old_socket() {
    let server = boot(None).await;
    let mut old = register(&server, "M1").await;
    let _new = register(&server, "M1").await;

    while recv(&mut old).await.is_some() {}
    assert_eq!(server.server.services().registry.len(), 1);
    let status = get_json(&server.http_url("/api/machines/M1/status")).await;
    assert_eq!(status["connected"], true);
}

#[tokio::test]
async fn silent_device_is_evicted_and_responsive_one_stays() {
    let server = boot(Some(HeartbeatSettings {
        interval_ms: 100,
        timeout_ms: 350,
        ..HeartbeatSettings::default()
    }))
    .await;

    let mut silent = register(&server, "M1").await;
    let mut live = register(&server, "M2").await;
    let responder = tokio::spawn(async move {
        while let Some(frame) = recv(&mut live).await {
            if frame["type"] == "ping" {
                send(&mut live, json!({ "type": "pong", "machineId": "M2" })).await;
            }
        }
    });

    // The silent socket still gets pings until the budget runs out, then closes.
    let mut saw_ping = false;
    while let Some(frame) = recv(&mut silent).await {
        saw_ping |= frame["type"] == "ping";
    }
    assert!(saw_ping);

    let m1 = get_json(&server.http_url("/api/machines/M1/status")).await;
    assert_eq!(m1["connected"], false);
    let m2 = get_json(&server.http_url("/api/machines/M2/status")).await;
    assert_eq!(m2["connected"], true);

    let events = get_json(&server.http_url("/api/events?machineId=M1")).await;
    let timeout_event = events
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["kind"] == "disconnect")
        .expect("disconnect event");
    assert_eq!(timeout_event["data"]["reason"], "timeout");

    server.server.shutdown().shutdown();
    responder.abort();
}

#[tokio::test]
async fn dispense_pushes_and_reports_rows() {
    let server = boot(None).await;
    let mut device = register(&server, "M1").await;

    let report: Value = reqwest::Client::new()
        .post(server.http_url("/api/machines/M1/dispense"))
        .json(&json!({ "items": [{ "slot": "D12" }, { "slot": "BAD" }] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let rows = report["results"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["success"], true);
    assert_eq!(rows[0]["pin"], 12);
    assert_eq!(rows[0]["pushed"], true);
    assert_eq!(rows[1]["success"], false);

    let frame = recv_type(&mut device, "dispense").await;
    assert_eq!(frame["slot"], 12);
    assert_eq!(frame["quantity"], 1);

    server.server.services().dispatcher.settle().await;
    let calls = server.transport.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "10.0.0.5:8080");
    assert_eq!(calls[0].1.slot, 12);
}
