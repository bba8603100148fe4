//! End-to-end tests against a running gateway.
//!
//! Each test starts a real server on an ephemeral loopback port, talks to it
//! with reqwest / tokio-tungstenite, and shuts it down.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use rustls_pki_types::CertificateDer;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use wallet_gateway::backend::{BackendEvent, DeviceKind, MemoryBackend};
use wallet_gateway::server::handlers::UrlOpener;
use wallet_gateway::server::{start_gateway, GatewayOptions, ServerHandle};
use wallet_gateway::tls;

#[derive(Default)]
struct RecordingOpener {
    opened: Mutex<Vec<String>>,
}

impl UrlOpener for RecordingOpener {
    fn open(&self, url: &str) -> std::io::Result<()> {
        self.opened.lock().push(url.to_string());
        Ok(())
    }
}

struct Gateway {
    handle: ServerHandle,
    backend: Arc<MemoryBackend>,
    opener: Arc<RecordingOpener>,
}

impl Gateway {
    async fn start(options: GatewayOptions) -> Self {
        let backend = Arc::new(MemoryBackend::new(false));
        let opener = Arc::new(RecordingOpener::default());
        let handle = start_gateway(options, backend.clone(), opener.clone())
            .await
            .unwrap();
        Self {
            handle,
            backend,
            opener,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.handle.base_url(), path)
    }

    fn auth(&self) -> String {
        format!("Basic {}", self.handle.descriptor().token())
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::Client::new()
            .get(self.url(path))
            .header("Authorization", self.auth())
            .send()
            .await
            .unwrap()
    }

    async fn connect_events(
        &self,
    ) -> tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    > {
        let url = format!("ws://{}/api/events", self.handle.local_addr());
        let mut request = url.into_client_request().unwrap();
        request
            .headers_mut()
            .insert("Authorization", self.auth().parse().unwrap());
        let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        socket
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_without_token_are_rejected() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let resp = reqwest::get(gw.url("/api/version")).await.unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "missing token /api/version");

    let resp = reqwest::Client::new()
        .get(gw.url("/api/version"))
        .header("Authorization", "Basic not-the-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert_eq!(resp.text().await.unwrap(), "incorrect token");

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_correct_token_reaches_handler() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let resp = gw.get("/api/version").await;
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("application/json"));
    assert!(resp.headers().get("access-control-allow-origin").is_none());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!(env!("CARGO_PKG_VERSION")));

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_gate_also_covers_unknown_paths() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let resp = reqwest::get(gw.url("/nope")).await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = gw.get("/nope").await;
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), "404 page not found");

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dev_mode_skips_gate_and_sets_cors() {
    let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = scratch.local_addr().unwrap().port();
    drop(scratch);

    let gw = Gateway::start(GatewayOptions {
        dev_mode: true,
        dev_port: port,
        dev_origin: "http://localhost:8080".to_string(),
        ..GatewayOptions::for_testing()
    })
    .await;
    assert!(gw.handle.descriptor().is_dev());

    let resp = reqwest::get(gw.url("/api/testing")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("access-control-allow-origin").unwrap(),
        "http://localhost:8080"
    );
    assert_eq!(resp.json::<Value>().await.unwrap(), json!(false));

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_open_forwards_allowed_urls_only() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(gw.url("/api/open"))
        .header("Authorization", gw.auth())
        .body(r#"{"url":"https://shiftcrypto.ch/shop"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.json::<Value>().await.unwrap(), Value::Null);

    let resp = client
        .post(gw.url("/api/open"))
        .header("Authorization", gw.auth())
        .body(r#""https://evil.example/""#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Blocked /open with url: https://evil.example/"
    );

    assert_eq!(
        *gw.opener.opened.lock(),
        vec!["https://shiftcrypto.ch/shop".to_string()]
    );
    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_account_subtree_follows_lifecycle() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let resp = gw.get("/api/account/btc-main/status").await;
    assert_eq!(resp.status(), 404);

    gw.backend.add_account("btc-main", "Bitcoin", "btc").unwrap();
    let resp = gw.get("/api/account/btc-main/status").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.json::<Value>().await.unwrap(),
        json!({ "initialized": true })
    );

    let info: Value = gw.get("/api/account/btc-main/info").await.json().await.unwrap();
    assert_eq!(info["coinCode"], "btc");

    let resp = gw.get("/api/account/btc-main/unknown").await;
    assert_eq!(resp.status(), 404);

    assert!(gw.backend.remove_account("btc-main"));
    let resp = gw.get("/api/account/btc-main/status").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.json::<Value>().await.unwrap(),
        json!({ "initialized": false })
    );

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_subtree_and_registered_list() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    gw.backend.attach_device("dev-1", DeviceKind::BitBox, "bitbox02");
    let registered: Value = gw.get("/api/devices/registered").await.json().await.unwrap();
    assert_eq!(registered["dev-1"], "bitbox02");

    let resp = gw.get("/api/devices/dev-1/status").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.json::<Value>().await.unwrap(),
        json!({ "initialized": true })
    );

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_fan_out_to_every_client() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let mut first = gw.connect_events().await;
    let mut second = gw.connect_events().await;
    let bridge = gw.handle.bridge().clone();
    wait_for(|| bridge.active_connections() == 2).await;

    assert!(gw.backend.emit(BackendEvent::Account {
        code: "btc-main".to_string(),
        data: "syncdone".to_string(),
    }));

    for socket in [&mut first, &mut second] {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = msg else {
            panic!("expected text frame, got {:?}", msg);
        };
        let event: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            event,
            json!({ "type": "account", "code": "btc-main", "data": "syncdone" })
        );
    }

    drop(first);
    drop(second);
    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_socket_requires_token() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let url = format!("ws://{}/api/events", gw.handle.local_addr());
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
    assert_eq!(gw.handle.bridge().active_connections(), 0);

    gw.handle.shutdown().await;
}

#[tokio::test]
async fn test_event_socket_ignores_query_token() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;

    let url = format!(
        "ws://{}/api/events?token={}",
        gw.handle.local_addr(),
        gw.handle.descriptor().token()
    );
    assert!(tokio_tungstenite::connect_async(url).await.is_err());
    assert_eq!(gw.handle.bridge().active_connections(), 0);

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_client_is_released() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;
    let bridge = gw.handle.bridge().clone();

    let mut socket = gw.connect_events().await;
    wait_for(|| bridge.active_connections() == 1).await;

    socket.close(None).await.unwrap();
    wait_for(|| bridge.active_connections() == 0).await;

    gw.handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_event_clients() {
    let gw = Gateway::start(GatewayOptions::for_testing()).await;
    let bridge = gw.handle.bridge().clone();

    let mut socket = gw.connect_events().await;
    wait_for(|| bridge.active_connections() == 1).await;

    gw.handle.shutdown().await;
    assert!(bridge.is_shut_down());

    let next = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap();
    assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    wait_for(|| bridge.active_connections() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_listener_presents_persisted_certificate() {
    let dir = TempDir::new().unwrap();
    let cert_path = dir.path().join("server.pem");
    let gw = Gateway::start(GatewayOptions {
        tls: true,
        certificate_path: Some(cert_path.clone()),
        ..GatewayOptions::for_testing()
    })
    .await;
    assert!(gw.handle.base_url().starts_with("https://127.0.0.1:"));

    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .tls_info(true)
        .build()
        .unwrap();
    let resp = client
        .get(gw.url("/api/version"))
        .header("Authorization", gw.auth())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let info = resp.extensions().get::<reqwest::tls::TlsInfo>().unwrap();
    let presented = CertificateDer::from(info.peer_certificate().unwrap().to_vec());
    assert_eq!(
        tls::compute_cert_fingerprint(&presented),
        gw.handle.fingerprint()
    );

    let pem = std::fs::read_to_string(&cert_path).unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

    gw.handle.shutdown().await;
}
