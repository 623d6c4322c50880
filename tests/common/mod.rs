//! Shared helpers for the integration tests: an in-process verdict server
//! and an axum stand-in for the signed upload URL.
#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use vaas::transport::{memory_transport, MemoryServer, ServerConnection};
use vaas::{ConnectionOptions, ConnectionState, Sha256, StaticToken, Vaas, VaasOptions};

pub const SESSION: &str = "session-1";

/// Fast reconnects, short drain.
pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        backoff_initial: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        drain_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

/// Distinct valid hash for index `i`.
pub fn sha(i: u64) -> Sha256 {
    format!("{:064x}", i).parse().unwrap()
}

pub fn client(options: ConnectionOptions) -> (Vaas, MemoryServer) {
    let (connector, server) = memory_transport();
    let vaas = Vaas::new(
        Arc::new(connector),
        Arc::new(StaticToken("token".into())),
        VaasOptions::default(),
        options,
    )
    .unwrap();
    (vaas, server)
}

/// Connect `vaas` while the server side accepts and authenticates.
pub async fn connect(vaas: &Vaas, server: &mut MemoryServer, session: &str) -> ServerConnection {
    let (connected, conn) = tokio::join!(vaas.connect(), async {
        let mut conn = server.accept().await.expect("no connection");
        conn.accept_auth(session).await.expect("no auth request");
        conn
    });
    connected.expect("connect failed");
    conn
}

/// Connected client with default test options.
pub async fn connected() -> (Vaas, MemoryServer, ServerConnection) {
    let (vaas, mut server) = client(test_options());
    let conn = connect(&vaas, &mut server, SESSION).await;
    (vaas, server, conn)
}

/// Verdict response for `request`, echoing its id and hash.
pub fn verdict_response(request: &Value, verdict: &str) -> Value {
    let mut response = json!({
        "kind": "VerdictResponse",
        "guid": request["guid"],
        "verdict": verdict,
    });
    if let Some(sha256) = request["sha256"].as_str() {
        response["sha256"] = json!(sha256);
    }
    response
}

/// `Unknown` response asking for an upload to `url`.
pub fn upload_request(request: &Value, url: &str, token: &str) -> Value {
    let mut response = verdict_response(request, "Unknown");
    response["url"] = json!(url);
    response["upload_token"] = json!(token);
    response
}

/// Answer every request with `respond` until the client closes. Returns the
/// number of requests served.
pub fn serve<F>(mut conn: ServerConnection, respond: F) -> JoinHandle<usize>
where
    F: Fn(&Value) -> Value + Send + 'static,
{
    tokio::spawn(async move {
        let mut served = 0;
        while let Some(request) = conn.recv_json().await {
            conn.send_json(&respond(&request));
            served += 1;
        }
        served
    })
}

/// Read requests until the client closes, without answering.
pub fn drain(mut conn: ServerConnection) -> JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(request) = conn.recv_json().await {
            seen.push(request);
        }
        seen
    })
}

pub async fn wait_for_state(vaas: &Vaas, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while vaas.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {}", state));
}

// =============================================================================
// Signed upload URL stand-in
// =============================================================================

#[derive(Debug)]
pub struct Upload {
    pub authorization: Option<String>,
    pub content_length: Option<String>,
    pub body: Vec<u8>,
}

/// Accept PUTs on `/upload`, answering with `status`. Every received upload
/// is forwarded on the returned channel.
pub async fn upload_server(status: StatusCode) -> (String, mpsc::UnboundedReceiver<Upload>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route(
            "/upload",
            put(
                move |State(tx): State<mpsc::UnboundedSender<Upload>>,
                      headers: HeaderMap,
                      body: Bytes| async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    let _ = tx.send(Upload {
                        authorization: header("authorization"),
                        content_length: header("content-length"),
                        body: body.to_vec(),
                    });
                    status
                },
            ),
        )
        .with_state(tx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{}/upload", addr), rx)
}

/// Accept PUTs on `/upload` that never complete. The returned receiver
/// fires once per PUT that reached the handler.
pub async fn stalled_upload_server() -> (String, mpsc::UnboundedReceiver<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route(
            "/upload",
            put(
                move |State(tx): State<mpsc::UnboundedSender<()>>| async move {
                    let _ = tx.send(());
                    std::future::pending::<StatusCode>().await
                },
            ),
        )
        .with_state(tx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{}/upload", addr), rx)
}
