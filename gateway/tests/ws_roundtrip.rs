//! End-to-end tests against the real router on a loopback listener.

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use netdiag_gateway::rate_limit::RateLimiter;
use netdiag_gateway::{router, server, AppState, Metrics, SessionConfig, SessionManager};
use netdiag_tools::{Executor, HostOs, Tool, ToolTable, Validator};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ALLOWED_ORIGIN: &str = "http://localhost:3000";

struct TestServer {
    addr: SocketAddr,
    manager: Arc<SessionManager>,
}

/// Every tool is replaced by `echo`, so output is the argv it was given.
async fn start(limiter: Option<RateLimiter>) -> TestServer {
    let table = Tool::ALL
        .into_iter()
        .fold(ToolTable::for_os(HostOs::Linux), |t, tool| {
            t.with_executable(tool, "echo")
        });
    let manager = Arc::new(SessionManager::new(
        Executor::new(table),
        Validator::new(),
        SessionConfig::default(),
        Arc::new(Metrics::new()),
    ));
    let state = AppState::new(manager.clone(), limiter, vec![ALLOWED_ORIGIN.to_string()]);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, router(state), std::future::pending()));

    TestServer { addr, manager }
}

struct HttpResponse {
    status: u16,
    /// Lower-cased header block.
    head: String,
    body: String,
}

async fn http(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)]) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();
    let (head, body) = text.split_once("\r\n\r\n").expect("malformed HTTP response");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("missing status code");

    HttpResponse {
        status,
        head: head.to_ascii_lowercase(),
        body: body.to_string(),
    }
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no message in time")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("message is not JSON");
        }
    }
}

#[tokio::test]
async fn test_health_and_security_headers() {
    let server = start(None).await;
    let resp = http(server.addr, "GET", "/health", &[]).await;
    assert_eq!(resp.status, 200);
    assert_eq!(serde_json::from_str::<Value>(&resp.body).unwrap()["status"], "OK");

    assert!(resp.head.contains("x-content-type-options: nosniff"));
    assert!(resp.head.contains("x-frame-options: deny"));
    assert!(resp.head.contains("x-xss-protection: 1; mode=block"));
    assert!(resp.head.contains("referrer-policy: strict-origin-when-cross-origin"));
    assert!(resp.head.contains("content-security-policy: default-src 'self'"));
}

#[tokio::test]
async fn test_tools_listing() {
    let server = start(None).await;
    let resp = http(server.addr, "GET", "/api/v1/tools", &[]).await;
    assert_eq!(resp.status, 200);
    let json: Value = serde_json::from_str(&resp.body).unwrap();
    assert_eq!(json["tools"], serde_json::json!(["ping", "dig", "traceroute"]));
}

#[tokio::test]
async fn test_cors_preflight() {
    let server = start(None).await;
    let resp = http(
        server.addr,
        "OPTIONS",
        "/api/v1/tools",
        &[
            ("Origin", ALLOWED_ORIGIN),
            ("Access-Control-Request-Method", "GET"),
        ],
    )
    .await;
    assert!(resp.head.contains("access-control-allow-origin: http://localhost:3000"));
    assert!(resp.head.contains("access-control-max-age: 86400"));

    let resp = http(
        server.addr,
        "OPTIONS",
        "/api/v1/tools",
        &[
            ("Origin", "http://evil.example"),
            ("Access-Control-Request-Method", "GET"),
        ],
    )
    .await;
    assert!(!resp.head.contains("access-control-allow-origin"));
}

#[tokio::test]
async fn test_rate_limit_per_client() {
    let server = start(Some(RateLimiter::per_minute(2))).await;
    assert_eq!(http(server.addr, "GET", "/health", &[]).await.status, 200);
    assert_eq!(http(server.addr, "GET", "/health", &[]).await.status, 200);

    let resp = http(server.addr, "GET", "/health", &[]).await;
    assert_eq!(resp.status, 429);
    assert_eq!(resp.body, "Rate limit exceeded");
    assert!(resp.head.contains("x-frame-options: deny"));
    assert_eq!(server.manager.metrics().snapshot().rate_limited_requests, 1);
}

#[tokio::test]
async fn test_ws_streams_command_output() {
    let server = start(None).await;
    let mut ws = connect(server.addr).await;

    ws.send(Message::Text(
        r#"{"tool":"ping","target":"127.0.0.1","parameters":{"count":"3"}}"#.into(),
    ))
    .await
    .unwrap();

    let data = next_json(&mut ws).await;
    assert_eq!(data["tool"], "ping");
    assert_eq!(data["target"], "127.0.0.1");
    assert_eq!(data["output"], "-c 3 -W 2 127.0.0.1");
    assert!(data["startTime"].is_string());
    assert!(data.get("endTime").is_none());

    let done = next_json(&mut ws).await;
    assert!(done["endTime"].is_string());
    assert!(done.get("error").is_none());

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn test_ws_rejections_keep_connection_open() {
    let server = start(None).await;
    let mut ws = connect(server.addr).await;

    ws.send(Message::Text(r#"{"tool":"ping","target":"-c 1 evil"}"#.into()))
        .await
        .unwrap();
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["error"], "validation error");
    assert_eq!(msg["message"], "invalid hostname");

    ws.send(Message::Text("not json".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"], "invalid request");

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert_eq!(next_json(&mut ws).await["error"], "invalid request");

    ws.send(Message::Text(r#"{"tool":"dig","target":"example.com"}"#.into()))
        .await
        .unwrap();
    let msg = next_json(&mut ws).await;
    assert_eq!(msg["output"], "+nocomments +noquestion A example.com");
}

#[tokio::test]
async fn test_ws_concurrent_requests_are_whole_messages() {
    let server = start(None).await;
    let mut ws = connect(server.addr).await;

    for request in [
        r#"{"tool":"ping","target":"127.0.0.1"}"#,
        r#"{"tool":"traceroute","target":"example.com","parameters":{"maxHops":"5"}}"#,
        r#"{"tool":"dig","target":"example.com","parameters":{"type":"TXT"}}"#,
    ] {
        ws.send(Message::Text(request.into())).await.unwrap();
    }

    let mut terminals = std::collections::HashMap::new();
    while terminals.len() < 3 {
        let msg = next_json(&mut ws).await;
        let tool = msg["tool"].as_str().unwrap().to_string();
        if msg.get("endTime").is_some() {
            assert!(terminals.insert(tool, msg).is_none(), "duplicate terminal event");
        } else {
            assert!(!terminals.contains_key(&tool), "event after terminal for {tool}");
        }
    }
}

#[tokio::test]
async fn test_ws_origin_check() {
    let server = start(None).await;

    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", "http://evil.example".parse().unwrap());
    assert!(connect_async(request).await.is_err());

    let mut request = format!("ws://{}/ws", server.addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Origin", ALLOWED_ORIGIN.parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_closes_open_sockets() {
    let server = start(None).await;
    let mut ws = connect(server.addr).await;

    for _ in 0..200 {
        if server.manager.active_sessions() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    server.manager.shutdown();

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "socket still open after shutdown");
    assert!(server.manager.wait_drained(Duration::from_secs(5)).await);

    let snapshot = http(server.addr, "GET", "/api/v1/metrics", &[]).await;
    let json: Value = serde_json::from_str(&snapshot.body).unwrap();
    assert_eq!(json["sessions_opened"], 1);
    assert_eq!(json["sessions_active"], 0);

    // New upgrades are refused once shutdown has begun.
    assert!(connect_async(format!("ws://{}/ws", server.addr)).await.is_err());
}
