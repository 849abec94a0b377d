//! HTTP round trips against a live router on an ephemeral port.

#![cfg(feature = "transport-http")]

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use identity_reconciler::transport::router;
use identity_reconciler::{IdentityResolver, InMemoryContactStore};

async fn spawn_server() -> SocketAddr {
    let resolver = Arc::new(IdentityResolver::new(Arc::new(InMemoryContactStore::new())));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(resolver)).await.unwrap();
    });
    addr
}

/// Minimal HTTP/1.1 client: one request per connection.
async fn send(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status: u16 = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let (_, payload) = raw.split_once("\r\n\r\n").unwrap();
    (status, serde_json::from_str(payload).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identify_links_and_merges_over_http() {
    let addr = spawn_server().await;

    let (status, body) = send(
        addr,
        "POST",
        "/identify",
        Some(r#"{"email":"lorraine@hillvalley.edu","phoneNumber":"123456"}"#),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["contact"]["primaryContactId"], 1);

    let (status, body) = send(
        addr,
        "POST",
        "/api/identify",
        Some(r#"{"email":"mcfly@hillvalley.edu","phoneNumber":123456}"#),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(
        body,
        json!({
            "contact": {
                "primaryContactId": 1,
                "emails": ["lorraine@hillvalley.edu", "mcfly@hillvalley.edu"],
                "phoneNumbers": ["123456"],
                "secondaryContactIds": [2]
            }
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_requests_get_400_with_error_field() {
    let addr = spawn_server().await;

    let (status, body) = send(addr, "POST", "/identify", Some("{}")).await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, body) =
        send(addr, "POST", "/identify", Some(r#"{"email":"","phoneNumber":null}"#)).await;
    assert_eq!(status, 400);
    assert!(body["error"].as_str().unwrap().contains("email"));

    let (status, body) = send(addr, "POST", "/identify", Some("not json")).await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn healthz_reports_ok() {
    let addr = spawn_server().await;

    let (status, body) = send(addr, "GET", "/healthz", None).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({ "status": "ok" }));
}
