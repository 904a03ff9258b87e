//! HTTP MCP transport against a raw TCP stub: session-id handling, the
//! id-mismatch policy, and JSON-RPC error mapping.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use common::{read_http_request, write_http_response};
use heddle::mcp::{HttpTransport, Transport, TransportError};

#[tokio::test]
async fn http_transport_echoes_session_id_after_initialize() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen_session_headers: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&seen_session_headers);
    let server = tokio::spawn(async move {
        for i in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (headers, body) = read_http_request(&mut stream).await;
            seen.lock()
                .unwrap()
                .push(headers.to_ascii_lowercase().contains("mcp-session-id"));
            let request: Value = serde_json::from_str(&body).unwrap();
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"round": i}
            })
            .to_string();
            let extra = if i == 0 {
                vec![("MCP-Session-Id", "sess-42")]
            } else {
                vec![]
            };
            write_http_response(&mut stream, "200 OK", Some("application/json"), &extra, &reply)
                .await;
        }
    });

    let transport = HttpTransport::new(
        format!("http://{addr}"),
        std::iter::empty::<(String, String)>(),
    )
    .unwrap();
    transport
        .send_request("initialize", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    transport
        .send_request("tools/list", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    server.await.unwrap();

    let seen = seen_session_headers.lock().unwrap().clone();
    // No session header before the server assigned one; echoed afterwards.
    assert_eq!(seen, vec![false, true]);
}

#[tokio::test]
async fn http_transport_tolerates_peer_id_mismatch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_http_request(&mut stream).await;
        // Wrong id on purpose; the response is still accepted (and logged).
        let reply = json!({"jsonrpc": "2.0", "id": 999, "result": {"ok": true}}).to_string();
        write_http_response(&mut stream, "200 OK", Some("application/json"), &[], &reply).await;
    });

    let transport = HttpTransport::new(
        format!("http://{addr}"),
        std::iter::empty::<(String, String)>(),
    )
    .unwrap();
    let result = transport
        .send_request("tools/list", json!({}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result["ok"], true);
    server.await.unwrap();
}

#[tokio::test]
async fn http_transport_maps_json_rpc_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (_, body) = read_http_request(&mut stream).await;
        let request: Value = serde_json::from_str(&body).unwrap();
        let reply = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32602, "message": "bad arguments", "data": {"field": "text"}}
        })
        .to_string();
        write_http_response(&mut stream, "200 OK", Some("application/json"), &[], &reply).await;
    });

    let transport = HttpTransport::new(
        format!("http://{addr}"),
        std::iter::empty::<(String, String)>(),
    )
    .unwrap();
    let err = transport
        .send_request("tools/call", json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        TransportError::JsonRpc {
            code,
            message,
            data,
        } => {
            assert_eq!(code, -32602);
            assert_eq!(message, "bad arguments");
            assert_eq!(data.unwrap()["field"], "text");
        }
        other => panic!("expected JsonRpc error, got {other:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn http_transport_surfaces_upstream_http_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_http_request(&mut stream).await;
        write_http_response(&mut stream, "500 Internal Server Error", Some("text/plain"), &[], "boom")
            .await;
    });

    let transport = HttpTransport::new(
        format!("http://{addr}"),
        std::iter::empty::<(String, String)>(),
    )
    .unwrap();
    let err = transport
        .send_request("tools/list", json!({}), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Io(msg) if msg.contains("500") && msg.contains("boom")));
    server.await.unwrap();
}

#[tokio::test]
async fn http_transport_request_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        // Accept and stall; never answer.
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_http_request(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let transport = HttpTransport::new(
        format!("http://{addr}"),
        std::iter::empty::<(String, String)>(),
    )
    .unwrap();
    let err = transport
        .send_request("tools/list", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    server.abort();
}
