//! Shared TCP stub servers for integration tests: a recording OpenAI-style
//! backend (blocking and SSE) and an MCP server with one echo tool.
//! Responses are scripted; the last entry is sticky so loops can run any
//! number of rounds.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use heddle::guardrails::GuardrailConfig;
use heddle::mcp::{HttpTransport, ManagerConfig, McpClient, ServerManager, Transport};
use heddle::{BackendClient, ChatProxy, Guardrails, ResponseCache, ToolRegistry};

pub async fn read_http_request(stream: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = match stream.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let header_end = pos + 4;
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let content_length = headers
                .lines()
                .find_map(|line| {
                    line.to_ascii_lowercase()
                        .strip_prefix("content-length:")
                        .and_then(|v| v.trim().parse::<usize>().ok())
                })
                .unwrap_or(0);
            let mut body = buf[header_end..].to_vec();
            while body.len() < content_length {
                let m = match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(m) => m,
                };
                body.extend_from_slice(&tmp[..m]);
            }
            let body = String::from_utf8_lossy(&body[..content_length.min(body.len())]).to_string();
            return (headers, body);
        }
    }
    (String::new(), String::new())
}

pub async fn write_http_response(
    stream: &mut TcpStream,
    status: &str,
    content_type: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &str,
) {
    let mut resp = format!("HTTP/1.1 {status}\r\nConnection: close\r\n");
    if let Some(ct) = content_type {
        resp.push_str(&format!("Content-Type: {ct}\r\n"));
    }
    for (k, v) in extra_headers {
        resp.push_str(&format!("{k}: {v}\r\n"));
    }
    resp.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    let _ = stream.write_all(resp.as_bytes()).await;
}

/// Backend chat response carrying tool calls.
pub fn tool_call_response(calls: Value) -> Value {
    json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "m",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": null, "tool_calls": calls},
            "finish_reason": "tool_calls"
        }]
    })
}

/// Backend chat response with plain assistant text.
pub fn text_response(content: &str) -> Value {
    json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "created": 1700000000,
        "model": "m",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
}

pub struct RecordingBackend {
    pub url: String,
    pub requests: Arc<Mutex<Vec<Value>>>,
}

impl RecordingBackend {
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> Value {
        self.requests.lock().unwrap()[index].clone()
    }
}

/// Blocking backend stub: serves the scripted chat responses in order
/// (sticky last), recording each request body.
pub async fn spawn_backend(responses: Vec<Value>) -> RecordingBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let (_headers, body) = read_http_request(&mut stream).await;
            recorded
                .lock()
                .unwrap()
                .push(serde_json::from_str(&body).unwrap_or(Value::Null));
            let index = served.min(responses.len().saturating_sub(1));
            served += 1;
            let payload = responses[index].to_string();
            write_http_response(&mut stream, "200 OK", Some("application/json"), &[], &payload)
                .await;
        }
    });
    RecordingBackend { url, requests }
}

/// Streaming backend stub: each scripted call is a list of chunk payloads,
/// emitted as SSE `data:` lines and closed with `data: [DONE]`.
pub async fn spawn_sse_backend(scripts: Vec<Vec<Value>>) -> RecordingBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let (_headers, body) = read_http_request(&mut stream).await;
            recorded
                .lock()
                .unwrap()
                .push(serde_json::from_str(&body).unwrap_or(Value::Null));
            let index = served.min(scripts.len().saturating_sub(1));
            served += 1;
            let mut payload = String::new();
            for chunk in &scripts[index] {
                payload.push_str(&format!("data: {chunk}\n\n"));
            }
            payload.push_str("data: [DONE]\n\n");
            write_http_response(
                &mut stream,
                "200 OK",
                Some("text/event-stream"),
                &[],
                &payload,
            )
            .await;
        }
    });
    RecordingBackend { url, requests }
}

/// One streamed chunk with a content delta.
pub fn content_chunk(content: &str, finish: Option<&str>) -> Value {
    json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion.chunk",
        "created": 1700000000,
        "model": "m",
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": content},
            "finish_reason": finish
        }]
    })
}

/// One streamed chunk carrying a whole tool call plus finish_reason.
pub fn tool_call_chunk_payload(id: &str, name: &str, arguments: &str) -> Value {
    json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion.chunk",
        "created": 1700000000,
        "model": "m",
        "choices": [{
            "index": 0,
            "delta": {"tool_calls": [{
                "index": 0,
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": arguments}
            }]},
            "finish_reason": "tool_calls"
        }]
    })
}

pub struct McpStub {
    pub url: String,
    pub methods: Arc<Mutex<Vec<String>>>,
}

impl McpStub {
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }
}

/// MCP server stub exposing `echo(text) -> text` and a readable resource.
/// `call_delay` postpones `tools/call` replies, for cancellation tests.
pub async fn spawn_mcp_echo(call_delay: Option<Duration>) -> McpStub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let methods: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&methods);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let (_headers, body) = read_http_request(&mut stream).await;
            let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
            let method = request
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            seen.lock().unwrap().push(method.clone());
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            let reply = match method.as_str() {
                "initialize" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2025-03-26",
                        "capabilities": {"tools": {}, "resources": {}},
                        "serverInfo": {"name": "echo-stub", "version": "1.0"}
                    }
                }),
                "notifications/initialized" => {
                    write_http_response(&mut stream, "202 Accepted", None, &[], "").await;
                    continue;
                }
                "tools/list" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"tools": [{
                        "name": "echo",
                        "description": "echoes text back",
                        "inputSchema": {
                            "type": "object",
                            "properties": {"text": {"type": "string"}},
                            "required": ["text"]
                        }
                    }]}
                }),
                "resources/list" => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"resources": [{"uri": "doc://greeting"}]}
                }),
                "resources/read" => {
                    let uri = request["params"]["uri"].as_str().unwrap_or("");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"contents": [{"uri": uri, "text": format!("contents of {uri}")}]}
                    })
                }
                "tools/call" => {
                    if let Some(delay) = call_delay {
                        tokio::time::sleep(delay).await;
                    }
                    let text = request["params"]["arguments"]["text"]
                        .as_str()
                        .unwrap_or("")
                        .to_string();
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"content": [{"type": "text", "text": text}]}
                    })
                }
                other => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method not found: {other}")}
                }),
            };
            write_http_response(
                &mut stream,
                "200 OK",
                Some("application/json"),
                &[],
                &reply.to_string(),
            )
            .await;
        }
    });
    McpStub { url, methods }
}

pub struct ProxyFixture {
    pub proxy: Arc<ChatProxy>,
    pub cache: Arc<ResponseCache>,
    pub manager: Arc<ServerManager>,
}

/// Wires a proxy to the given backend and (optionally) one MCP server
/// registered under the name `srv`.
pub async fn build_proxy(
    backend_url: &str,
    mcp: Option<&McpStub>,
    guardrails: GuardrailConfig,
) -> ProxyFixture {
    let backend = Arc::new(BackendClient::new(backend_url, Duration::from_secs(10)).unwrap());
    let manager = Arc::new(ServerManager::new(ManagerConfig::default()));
    let registry = Arc::new(ToolRegistry::new());
    if let Some(stub) = mcp {
        let transport = Arc::new(
            HttpTransport::new(stub.url.clone(), std::iter::empty::<(String, String)>()).unwrap(),
        );
        let client = Arc::new(McpClient::new(
            "srv",
            transport as Arc<dyn Transport>,
            Duration::from_secs(5),
        ));
        client.initialize().await.unwrap();
        manager.add(Arc::clone(&client)).await;
        registry.add_client(&client).unwrap();
    }
    let cache = Arc::new(ResponseCache::new(16, Duration::from_secs(300)));
    let proxy = Arc::new(ChatProxy::new(
        backend,
        Arc::clone(&manager),
        registry,
        Arc::new(Guardrails::new(guardrails).unwrap()),
        Arc::clone(&cache),
    ));
    ProxyFixture {
        proxy,
        cache,
        manager,
    }
}

/// A minimal chat request for model `m` with one user message.
pub fn chat_request(content: &str) -> heddle::ChatCompletionRequest {
    serde_json::from_value(json!({
        "model": "m",
        "messages": [{"role": "user", "content": content}]
    }))
    .unwrap()
}
