//! HTTP MCP transport (Streamable HTTP): one POST per JSON-RPC message.
//!
//! Sends `Accept: application/json, text/event-stream` and parses either a
//! single JSON object or an SSE body carrying the response. Tracks the
//! `MCP-Session-Id` the server hands out and echoes it on later requests;
//! propagates the gateway request id as `X-Request-Id`. Connection reuse is
//! the HTTP client's business.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::request_id;

use super::jsonrpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use super::transport::{Transport, TransportError, TransportKind};
use super::PROTOCOL_VERSION;

pub struct HttpTransport {
    client: Client,
    url: String,
    /// Static headers sent on every request (e.g. an API key).
    headers: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        url: impl Into<String>,
        headers: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn build_post(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", PROTOCOL_VERSION)
            .body(body);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(id) = request_id::current() {
            req = req.header(request_id::HEADER, id);
        }
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sid) = session {
            req = req.header("MCP-Session-Id", sid);
        }
        req
    }

    fn remember_session_id(&self, response: &reqwest::Response) {
        let Some(sid) = response
            .headers()
            .get("MCP-Session-Id")
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid.to_string());
    }
}

fn send_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Io(e.to_string())
    }
}

/// Parses a JSON-RPC response from an HTTP body: either one JSON object, or an
/// SSE stream whose `data:` lines carry JSON-RPC messages (the first one with
/// a result or error wins).
fn parse_response_body(body: &str, content_type: Option<&str>) -> Result<JsonRpcMessage, TransportError> {
    let is_sse = content_type.map(|s| s.contains("text/event-stream")).unwrap_or(false);
    if !is_sse {
        return serde_json::from_str(body)
            .map_err(|e| TransportError::Io(format!("response json: {e}")));
    }

    fn try_parse(buf: &mut String) -> Option<JsonRpcMessage> {
        if buf.is_empty() {
            return None;
        }
        match serde_json::from_str::<JsonRpcMessage>(buf) {
            Ok(msg) if msg.is_response() => Some(msg),
            _ => {
                buf.clear();
                None
            }
        }
    }

    let mut data = String::new();
    for line in body.lines() {
        if let Some(payload) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            let payload = payload.trim();
            if payload == "[DONE]" || payload.is_empty() {
                if let Some(msg) = try_parse(&mut data) {
                    return Ok(msg);
                }
                continue;
            }
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(payload);
        } else if line.trim().is_empty() {
            if let Some(msg) = try_parse(&mut data) {
                return Ok(msg);
            }
        }
    }
    if let Some(msg) = try_parse(&mut data) {
        return Ok(msg);
    }
    Err(TransportError::Io(
        "sse body carried no json-rpc response".into(),
    ))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let request = JsonRpcRequest::new(id, method, params);
        let body = serde_json::to_vec(&request)
            .map_err(|e| TransportError::Io(format!("encode request: {e}")))?;

        let response = self
            .build_post(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;
        self.remember_session_id(&response);

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Io(format!(
                "{method} HTTP {status}: {}",
                if text.is_empty() { "no body" } else { &text }
            )));
        }
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let text = response
            .text()
            .await
            .map_err(|e| send_error(e, timeout))?;
        let msg = parse_response_body(&text, content_type.as_deref())?;
        if msg.response_id() != Some(id) {
            // Inherited policy: log the mismatch, keep the response.
            tracing::warn!(expected = id, got = ?msg.id, "mcp http peer returned mismatched id");
        }
        match msg.error {
            Some(err) => Err(TransportError::JsonRpc {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            None => Ok(msg.result.unwrap_or(Value::Null)),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let notification = JsonRpcNotification::new(method, params);
        let body = serde_json::to_vec(&notification)
            .map_err(|e| TransportError::Io(format!("encode notification: {e}")))?;
        let timeout = Duration::from_secs(10);
        let response = self
            .build_post(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;
        self.remember_session_id(&response);
        let status = response.status();
        // 202 Accepted is the expected answer for notifications.
        if status.is_success() || status == reqwest::StatusCode::ACCEPTED {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(TransportError::Io(format!(
                "{method} HTTP {status}: {}",
                if text.is_empty() { "no body" } else { &text }
            )))
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }
}
