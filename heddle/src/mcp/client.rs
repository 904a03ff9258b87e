//! Per-server MCP session: initialize handshake, tool/resource/prompt RPCs.
//!
//! Lifecycle: `new → initializing → ready → (draining) → closed`, with
//! `any → failed` on an unrecoverable transport error. After a failure every
//! operation fails fast with the original error until the manager replaces
//! the session. Concurrent RPCs are fine; each has its own id and waiter.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::transport::{Transport, TransportError, TransportKind};
use super::PROTOCOL_VERSION;

const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    New,
    Initializing,
    Ready,
    Failed,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum McpClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("initialize handshake with {server}: {reason}")]
    Handshake { server: String, reason: String },
    #[error("server {server} is {state}")]
    NotReady {
        server: String,
        state: &'static str,
    },
    #[error("unexpected {method} response: {detail}")]
    Decode {
        method: &'static str,
        detail: String,
    },
}

/// What the server said it can do in the initialize reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
    #[serde(default)]
    capabilities: ServerCapabilities,
}

/// A tool as advertised by `tools/list` (original, un-namespaced name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ToolListResult {
    #[serde(default)]
    tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResourceListResult {
    #[serde(default)]
    resources: Vec<ResourceDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
struct PromptListResult {
    #[serde(default)]
    prompts: Vec<PromptDefinition>,
}

/// Result of one tool invocation; `is_error` mirrors the MCP `isError` flag.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient").field("name", &self.name).finish()
    }
}

pub struct McpClient {
    name: String,
    transport: Arc<dyn Transport>,
    /// Default per-RPC timeout for metadata calls; tool calls get an explicit one.
    rpc_timeout: Duration,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<TransportError>>,
    capabilities: Mutex<Option<ServerCapabilities>>,
    protocol_version: Mutex<Option<String>>,
    tools: RwLock<Vec<ToolDefinition>>,
    resources: RwLock<Vec<ResourceDefinition>>,
    prompts: RwLock<Vec<PromptDefinition>>,
}

impl McpClient {
    pub fn new(name: impl Into<String>, transport: Arc<dyn Transport>, rpc_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            transport,
            rpc_timeout,
            state: Mutex::new(SessionState::New),
            last_error: Mutex::new(None),
            capabilities: Mutex::new(None),
            protocol_version: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn mark_failed(&self, err: TransportError) {
        self.set_state(SessionState::Failed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cached_tools(&self) -> Vec<ToolDefinition> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn cached_resources(&self) -> Vec<ResourceDefinition> {
        self.resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cached_prompts(&self) -> Vec<PromptDefinition> {
        self.prompts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ensure_ready(&self) -> Result<(), McpClientError> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Failed => {
                let original = self
                    .last_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
                    .unwrap_or(TransportError::Closed);
                Err(McpClientError::Transport(original))
            }
            other => Err(McpClientError::NotReady {
                server: self.name.clone(),
                state: other.as_str(),
            }),
        }
    }

    /// One ready-state RPC; fatal transport errors flip the session to failed.
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpClientError> {
        self.ensure_ready()?;
        match self.transport.send_request(method, params, timeout).await {
            Ok(v) => Ok(v),
            Err(e) => {
                if e.is_fatal() {
                    self.mark_failed(e.clone());
                }
                Err(e.into())
            }
        }
    }

    /// Performs the initialize handshake, records capabilities, sends
    /// `notifications/initialized`, and caches the advertised metadata.
    pub async fn initialize(&self) -> Result<ServerCapabilities, McpClientError> {
        match self.state() {
            SessionState::New => {}
            SessionState::Ready => return Ok(self.capabilities().unwrap_or_default()),
            other => {
                return Err(McpClientError::NotReady {
                    server: self.name.clone(),
                    state: other.as_str(),
                })
            }
        }
        self.set_state(SessionState::Initializing);

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": {
                "name": "heddle",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let reply = match self
            .transport
            .send_request("initialize", params, INITIALIZE_TIMEOUT)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                self.mark_failed(e.clone());
                return Err(e.into());
            }
        };
        let init: InitializeResult = serde_json::from_value(reply).map_err(|e| {
            let err = McpClientError::Handshake {
                server: self.name.clone(),
                reason: e.to_string(),
            };
            self.mark_failed(TransportError::Io(format!("initialize: {e}")));
            err
        })?;
        tracing::debug!(
            server = %self.name,
            protocol = %init.protocol_version,
            "mcp initialize ok"
        );
        *self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(init.protocol_version);
        *self.capabilities.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(init.capabilities.clone());

        if let Err(e) = self
            .transport
            .send_notification("notifications/initialized", json!({}))
            .await
        {
            self.mark_failed(e.clone());
            return Err(e.into());
        }

        self.set_state(SessionState::Ready);
        self.refresh_metadata().await?;
        Ok(init.capabilities)
    }

    /// Re-fetches the tool list, plus resources/prompts when the server
    /// advertises them, and replaces the cached copies.
    pub async fn refresh_metadata(&self) -> Result<(), McpClientError> {
        self.list_tools().await?;
        let caps = self.capabilities().unwrap_or_default();
        if caps.resources.is_some() {
            self.list_resources().await?;
        }
        if caps.prompts.is_some() {
            self.list_prompts().await?;
        }
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpClientError> {
        let reply = self
            .request("tools/list", json!({}), self.rpc_timeout)
            .await?;
        let parsed: ToolListResult =
            serde_json::from_value(reply).map_err(|e| McpClientError::Decode {
                method: "tools/list",
                detail: e.to_string(),
            })?;
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = parsed.tools.clone();
        Ok(parsed.tools)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolOutcome, McpClientError> {
        let params = json!({ "name": name, "arguments": arguments });
        let reply = self.request("tools/call", params, timeout).await?;
        Ok(parse_tool_outcome(&reply))
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDefinition>, McpClientError> {
        let reply = self
            .request("resources/list", json!({}), self.rpc_timeout)
            .await?;
        let parsed: ResourceListResult =
            serde_json::from_value(reply).map_err(|e| McpClientError::Decode {
                method: "resources/list",
                detail: e.to_string(),
            })?;
        *self.resources.write().unwrap_or_else(|e| e.into_inner()) = parsed.resources.clone();
        Ok(parsed.resources)
    }

    /// Reads one resource and flattens its text contents.
    pub async fn read_resource(&self, uri: &str) -> Result<String, McpClientError> {
        let reply = self
            .request("resources/read", json!({ "uri": uri }), self.rpc_timeout)
            .await?;
        let contents = reply
            .get("contents")
            .and_then(Value::as_array)
            .ok_or_else(|| McpClientError::Decode {
                method: "resources/read",
                detail: "missing contents array".into(),
            })?;
        let mut parts = Vec::new();
        for item in contents {
            if let Some(text) = item.get("text").and_then(Value::as_str) {
                parts.push(text.to_string());
            } else if let Some(blob) = item.get("blob").and_then(Value::as_str) {
                parts.push(format!("(binary resource, {} base64 bytes)", blob.len()));
            }
        }
        Ok(parts.join("\n"))
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptDefinition>, McpClientError> {
        let reply = self
            .request("prompts/list", json!({}), self.rpc_timeout)
            .await?;
        let parsed: PromptListResult =
            serde_json::from_value(reply).map_err(|e| McpClientError::Decode {
                method: "prompts/list",
                detail: e.to_string(),
            })?;
        *self.prompts.write().unwrap_or_else(|e| e.into_inner()) = parsed.prompts.clone();
        Ok(parsed.prompts)
    }

    /// Fetches a rendered prompt; the raw result (description + messages) is
    /// returned as-is for the caller to relay.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpClientError> {
        self.request(
            "prompts/get",
            json!({ "name": name, "arguments": arguments }),
            self.rpc_timeout,
        )
        .await
    }

    /// Drains pending requests up to `drain_timeout`, then closes the transport.
    pub async fn close(&self, drain_timeout: Duration) -> Result<(), McpClientError> {
        self.set_state(SessionState::Draining);
        let deadline = tokio::time::Instant::now() + drain_timeout;
        while self.transport.pending() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let result = self.transport.close().await;
        self.set_state(SessionState::Closed);
        result.map_err(Into::into)
    }
}

/// Flattens a `tools/call` result into text + error flag. Text blocks join
/// with newlines; `structuredContent` is the fallback for tools that return
/// only structured output.
fn parse_tool_outcome(reply: &Value) -> ToolOutcome {
    let is_error = reply
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mut parts = Vec::new();
    if let Some(content) = reply.get("content").and_then(Value::as_array) {
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    parts.push(text.to_string());
                }
            }
        }
    }
    let mut content = parts.join("\n");
    if content.is_empty() {
        if let Some(structured) = reply.get("structuredContent") {
            content = structured.to_string();
        }
    }
    ToolOutcome { content, is_error }
}
