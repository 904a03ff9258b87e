//! The tool-augmented chat loop.
//!
//! A request flows: cache lookup → backend call → tool-call scan → guardrails
//! → registry resolve → MCP dispatch → results appended to the conversation →
//! next round, until a round produces no tool calls. The error policy is
//! "recover inside the conversation, surface outside of it": anything the
//! model can adapt to (tool failures, guardrail violations) becomes a
//! conversation message and the HTTP status stays 200; backend failures
//! become [`ProxyError`] and map to 502/503.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, BackendError};
use crate::cache::ResponseCache;
use crate::guardrails::{redact, Guardrails};
use crate::mcp::{scan_mcp_uris, ServerManager};
use crate::openai::{
    mint_completion_id, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage, Choice, ChunkChoice, Delta, DeltaFunction, DeltaToolCall, MessageContent,
    ToolCall,
};
use crate::tools::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("backend response had no choices")]
    EmptyCompletion,
    #[error("internal: {0}")]
    Internal(String),
}

/// A finished blocking completion: the exact bytes to return, and whether
/// they came from the cache.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub body: Arc<String>,
    pub cached: bool,
}

pub struct ChatProxy {
    backend: Arc<BackendClient>,
    manager: Arc<ServerManager>,
    registry: Arc<ToolRegistry>,
    guardrails: Arc<Guardrails>,
    cache: Arc<ResponseCache>,
}

impl ChatProxy {
    pub fn new(
        backend: Arc<BackendClient>,
        manager: Arc<ServerManager>,
        registry: Arc<ToolRegistry>,
        guardrails: Arc<Guardrails>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            backend,
            manager,
            registry,
            guardrails,
            cache,
        }
    }

    /// Effective `tools` array for backend calls. A request carrying its own
    /// tools is passed through untouched; `tool_choice:"none"` and an empty
    /// registry both mean no attachment.
    fn tool_payload(&self, request: &ChatCompletionRequest) -> Option<Vec<Value>> {
        if request.tools.is_some() {
            return request.tools.clone();
        }
        if request.tools_opted_out() || self.registry.is_empty() {
            return None;
        }
        Some(self.registry.to_openai_schema())
    }

    /// Runs the blocking loop and returns the final response body, byte-stable
    /// for identical requests via the cache.
    pub async fn completion(&self, request: ChatCompletionRequest) -> Result<ChatOutcome, ProxyError> {
        let messages_value = serde_json::to_value(&request.messages)
            .map_err(|e| ProxyError::Internal(format!("encode messages: {e}")))?;
        if let Some(hit) = self.cache.get(&request.model, &messages_value) {
            tracing::debug!(model = %request.model, "chat completion served from cache");
            return Ok(ChatOutcome {
                body: hit,
                cached: true,
            });
        }

        let tools = self.tool_payload(&request);
        let mut convo = request.messages.clone();
        let mut total_calls = 0usize;
        let mut round: u32 = 0;

        let final_response = loop {
            if let Err(g) = self.guardrails.check_rounds(round) {
                break synthetic_final(&request.model, g.to_string());
            }

            let mut backend_request = request.clone();
            backend_request.stream = false;
            backend_request.stream_options = None;
            backend_request.messages = convo.clone();
            backend_request.tools = tools.clone();
            let response = self.backend.chat(&backend_request).await?;

            let assistant = response
                .choices
                .first()
                .map(|c| c.message.clone())
                .ok_or(ProxyError::EmptyCompletion)?;
            let calls = assistant.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                break response;
            }

            if let Err(g) = self.guardrails.check_calls_per_round(calls.len()) {
                break synthetic_final(&request.model, g.to_string());
            }
            if let Err(g) = self.guardrails.check_total(total_calls + calls.len()) {
                break synthetic_final(&request.model, g.to_string());
            }

            // Referenced resources land in the conversation before the tool
            // results, so the model sees them alongside this round's output.
            convo.extend(self.resource_injections(&assistant.text()).await);
            convo.push(assistant);
            for call in &calls {
                let result = self.dispatch_tool_call(call).await;
                convo.push(ChatMessage::tool(call.id.clone(), result));
                total_calls += 1;
            }
            round += 1;
        };

        let body = serde_json::to_string(&final_response)
            .map_err(|e| ProxyError::Internal(format!("encode response: {e}")))?;
        self.cache.set(&request.model, &messages_value, body.clone());
        Ok(ChatOutcome {
            body: Arc::new(body),
            cached: false,
        })
    }

    /// Runs the streaming loop. Backend chunks are forwarded until a tool
    /// call is detected; tools are dispatched exactly as in the blocking
    /// loop, then the backend is re-entered with the extended conversation.
    /// The first backend connection happens inline so connect failures can
    /// still map to an HTTP error.
    pub async fn completion_stream(
        self: &Arc<Self>,
        request: ChatCompletionRequest,
        cancel: CancellationToken,
    ) -> Result<ReceiverStream<Result<ChatCompletionChunk, ProxyError>>, ProxyError> {
        let tools = self.tool_payload(&request);
        if let Err(g) = self.guardrails.check_rounds(0) {
            // Degenerate configuration: no rounds at all.
            let (tx, rx) = mpsc::channel(1);
            let _ = tx
                .send(Ok(text_chunk(&None, &request.model, g.to_string(), true)))
                .await;
            return Ok(ReceiverStream::new(rx));
        }
        let mut first_request = request.clone();
        first_request.stream = true;
        first_request.tools = tools.clone();
        let first = self.backend.chat_stream(&first_request).await?;

        let (tx, rx) = mpsc::channel(32);
        let proxy = Arc::clone(self);
        tokio::spawn(async move {
            proxy
                .drive_stream(request, tools, cancel, tx, first)
                .await;
        });
        Ok(ReceiverStream::new(rx))
    }

    async fn drive_stream(
        self: Arc<Self>,
        request: ChatCompletionRequest,
        tools: Option<Vec<Value>>,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<ChatCompletionChunk, ProxyError>>,
        mut current: ReceiverStream<Result<ChatCompletionChunk, BackendError>>,
    ) {
        use futures_util::StreamExt;

        let mut convo = request.messages.clone();
        let mut total_calls = 0usize;
        let mut round: u32 = 0;
        let mut meta: Option<(String, i64)> = None;

        loop {
            let mut acc = ToolCallAccumulator::default();
            let mut text_acc = String::new();
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = current.next() => item,
                };
                let Some(item) = item else { break };
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                if meta.is_none() {
                    meta = Some((chunk.id.clone(), chunk.created));
                }
                let mut has_tool_delta = false;
                let mut finished_tools = false;
                for choice in &chunk.choices {
                    if let Some(frags) = &choice.delta.tool_calls {
                        acc.absorb(frags);
                        has_tool_delta = true;
                    }
                    if let Some(content) = &choice.delta.content {
                        text_acc.push_str(content);
                    }
                    if choice.finish_reason.as_deref() == Some("tool_calls") {
                        finished_tools = true;
                    }
                }
                // Forward pure content up to the point a tool call shows up.
                if !has_tool_delta && !finished_tools {
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                if finished_tools {
                    break;
                }
            }

            let calls = acc.into_calls();
            if calls.is_empty() {
                // Final round: the backend stream closed without tool calls.
                return;
            }

            // Synthetic assistant delta carrying the assembled tool calls.
            let synthetic = tool_call_chunk(&meta, &request.model, &calls);
            if tx.send(Ok(synthetic)).await.is_err() {
                return;
            }

            let cap_error = self
                .guardrails
                .check_calls_per_round(calls.len())
                .err()
                .or_else(|| {
                    self.guardrails
                        .check_total(total_calls + calls.len())
                        .err()
                });
            if let Some(g) = cap_error {
                let _ = tx
                    .send(Ok(text_chunk(&meta, &request.model, g.to_string(), true)))
                    .await;
                return;
            }

            convo.extend(self.resource_injections(&text_acc).await);
            convo.push(assistant_with_calls(&text_acc, calls.clone()));
            for call in &calls {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = self.dispatch_tool_call(call) => result,
                };
                convo.push(ChatMessage::tool(call.id.clone(), result));
                total_calls += 1;
            }

            round += 1;
            if let Err(g) = self.guardrails.check_rounds(round) {
                let _ = tx
                    .send(Ok(text_chunk(&meta, &request.model, g.to_string(), true)))
                    .await;
                return;
            }

            let mut backend_request = request.clone();
            backend_request.stream = true;
            backend_request.messages = convo.clone();
            backend_request.tools = tools.clone();
            current = match self.backend.chat_stream(&backend_request).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
        }
    }

    /// Dispatches one tool call. Never fails out of the loop; every failure
    /// becomes the content of the `role:"tool"` message.
    pub async fn dispatch_tool_call(&self, call: &ToolCall) -> String {
        let name = &call.function.name;
        if let Err(g) = self.guardrails.validate(name) {
            tracing::debug!(tool = %name, "tool call blocked: {g}");
            return g.to_string();
        }
        let (client, original) = match self.registry.resolve(name) {
            Ok(resolved) => resolved,
            Err(e) => return e.to_string(),
        };
        let arguments = call.function.arguments_object();
        tracing::debug!(
            tool = %name,
            server = %client.name(),
            args = %redact(&arguments),
            "dispatching tool call"
        );
        match client
            .call_tool(&original, arguments, self.guardrails.timeout())
            .await
        {
            Ok(outcome) => {
                self.manager
                    .record_call(client.name(), !outcome.is_error)
                    .await;
                let text = if outcome.is_error {
                    format!("tool error: {}", outcome.content)
                } else {
                    outcome.content
                };
                self.guardrails.truncate(&text)
            }
            Err(e) => {
                self.manager.record_call(client.name(), false).await;
                format!("tool call failed: {e}")
            }
        }
    }

    /// Resolves `mcp://` references in assistant text, at most once per
    /// unique URI per round, into context messages.
    async fn resource_injections(&self, text: &str) -> Vec<ChatMessage> {
        let mut seen = HashSet::new();
        let mut messages = Vec::new();
        for uri in scan_mcp_uris(text) {
            if !seen.insert(uri.clone()) {
                continue;
            }
            let content = match self.manager.get(&uri.server).await {
                Some(managed) => match managed.client().read_resource(&uri.resource).await {
                    Ok(content) => format!("Resource {uri}:\n{content}"),
                    Err(e) => format!("Resource {uri} unavailable: {e}"),
                },
                None => format!("Resource {uri} unavailable: unknown server"),
            };
            messages.push(ChatMessage::system(content));
        }
        messages
    }
}

/// Final response used when a guardrail ends the conversation: the guardrail
/// text as the assistant message, finish_reason "stop", HTTP 200.
fn synthetic_final(model: &str, text: String) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: mint_completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChatMessage::assistant(text),
            finish_reason: Some("stop".to_string()),
            extra: Map::new(),
        }],
        usage: None,
        extra: Map::new(),
    }
}

fn chunk_meta(meta: &Option<(String, i64)>) -> (String, i64) {
    meta.clone()
        .unwrap_or_else(|| (mint_completion_id(), chrono::Utc::now().timestamp()))
}

fn text_chunk(
    meta: &Option<(String, i64)>,
    model: &str,
    content: String,
    finish: bool,
) -> ChatCompletionChunk {
    let (id, created) = chunk_meta(meta);
    ChatCompletionChunk {
        id,
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: Delta {
                role: Some("assistant".to_string()),
                content: Some(content),
                tool_calls: None,
            },
            finish_reason: finish.then(|| "stop".to_string()),
            extra: Map::new(),
        }],
        usage: None,
        extra: Map::new(),
    }
}

fn tool_call_chunk(
    meta: &Option<(String, i64)>,
    model: &str,
    calls: &[ToolCall],
) -> ChatCompletionChunk {
    let (id, created) = chunk_meta(meta);
    let deltas = calls
        .iter()
        .enumerate()
        .map(|(i, call)| DeltaToolCall {
            index: i as u32,
            id: Some(call.id.clone()),
            call_type: Some("function".to_string()),
            function: Some(DeltaFunction {
                name: Some(call.function.name.clone()),
                arguments: Some(arguments_string(&call.function.arguments)),
            }),
        })
        .collect();
    ChatCompletionChunk {
        id,
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: Delta {
                role: Some("assistant".to_string()),
                content: None,
                tool_calls: Some(deltas),
            },
            finish_reason: Some("tool_calls".to_string()),
            extra: Map::new(),
        }],
        usage: None,
        extra: Map::new(),
    }
}

fn arguments_string(arguments: &Value) -> String {
    match arguments {
        Value::String(s) => s.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

fn assistant_with_calls(text: &str, calls: Vec<ToolCall>) -> ChatMessage {
    ChatMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then(|| MessageContent::Text(text.to_string())),
        name: None,
        tool_calls: Some(calls),
        tool_call_id: None,
        extra: Map::new(),
    }
}

/// Assembles streamed tool-call fragments, keyed by delta index, into whole
/// calls. Argument pieces concatenate in arrival order.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: std::collections::BTreeMap<u32, PartialCall>,
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, fragments: &[DeltaToolCall]) {
        for fragment in fragments {
            let entry = self.calls.entry(fragment.index).or_default();
            if let Some(id) = &fragment.id {
                entry.id = Some(id.clone());
            }
            if let Some(function) = &fragment.function {
                if let Some(name) = &function.name {
                    entry.name = Some(name.clone());
                }
                if let Some(arguments) = &function.arguments {
                    entry.arguments.push_str(arguments);
                }
            }
        }
    }

    fn into_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter_map(|partial| {
                let name = partial.name?;
                let arguments = if partial.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    partial.arguments
                };
                Some(ToolCall {
                    id: partial
                        .id
                        .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple())),
                    call_type: "function".to_string(),
                    function: crate::openai::FunctionCall {
                        name,
                        arguments: Value::String(arguments),
                    },
                })
            })
            .collect()
    }
}
