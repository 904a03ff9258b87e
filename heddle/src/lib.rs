//! # Heddle
//!
//! Core of the Heddle gateway: an OpenAI-compatible chat proxy that fronts a
//! local model backend and extends it with an MCP tool layer. A client sends
//! a chat completion; the gateway forwards it to the backend, and when the
//! model emits tool calls, dispatches them against registered MCP servers,
//! feeds the results back, and loops until a final answer is produced.
//!
//! ## Main modules
//!
//! - [`mcp`]: JSON-RPC transports ([`StdioTransport`], [`HttpTransport`]),
//!   per-server sessions ([`McpClient`]), the fleet [`ServerManager`], and
//!   [`McpUri`] references.
//! - [`tools`]: the namespaced [`ToolRegistry`] (`mcp.<server>.<tool>`).
//! - [`guardrails`]: allow/deny globs, round/call caps, truncation,
//!   [`redact`] for log output.
//! - [`cache`]: the content-addressed [`ResponseCache`] and the request
//!   [`fingerprint`].
//! - [`openai`]: chat-completions wire DTOs, lossless for unknown fields.
//! - [`backend`]: the upstream model client ([`BackendClient`]).
//! - [`proxy`]: the tool-augmented loop ([`ChatProxy`]), blocking and
//!   streaming.
//! - [`request_id`]: task-local request correlation.
//!
//! The HTTP surface lives in the `serve` crate; configuration loading in
//! `config`. Components are constructed once at bootstrap and shared by
//! reference; there is no global registry.

pub mod backend;
pub mod cache;
pub mod guardrails;
pub mod mcp;
pub mod openai;
pub mod proxy;
pub mod request_id;
pub mod tools;

pub use backend::{BackendClient, BackendError};
pub use cache::{canonicalize, fingerprint, ResponseCache};
pub use guardrails::{redact, GuardrailConfig, GuardrailError, Guardrails, TRUNCATION_MARKER};
pub use mcp::{
    HealthState, HttpTransport, ManagedServer, ManagerConfig, McpClient, McpClientError, McpUri,
    ServerHealth, ServerManager, ServerStats, SessionState, StdioTransport, ToolDefinition,
    ToolOutcome, Transport, TransportError, TransportKind,
};
pub use openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ToolCall,
};
pub use proxy::{ChatOutcome, ChatProxy, ProxyError};
pub use tools::{namespaced_name, RegisteredTool, RegistryError, ToolRegistry};
