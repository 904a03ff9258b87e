//! MCP tool-execution subsystem: JSON-RPC transports, per-server sessions,
//! and the server fleet manager.
//!
//! A [`Transport`] frames JSON-RPC 2.0 over a stdio child process or HTTP
//! POSTs; an [`McpClient`] runs the initialize handshake and the
//! tools/resources/prompts RPCs over it; the [`ServerManager`] owns the fleet,
//! health probes, and metadata caching. The tool registry
//! ([`crate::tools::ToolRegistry`]) shares the clients read-only.

mod client;
mod http;
mod jsonrpc;
mod manager;
mod stdio;
mod transport;
mod uri;

pub use client::{
    McpClient, McpClientError, PromptDefinition, ResourceDefinition, ServerCapabilities,
    SessionState, ToolDefinition, ToolOutcome,
};
pub use http::HttpTransport;
pub use jsonrpc::{
    JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JSONRPC_VERSION,
};
pub use manager::{
    HealthState, ManagedServer, ManagerConfig, ServerHealth, ServerManager, ServerStats,
};
pub use stdio::{NotificationHandler, StdioTransport};
pub use transport::{Transport, TransportError, TransportKind};
pub use uri::{scan_text as scan_mcp_uris, McpUri, McpUriError};

/// MCP protocol revision advertised in the initialize handshake and on the
/// HTTP transport's `MCP-Protocol-Version` header.
pub const PROTOCOL_VERSION: &str = "2025-03-26";
