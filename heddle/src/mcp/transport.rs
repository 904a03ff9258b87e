//! Transport seam for MCP JSON-RPC sessions.
//!
//! Two implementations share one contract: [`StdioTransport`](super::StdioTransport)
//! (child process, newline-delimited JSON) and [`HttpTransport`](super::HttpTransport)
//! (one POST per request). The client never sees which one it holds.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Which wire a server session runs over. `Sse` is accepted in configuration
/// but declined at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Http => f.write_str("http"),
            Self::Sse => f.write_str("sse"),
        }
    }
}

/// Closed failure contract for `send_request`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// `close()` has run, or the peer hung up; pending waiters get this too.
    #[error("transport closed")]
    Closed,
    /// The caller's deadline elapsed; the inflight entry has been removed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Pipe or network failure.
    #[error("transport i/o: {0}")]
    Io(String),
    /// The peer returned a JSON-RPC error object.
    #[error("json-rpc error {code}: {message}")]
    JsonRpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl TransportError {
    /// Errors after which a session cannot continue on this transport.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }
}

/// One JSON-RPC session endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and waits up to `timeout` for the matching response,
    /// returning its `result`. A peer error object becomes
    /// [`TransportError::JsonRpc`].
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    /// Sends a notification; no reply is awaited.
    async fn send_notification(&self, method: &str, params: Value) -> Result<(), TransportError>;

    /// Closes the transport. Idempotent; pending waiters fail with `Closed`.
    async fn close(&self) -> Result<(), TransportError>;

    fn kind(&self) -> TransportKind;

    /// Requests currently awaiting replies (stdio sessions only).
    fn pending(&self) -> usize {
        0
    }
}
