//! Stdio MCP transport: a child process speaking newline-delimited JSON-RPC.
//!
//! One JSON object per line, UTF-8, LF-terminated. A single reader task
//! demultiplexes responses into the inflight map by id; notifications go to
//! the registered handler; child stderr is forwarded to the operator log.
//! Writes are serialized behind an async mutex. On read EOF or a write error
//! the transport transitions to closed and every inflight waiter fails with
//! [`TransportError::Closed`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::jsonrpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use super::transport::{Transport, TransportError, TransportKind};

/// Callback for server-initiated notifications (method, params).
pub type NotificationHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

type InflightMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>;

pub struct StdioTransport {
    writer: Mutex<Option<ChildStdin>>,
    inflight: InflightMap,
    next_id: AtomicU64,
    closed: CancellationToken,
    tracker: TaskTracker,
    child: StdMutex<Option<Child>>,
}

impl StdioTransport {
    /// Spawns the server process and starts the reader/stderr tasks.
    /// The process is killed when the transport is closed or dropped.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        on_notification: Option<NotificationHandler>,
    ) -> Result<Self, TransportError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Io(format!("spawn {command}: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("child stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Io("child stderr not captured".into()))?;

        let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(forward_stderr(stderr, command.to_string()));
        tracker.spawn(read_loop(
            stdout,
            Arc::clone(&inflight),
            closed.clone(),
            on_notification,
        ));
        tracker.close();

        Ok(Self {
            writer: Mutex::new(Some(stdin)),
            inflight,
            next_id: AtomicU64::new(0),
            closed,
            tracker,
            child: StdMutex::new(Some(child)),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        let io = |e: std::io::Error| TransportError::Io(format!("write to child: {e}"));
        stdin.write_all(line.as_bytes()).await.map_err(io)?;
        stdin.write_all(b"\n").await.map_err(io)?;
        stdin.flush().await.map_err(io)?;
        Ok(())
    }

    fn take_child(&self) -> Option<Child> {
        self.child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inflight.lock().await.insert(id, tx);

        let request = JsonRpcRequest::new(id, method, params);
        let line = match serde_json::to_string(&request) {
            Ok(s) => s,
            Err(e) => {
                self.inflight.lock().await.remove(&id);
                return Err(TransportError::Io(format!("encode request: {e}")));
            }
        };
        if let Err(e) = self.write_line(&line).await {
            self.inflight.lock().await.remove(&id);
            // A dead pipe takes the whole session with it.
            self.closed.cancel();
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(msg)) => match msg.error {
                Some(err) => Err(TransportError::JsonRpc {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                }),
                None => Ok(msg.result.unwrap_or(Value::Null)),
            },
            // Sender dropped: reader exited and drained the inflight map.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inflight.lock().await.remove(&id);
                Err(TransportError::Timeout(timeout))
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let notification = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notification)
            .map_err(|e| TransportError::Io(format!("encode notification: {e}")))?;
        self.write_line(&line).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        *self.writer.lock().await = None;
        let mut result = Ok(());
        if let Some(mut child) = self.take_child() {
            let _ = child.start_kill();
            if let Err(e) = child.wait().await {
                result = Err(TransportError::Io(format!("wait for child: {e}")));
            }
        }
        self.tracker.wait().await;
        result
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn pending(&self) -> usize {
        self.inflight.try_lock().map(|g| g.len()).unwrap_or(0)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop covers the child; waiters are freed when the reader exits.
        self.closed.cancel();
    }
}

/// Reads stdout lines until EOF or cancellation, routing responses to their
/// waiters and notifications to the handler. Frees every remaining waiter on
/// exit so no caller hangs past the session.
async fn read_loop(
    stdout: ChildStdout,
    inflight: InflightMap,
    closed: CancellationToken,
    on_notification: Option<NotificationHandler>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = lines.next_line() => next,
        };
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let msg: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed json-rpc line from mcp server");
                continue;
            }
        };
        if msg.is_response() {
            let Some(id) = msg.response_id() else {
                tracing::warn!("json-rpc response without usable id");
                continue;
            };
            match inflight.lock().await.remove(&id) {
                // The waiter may have timed out between our remove and its
                // drop; a failed send is harmless.
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => tracing::debug!(id, "json-rpc response with no waiter"),
            }
        } else if let Some(method) = msg.method.as_deref() {
            if msg.id.is_some() {
                // Server-initiated request; we advertise no client capabilities
                // it could target, so there is nothing useful to answer.
                tracing::debug!(method, "ignoring server-initiated request");
            } else if let Some(handler) = &on_notification {
                handler(method, msg.params.clone().unwrap_or(Value::Null));
            } else {
                tracing::trace!(method, "unhandled mcp notification");
            }
        }
    }
    closed.cancel();
    inflight.lock().await.clear();
}

async fn forward_stderr(stderr: ChildStderr, command: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::info!(target: "heddle::mcp::stdio", command = %command, "stderr: {line}");
    }
}
