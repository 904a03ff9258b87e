//! Client for the upstream model server (Ollama or anything speaking the
//! OpenAI chat-completions wire).
//!
//! Blocking chat, streaming chat over SSE, the model list, and a
//! short-deadline health probe. Connect-class failures map to 503 at the HTTP
//! surface, upstream-status failures to 502.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::openai::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};

/// How much upstream error body to carry into our own error text.
const ERROR_BODY_LIMIT: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unreachable: {0}")]
    Connect(String),
    #[error("backend request timed out")]
    Timeout,
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("decode backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// True when the backend never produced a response (503 territory);
    /// false when it answered badly (502 territory).
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout)
    }
}

fn request_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Connect(e.to_string())
    }
}

pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BackendError::Connect(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            body.truncate(ERROR_BODY_LIMIT);
        }
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// One blocking chat completion.
    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, BackendError> {
        let response = self
            .http
            .post(self.url("/v1/chat/completions"))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await
            .map_err(request_error)?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Streaming chat completion: the SSE `data:` payloads parsed into chunks.
    /// The stream ends at `data: [DONE]` or upstream EOF; dropping the
    /// receiver aborts the transfer. No overall timeout is applied; streams
    /// legitimately outlive `request_timeout`.
    pub async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ReceiverStream<Result<ChatCompletionChunk, BackendError>>, BackendError> {
        let response = self
            .http
            .post(self.url("/v1/chat/completions"))
            .json(request)
            .send()
            .await
            .map_err(request_error)?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut frames = SseFramer::default();
            let mut bytes = response.bytes_stream();
            while let Some(item) = bytes.next().await {
                let data_lines = match item {
                    Ok(buf) => frames.push(&buf),
                    Err(e) => {
                        let _ = tx.send(Err(request_error(e))).await;
                        return;
                    }
                };
                for data in data_lines {
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<ChatCompletionChunk>(&data) {
                        Ok(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return; // receiver gone, stop reading
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(BackendError::Decode(e.to_string()))).await;
                            return;
                        }
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Proxies `GET /v1/models` verbatim.
    pub async fn list_models(&self) -> Result<Value, BackendError> {
        let response = self
            .http
            .get(self.url("/v1/models"))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(request_error)?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    /// Connectivity probe with its own short deadline.
    pub async fn health(&self, deadline: Duration) -> Result<(), BackendError> {
        let response = self
            .http
            .get(self.url("/v1/models"))
            .timeout(deadline)
            .send()
            .await
            .map_err(request_error)?;
        Self::check_status(response).await.map(|_| ())
    }
}

/// Accumulates raw SSE bytes and yields complete `data:` payloads.
#[derive(Default)]
struct SseFramer {
    buffer: String,
}

impl SseFramer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framer_splits_complete_lines() {
        let mut f = SseFramer::default();
        let out = f.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n");
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[test]
    fn framer_buffers_partial_lines_across_pushes() {
        let mut f = SseFramer::default();
        assert!(f.push(b"data: {\"a\"").is_empty());
        let out = f.push(b":1}\n");
        assert_eq!(out, vec![r#"{"a":1}"#]);
    }

    #[test]
    fn framer_handles_crlf_and_done() {
        let mut f = SseFramer::default();
        let out = f.push(b"data: {\"x\":1}\r\ndata: [DONE]\r\n");
        assert_eq!(out, vec![r#"{"x":1}"#, "[DONE]"]);
    }

    #[test]
    fn framer_ignores_comments_and_blank_lines() {
        let mut f = SseFramer::default();
        let out = f.push(b": keep-alive\n\ndata: {\"y\":2}\n");
        assert_eq!(out, vec![r#"{"y":2}"#]);
    }

    #[tokio::test]
    async fn connect_error_is_unreachable() {
        // Nothing listens on port 9; reqwest fails at connect.
        let client = BackendClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = client.list_models().await.unwrap_err();
        assert!(err.is_unreachable(), "got: {err}");
    }

    #[test]
    fn status_errors_are_not_unreachable() {
        let err = BackendError::Status {
            status: 500,
            body: "boom".into(),
        };
        assert!(!err.is_unreachable());
        assert!(err.to_string().contains("500"));
    }
}
