//! JSON error responses: `{"error":{"message":..., "type":...}}`.
//!
//! The mapping follows the gateway's error policy: backend-unreachable is
//! 503, backend-misbehaving 502, auth 401, rate limit 429 (+ Retry-After),
//! validation 400, everything unexpected 500. Guardrail and tool failures
//! never reach this type; they stay inside the conversation.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use heddle::{BackendError, McpClientError, ProxyError, TransportError};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "invalid or missing api key",
        )
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "rate limit exceeded",
        );
        err.retry_after = Some(retry_after_secs.max(1));
        err
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found_error", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "backend_error", message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "backend_unavailable",
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn from_backend(err: BackendError) -> Self {
        if err.is_unreachable() {
            Self::unavailable(err.to_string())
        } else {
            Self::bad_gateway(err.to_string())
        }
    }

    pub fn from_mcp(err: McpClientError) -> Self {
        match &err {
            McpClientError::Transport(TransportError::Timeout(_)) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "mcp_timeout", err.to_string())
            }
            McpClientError::NotReady { .. } => Self::unavailable(err.to_string()),
            _ => Self::new(StatusCode::BAD_GATEWAY, "mcp_error", err.to_string()),
        }
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Backend(e) => Self::from_backend(e),
            ProxyError::InvalidRequest(m) => Self::bad_request(m),
            other @ ProxyError::EmptyCompletion => Self::bad_gateway(other.to_string()),
            ProxyError::Internal(m) => Self::internal(m),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": self.kind,
            }
        }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
