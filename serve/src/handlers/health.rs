//! `/health`: backend connectivity probe with a short deadline, plus the
//! panic-recovery response used by the catch-panic layer.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::app::AppState;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    backend: &'static str,
    backend_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let backend_host = state.settings.backend_url.clone();
    match state
        .backend
        .health(state.settings.health_probe_timeout)
        .await
    {
        Ok(()) => Json(HealthBody {
            status: "healthy",
            backend: "ollama",
            backend_host,
            error: None,
        })
        .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody {
                status: "unhealthy",
                backend: "ollama",
                backend_host,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

/// Body for requests that panicked somewhere below the recovery layer. The
/// request id is already on the response via the outer middleware.
pub fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| err.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    tracing::error!(
        request_id = heddle::request_id::current().as_deref().unwrap_or("-"),
        "handler panicked: {detail}"
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {"message": "internal server error", "type": "internal_error"}
        })),
    )
        .into_response()
}
