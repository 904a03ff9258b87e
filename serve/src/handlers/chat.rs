//! `/v1/chat/completions` (blocking and SSE streaming) and `/v1/models`.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};

use heddle::ChatCompletionRequest;

use crate::app::AppState;
use crate::error::ApiError;

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::bad_request("model is required"));
    }
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    if request.stream {
        // Per-request child of the root token: client disconnects drop the
        // stream (and with it the loop); shutdown cancels all of them.
        let cancel = state.cancel.child_token();
        let chunks = state.proxy.completion_stream(request, cancel).await?;
        let events = chunks
            .map(|item| match item {
                Ok(chunk) => match serde_json::to_string(&chunk) {
                    Ok(data) => Event::default().data(data),
                    Err(e) => error_event(&format!("encode chunk: {e}")),
                },
                // Mid-stream failures become a terminal error event; the
                // connection still closes cleanly with [DONE].
                Err(e) => error_event(&ApiError::from(e).message),
            })
            .chain(stream::once(async { Event::default().data("[DONE]") }))
            .map(Ok::<_, Infallible>);
        return Ok(Sse::new(events).into_response());
    }

    let outcome = state.proxy.completion(request).await?;
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-heddle-cache", if outcome.cached { "hit" } else { "miss" })
        .body(Body::from(outcome.body.as_str().to_owned()))
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(response)
}

fn error_event(message: &str) -> Event {
    Event::default().data(
        json!({"error": {"message": message, "type": "stream_error"}}).to_string(),
    )
}

pub async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state
        .backend
        .list_models()
        .await
        .map(Json)
        .map_err(ApiError::from_backend)
}
