//! MCP introspection endpoints: server listing, health, stats, metadata,
//! resource reads, prompt execution, direct tool execution, and refresh.
//! All auth-gated like the rest of the API surface.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use heddle::tools::namespaced_name;
use heddle::ManagedServer;

use crate::app::AppState;
use crate::error::ApiError;

async fn managed(state: &AppState, name: &str) -> Result<std::sync::Arc<ManagedServer>, ApiError> {
    state
        .manager
        .get(name)
        .await
        .ok_or_else(|| ApiError::not_found(format!("unknown mcp server: {name}")))
}

fn summary(name: &str, server: &ManagedServer, tools: usize) -> Value {
    json!({
        "name": name,
        "transport": server.kind(),
        "session": server.client().state(),
        "health": server.health().state,
        "tools": tools,
    })
}

pub async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    let mut servers = Vec::new();
    for (name, server) in state.manager.list().await {
        let tools = server.client().cached_tools().len();
        servers.push(summary(&name, &server, tools));
    }
    Json(json!({ "servers": servers }))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    let client = server.client();
    Ok(Json(json!({
        "name": name,
        "transport": server.kind(),
        "session": client.state(),
        "protocol_version": client.protocol_version(),
        "capabilities": client.capabilities(),
        "health": server.health(),
        "stats": server.stats(),
        "tools": client.cached_tools().iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
    })))
}

pub async fn server_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    Ok(Json(serde_json::to_value(server.health()).unwrap_or_default()))
}

pub async fn server_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    Ok(Json(serde_json::to_value(server.stats()).unwrap_or_default()))
}

pub async fn server_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    managed(&state, &name).await?;
    let tools = state.manager.tools(&name).await.map_err(ApiError::from_mcp)?;
    Ok(Json(json!({ "tools": tools })))
}

pub async fn server_resources(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    let resources = server
        .client()
        .list_resources()
        .await
        .map_err(ApiError::from_mcp)?;
    Ok(Json(json!({ "resources": resources })))
}

pub async fn read_resource(
    State(state): State<AppState>,
    Path((name, uri)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    let content = server
        .client()
        .read_resource(&uri)
        .await
        .map_err(ApiError::from_mcp)?;
    Ok(Json(json!({ "uri": uri, "content": content })))
}

pub async fn server_prompts(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    let prompts = server
        .client()
        .list_prompts()
        .await
        .map_err(ApiError::from_mcp)?;
    Ok(Json(json!({ "prompts": prompts })))
}

pub async fn run_prompt(
    State(state): State<AppState>,
    Path((name, prompt)): Path<(String, String)>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let server = managed(&state, &name).await?;
    // Body is the prompt's argument object; an empty body means no arguments.
    let arguments = if body.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(&body)
            .map_err(|e| ApiError::bad_request(format!("prompt arguments: {e}")))?
    };
    let rendered = server
        .client()
        .get_prompt(&prompt, arguments)
        .await
        .map_err(ApiError::from_mcp)?;
    Ok(Json(rendered))
}

pub async fn refresh_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    managed(&state, &name).await?;
    let tools = state.manager.refresh(&name).await.map_err(ApiError::from_mcp)?;
    Ok(Json(json!({ "refreshed": true, "tools": tools })))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Direct tool execution, through the same guardrail path as the chat loop:
/// validate, per-call timeout, result truncation.
pub async fn execute_tool(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    let namespaced = namespaced_name(&request.server, &request.tool);
    if let Err(g) = state.guardrails.validate(&namespaced) {
        return Err(ApiError::bad_request(g.to_string()));
    }
    let server = managed(&state, &request.server).await?;
    let arguments = match request.arguments {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let outcome = server
        .client()
        .call_tool(&request.tool, arguments, state.guardrails.timeout())
        .await
        .map_err(ApiError::from_mcp)?;
    state
        .manager
        .record_call(&request.server, !outcome.is_error)
        .await;
    Ok(Json(json!({
        "content": state.guardrails.truncate(&outcome.content),
        "is_error": outcome.is_error,
    })))
}
