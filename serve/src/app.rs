//! Axum app: shared state and the router with its middleware stack.

use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;

use heddle::{BackendClient, ChatProxy, Guardrails, ResponseCache, ServerManager, ToolRegistry};

use crate::handlers;
use crate::middleware::{self, RateLimiter};

/// Settings the HTTP surface needs at request time.
pub struct Settings {
    pub api_key: Option<String>,
    pub models_auth_bypass: bool,
    /// Echoed in the health body so operators can see what is being probed.
    pub backend_url: String,
    pub shutdown_timeout: Duration,
    pub health_probe_timeout: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub proxy: Arc<ChatProxy>,
    pub backend: Arc<BackendClient>,
    pub manager: Arc<ServerManager>,
    pub registry: Arc<ToolRegistry>,
    pub guardrails: Arc<Guardrails>,
    pub cache: Arc<ResponseCache>,
    pub settings: Arc<Settings>,
    pub limiter: Arc<RateLimiter>,
    /// Root token for in-flight request contexts; cancelled at shutdown.
    pub cancel: CancellationToken,
}

impl AppState {
    /// Asks the serve loop to stop accepting and begin shutdown.
    pub fn trigger_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stops background work: cache cleanup, health loop, MCP sessions.
    pub async fn shutdown_components(&self) {
        self.cache.shutdown().await;
        if let Err(e) = self.manager.shutdown().await {
            tracing::warn!(error = %e, "mcp shutdown reported an error");
        }
    }
}

pub fn router(state: AppState) -> Router<()> {
    // Auth-gated API routes; /health is added after the route layers so it
    // bypasses auth and rate limiting.
    Router::new()
        .route("/v1/chat/completions", post(handlers::chat::chat_completions))
        .route("/v1/models", get(handlers::chat::list_models))
        .route("/v1/mcp/servers", get(handlers::mcp::list_servers))
        .route("/v1/mcp/servers/:name", get(handlers::mcp::get_server))
        .route(
            "/v1/mcp/servers/:name/health",
            get(handlers::mcp::server_health),
        )
        .route(
            "/v1/mcp/servers/:name/stats",
            get(handlers::mcp::server_stats),
        )
        .route(
            "/v1/mcp/servers/:name/tools",
            get(handlers::mcp::server_tools),
        )
        .route(
            "/v1/mcp/servers/:name/resources",
            get(handlers::mcp::server_resources),
        )
        .route(
            "/v1/mcp/servers/:name/resources/*uri",
            get(handlers::mcp::read_resource),
        )
        .route(
            "/v1/mcp/servers/:name/prompts",
            get(handlers::mcp::server_prompts),
        )
        .route(
            "/v1/mcp/servers/:name/prompts/:prompt",
            post(handlers::mcp::run_prompt),
        )
        .route(
            "/v1/mcp/servers/:name/refresh",
            post(handlers::mcp::refresh_server),
        )
        .route("/v1/mcp/execute", post(handlers::mcp::execute_tool))
        .route_layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .route_layer(from_fn_with_state(state.clone(), middleware::auth))
        .route("/health", get(handlers::health::health))
        .layer(from_fn(middleware::access_log))
        .layer(from_fn(middleware::request_id))
        .layer(CatchPanicLayer::custom(handlers::health::panic_response))
        .with_state(state)
}
