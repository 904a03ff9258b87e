//! Builds the gateway from `GatewayConfig`: backend client, cache, guardrails,
//! MCP sessions, registry, proxy, and the shared [`AppState`].
//!
//! Construction happens once in `main` (or a test); components are shared by
//! reference from there; no globals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use config::{GatewayConfig, GuardrailSettings, McpServerConfig, McpTransportKind};
use heddle::guardrails::GuardrailConfigError;
use heddle::mcp::{ManagerConfig, Transport};
use heddle::{
    BackendClient, BackendError, ChatProxy, Guardrails, HttpTransport, McpClient, McpClientError,
    RegistryError, ResponseCache, ServerManager, StdioTransport, ToolRegistry, TransportError,
};

use crate::app::{AppState, Settings};
use crate::middleware::RateLimiter;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("backend client: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Guardrails(#[from] GuardrailConfigError),
    #[error("register tools for {server}: {source}")]
    Registry {
        server: String,
        #[source]
        source: RegistryError,
    },
}

fn guardrail_config(settings: &GuardrailSettings) -> heddle::GuardrailConfig {
    heddle::GuardrailConfig {
        allow_tools: settings.allow_tools.clone(),
        deny_tools: settings.deny_tools.clone(),
        max_rounds: settings.max_rounds,
        max_calls_per_round: settings.max_calls_per_round,
        max_total_calls: settings.max_total_calls,
        per_call_timeout: settings.per_call_timeout,
        max_result_bytes: settings.max_result_bytes,
    }
}

fn build_transport(
    server: &McpServerConfig,
) -> Result<Option<Arc<dyn Transport>>, TransportError> {
    match server.transport {
        McpTransportKind::Stdio => {
            // Validated at config load: stdio entries carry a command.
            let command = server.command.as_deref().unwrap_or_default();
            let transport = StdioTransport::spawn(command, &server.args, &server.env, None)?;
            Ok(Some(Arc::new(transport)))
        }
        McpTransportKind::Http => {
            let url = server.url.as_deref().unwrap_or_default();
            let transport = HttpTransport::new(url, server.headers.clone())?;
            Ok(Some(Arc::new(transport)))
        }
        McpTransportKind::Sse => {
            // Reserved in the config surface; declined at initialization.
            tracing::warn!(server = %server.name, "sse transport not supported yet, skipping");
            Ok(None)
        }
    }
}

async fn connect_server(server: &McpServerConfig) -> Result<Option<Arc<McpClient>>, McpClientError> {
    let transport = match build_transport(server) {
        Ok(Some(t)) => t,
        Ok(None) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let client = Arc::new(McpClient::new(&server.name, transport, server.timeout()));
    client.initialize().await?;
    Ok(Some(client))
}

/// Builds every component and connects the configured MCP servers. A server
/// that fails to start is logged and skipped; the gateway still serves chat;
/// a tool-name collision is a hard error (the config is wrong).
pub async fn build_gateway(cfg: &GatewayConfig) -> Result<AppState, BootstrapError> {
    if cfg.api_key.is_none() {
        tracing::warn!("HEDDLE_API_KEY is not set; the gateway is running without auth");
    }

    let backend = Arc::new(BackendClient::new(&cfg.backend.url, cfg.backend.timeout)?);
    let guardrails = Arc::new(Guardrails::new(guardrail_config(&cfg.mcp.guardrails))?);
    let cache = Arc::new(ResponseCache::new(cfg.cache.max_size, cfg.cache.ttl));
    cache.spawn_cleanup();

    let manager = Arc::new(ServerManager::new(ManagerConfig {
        health_interval: cfg.mcp.health_interval,
        health_timeout: cfg.mcp.health_timeout,
        metadata_ttl: cfg.mcp.metadata_ttl,
        pool_idle_time: cfg.mcp.pool_idle_time,
        drain_timeout: Duration::from_secs(5),
    }));
    let registry = Arc::new(ToolRegistry::new());

    if cfg.mcp.enabled {
        for server in &cfg.mcp.servers {
            if !server.enabled {
                tracing::debug!(server = %server.name, "mcp server disabled, skipping");
                continue;
            }
            match connect_server(server).await {
                Ok(Some(client)) => {
                    let count =
                        registry
                            .add_client(&client)
                            .map_err(|source| BootstrapError::Registry {
                                server: server.name.clone(),
                                source,
                            })?;
                    tracing::info!(
                        server = %server.name,
                        transport = %server.transport,
                        tools = count,
                        "mcp server connected"
                    );
                    manager.add(client).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(server = %server.name, error = %e, "mcp server failed to start, skipping");
                }
            }
        }
        manager.start_health_loop();
    }

    let proxy = Arc::new(ChatProxy::new(
        Arc::clone(&backend),
        Arc::clone(&manager),
        Arc::clone(&registry),
        Arc::clone(&guardrails),
        Arc::clone(&cache),
    ));

    Ok(AppState {
        proxy,
        backend,
        manager,
        registry,
        guardrails,
        cache,
        settings: Arc::new(Settings {
            api_key: cfg.api_key.clone(),
            models_auth_bypass: cfg.models_auth_bypass,
            backend_url: cfg.backend.url.clone(),
            shutdown_timeout: cfg.shutdown_timeout,
            health_probe_timeout: HEALTH_PROBE_TIMEOUT,
        }),
        limiter: Arc::new(RateLimiter::new(cfg.rate_limit_rps)),
        cancel: CancellationToken::new(),
    })
}
