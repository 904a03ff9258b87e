//! HTTP server for the Heddle gateway (axum).
//!
//! Serves the OpenAI-compatible chat/model endpoints, `/health`, and the MCP
//! introspection API, behind panic recovery, request-id, access-log, auth,
//! and rate-limit middleware.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`], [`build_gateway`],
//! [`AppState`].

mod app;
mod bootstrap;
mod error;
mod handlers;
mod middleware;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

pub use app::{AppState, Settings};
pub use bootstrap::{build_gateway, BootstrapError};
pub use error::ApiError;
pub use middleware::RateLimiter;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error("serve: {0}")]
    Serve(std::io::Error),
}

/// Builds the gateway from config, binds, and serves until a shutdown signal.
/// Bind failures (port already in use) surface here so the binary can exit 1.
pub async fn run_serve(cfg: config::GatewayConfig) -> Result<(), ServeError> {
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = TcpListener::bind(&addr).await.map_err(|source| ServeError::Bind {
        addr: addr.clone(),
        source,
    })?;
    let state = bootstrap::build_gateway(&cfg).await?;
    run_serve_on_listener(listener, state).await
}

/// Serves on an existing listener. Used by tests (bind to 127.0.0.1:0, then
/// pass the listener in together with a prebuilt state).
pub async fn run_serve_on_listener(
    listener: TcpListener,
    state: AppState,
) -> Result<(), ServeError> {
    let addr = listener.local_addr().map_err(ServeError::Serve)?;
    info!("heddle gateway listening on http://{addr}");

    let app = app::router(state.clone());
    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_state))
    .await
    .map_err(ServeError::Serve)?;

    // Listener is closed and in-flight requests are done or cancelled; stop
    // background work within the configured bound.
    let timeout = state.settings.shutdown_timeout;
    if tokio::time::timeout(timeout, state.shutdown_components())
        .await
        .is_err()
    {
        tracing::warn!("component shutdown exceeded {timeout:?}");
    }
    info!("heddle gateway stopped");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM or a programmatic [`AppState::trigger_shutdown`],
/// then cancels every in-flight request context.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = state.cancel.cancelled() => {}
    }
    info!("shutdown requested");
    state.cancel.cancel();
}
