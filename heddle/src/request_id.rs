//! Task-local request id for correlation.
//!
//! The HTTP surface sets it from `X-Request-ID` (minting one when absent);
//! access logs and the HTTP MCP transport read it from wherever they run
//! inside the request's task tree.

use std::future::Future;

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Wire header used on both the inbound API and outbound MCP HTTP requests.
pub const HEADER: &str = "x-request-id";

/// Runs `f` with `id` as the ambient request id.
pub async fn scope<F: Future>(id: String, f: F) -> F::Output {
    REQUEST_ID.scope(id, f).await
}

/// The ambient request id, when running inside [`scope`].
pub fn current() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_inside_and_outside_scope() {
        assert_eq!(current(), None);
        let seen = scope("req-1".to_string(), async { current() }).await;
        assert_eq!(seen.as_deref(), Some("req-1"));
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn nested_scopes_shadow() {
        let inner = scope("outer".to_string(), async {
            scope("inner".to_string(), async { current() }).await
        })
        .await;
        assert_eq!(inner.as_deref(), Some("inner"));
    }
}
