//! Request middleware: request-id propagation, access logging, API-key auth,
//! and the token-bucket rate limiter.
//!
//! Layer order (outermost first): panic recovery, request-id, access log,
//! then per-route auth and rate limiting. `/health` is routed outside the
//! auth/rate-limit layers.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use subtle::ConstantTimeEq;

use crate::app::AppState;
use crate::error::ApiError;

/// Propagates `X-Request-ID` (minting a fresh id when absent), scopes the
/// handler under it, and echoes it on the response.
pub async fn request_id(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(heddle::request_id::HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut response = heddle::request_id::scope(id.clone(), next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        target: "heddle::serve::access",
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        request_id = heddle::request_id::current().as_deref().unwrap_or("-"),
        "request"
    );
    response
}

fn provided_key(request: &Request) -> Option<String> {
    if let Some(key) = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
    {
        return Some(key.to_string());
    }
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn keys_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// API-key auth with a constant-time compare. When no key is configured the
/// gateway runs open (a warning is logged at startup). `GET /v1/models` may
/// be configured to bypass.
pub async fn auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.settings.api_key.as_deref() else {
        return next.run(request).await;
    };
    if state.settings.models_auth_bypass
        && request.method() == Method::GET
        && request.uri().path() == "/v1/models"
    {
        return next.run(request).await;
    }
    match provided_key(&request) {
        Some(provided) if keys_match(&provided, expected) => next.run(request).await,
        _ => ApiError::unauthorized().into_response(),
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed per caller. Refill happens on the check;
/// burst capacity is twice the sustained rate.
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    burst: f64,
    refill_rate: f64,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            burst: (requests_per_second * 2.0).max(1.0),
            refill_rate: requests_per_second,
        }
    }

    pub fn enabled(&self) -> bool {
        self.refill_rate > 0.0
    }

    /// Takes one token for `key`, or reports how long until one is available.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        if !self.enabled() {
            return Ok(());
        }
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                tokens: self.burst,
                last_refill: now,
            });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let wait = (1.0 - bucket.tokens) / self.refill_rate;
            Err(Duration::from_secs_f64(wait))
        }
    }
}

/// Rate limit keyed by API key when one was sent, else by client IP.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.enabled() {
        return next.run(request).await;
    }
    let key = provided_key(&request).unwrap_or_else(|| addr.ip().to_string());
    match state.limiter.try_acquire(&key) {
        Ok(()) => next.run(request).await,
        Err(wait) => {
            tracing::debug!(key = %key, "rate limited");
            ApiError::rate_limited(wait.as_secs()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_allows_burst_then_blocks() {
        let limiter = RateLimiter::new(1.0); // burst 2
        assert!(limiter.try_acquire("k").is_ok());
        assert!(limiter.try_acquire("k").is_ok());
        let wait = limiter.try_acquire("k").unwrap_err();
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn limiter_keys_are_independent() {
        let limiter = RateLimiter::new(0.5); // burst 1
        assert!(limiter.try_acquire("a").is_ok());
        assert!(limiter.try_acquire("a").is_err());
        assert!(limiter.try_acquire("b").is_ok());
    }

    #[test]
    fn limiter_refills_over_time() {
        let limiter = RateLimiter::new(50.0);
        while limiter.try_acquire("k").is_ok() {}
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.try_acquire("k").is_ok());
    }

    #[test]
    fn zero_rps_disables_limiting() {
        let limiter = RateLimiter::new(0.0);
        assert!(!limiter.enabled());
        for _ in 0..100 {
            assert!(limiter.try_acquire("k").is_ok());
        }
    }

    #[test]
    fn key_compare_is_exact() {
        assert!(keys_match("secret", "secret"));
        assert!(!keys_match("secret", "secret2"));
        assert!(!keys_match("", "secret"));
    }
}
