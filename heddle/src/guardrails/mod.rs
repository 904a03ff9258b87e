//! Pre- and post-dispatch checks around tool execution.
//!
//! Allow/deny globs (deny wins), round and call caps, the per-call timeout,
//! and result truncation. Every error message is phrased for the model; the
//! chat loop surfaces them verbatim inside the conversation rather than as
//! HTTP failures.

mod redact;

use std::time::Duration;

pub use redact::{redact, REDACTED};

/// Marker appended to truncated tool results.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Immutable guardrail settings; see [`Guardrails::new`].
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    /// Namespaced-name globs that may run; empty = everything not denied.
    pub allow_tools: Vec<String>,
    /// Namespaced-name globs that may never run; deny wins over allow.
    pub deny_tools: Vec<String>,
    pub max_rounds: u32,
    pub max_calls_per_round: usize,
    pub max_total_calls: usize,
    pub per_call_timeout: Duration,
    /// Byte cap on a single tool result; 0 disables truncation.
    pub max_result_bytes: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            allow_tools: Vec::new(),
            deny_tools: Vec::new(),
            max_rounds: 5,
            max_calls_per_round: 8,
            max_total_calls: 20,
            per_call_timeout: Duration::from_secs(30),
            max_result_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GuardrailError {
    #[error("tool {0} is denied by guardrail policy")]
    Denied(String),
    #[error("tool {0} is not on the guardrail allow list")]
    NotAllowed(String),
    #[error("maximum tool rounds ({0}) exceeded")]
    RoundsExceeded(u32),
    #[error("maximum tool calls per round ({0}) exceeded")]
    CallsPerRoundExceeded(usize),
    #[error("maximum total tool calls ({0}) exceeded")]
    TotalCallsExceeded(usize),
}

/// An invalid glob in the configuration; a startup error, not a model-facing one.
#[derive(Debug, thiserror::Error)]
#[error("invalid tool pattern {pattern:?}: {source}")]
pub struct GuardrailConfigError {
    pattern: String,
    #[source]
    source: glob::PatternError,
}

pub struct Guardrails {
    allow: Vec<glob::Pattern>,
    deny: Vec<glob::Pattern>,
    config: GuardrailConfig,
}

fn compile(patterns: &[String]) -> Result<Vec<glob::Pattern>, GuardrailConfigError> {
    patterns
        .iter()
        .map(|p| {
            glob::Pattern::new(p).map_err(|source| GuardrailConfigError {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

impl Guardrails {
    pub fn new(config: GuardrailConfig) -> Result<Self, GuardrailConfigError> {
        Ok(Self {
            allow: compile(&config.allow_tools)?,
            deny: compile(&config.deny_tools)?,
            config,
        })
    }

    /// Deny globs first; deny wins. When the allow list is empty, every
    /// non-denied name passes.
    pub fn validate(&self, namespaced: &str) -> Result<(), GuardrailError> {
        if self.deny.iter().any(|p| p.matches(namespaced)) {
            return Err(GuardrailError::Denied(namespaced.to_string()));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| p.matches(namespaced)) {
            return Err(GuardrailError::NotAllowed(namespaced.to_string()));
        }
        Ok(())
    }

    pub fn check_rounds(&self, round: u32) -> Result<(), GuardrailError> {
        if round >= self.config.max_rounds {
            return Err(GuardrailError::RoundsExceeded(self.config.max_rounds));
        }
        Ok(())
    }

    pub fn check_calls_per_round(&self, calls: usize) -> Result<(), GuardrailError> {
        if calls > self.config.max_calls_per_round {
            return Err(GuardrailError::CallsPerRoundExceeded(
                self.config.max_calls_per_round,
            ));
        }
        Ok(())
    }

    pub fn check_total(&self, total: usize) -> Result<(), GuardrailError> {
        if total >= self.config.max_total_calls {
            return Err(GuardrailError::TotalCallsExceeded(
                self.config.max_total_calls,
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.config.per_call_timeout
    }

    /// Caps a tool result at `max_result_bytes`. The cut backs off to the last
    /// newline within the final 10% of the window when one exists, and the
    /// truncation marker is appended.
    pub fn truncate(&self, s: &str) -> String {
        let cap = self.config.max_result_bytes;
        if cap == 0 || s.len() <= cap {
            return s.to_string();
        }
        let mut cut = cap;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let window_start = cap - cap / 10;
        if let Some(newline) = s[..cut].rfind('\n') {
            if newline >= window_start {
                cut = newline;
            }
        }
        format!("{}{TRUNCATION_MARKER}", &s[..cut])
    }
}
