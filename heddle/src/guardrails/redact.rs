//! Secret redaction for log output.
//!
//! Walks a JSON value: any key whose case-folded form contains a sensitive
//! word has its value replaced; string values that look like credentials are
//! replaced too. Idempotent: redacting twice changes nothing. Used for
//! logging only; the model and the wire see the real values.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

static SENSITIVE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)password|token|secret|key|authorization|credential|private")
        .expect("static regex")
});

// Heuristic credential shapes: api-key prefixes, bearer headers, JWTs, long hex.
static SENSITIVE_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)^\s*(
            sk-[A-Za-z0-9_-]{16,}
          | (?i:bearer)\s+\S+
          | eyJ[A-Za-z0-9_-]{8,}\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*
          | [0-9a-fA-F]{32,}
        )\s*$",
    )
    .expect("static regex")
});

/// Returns a copy of `value` with sensitive keys and credential-shaped
/// strings replaced by [`REDACTED`].
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if SENSITIVE_KEY.is_match(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        Value::String(s) if SENSITIVE_VALUE.is_match(s) => Value::String(REDACTED.to_string()),
        other => other.clone(),
    }
}
