//! `mcp://<server>/<resource-uri>` references.
//!
//! The chat proxy scans assistant text for these and injects the referenced
//! resource into the conversation before dispatching tools.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

const SCHEME: &str = "mcp://";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct McpUri {
    pub server: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum McpUriError {
    #[error("not an mcp:// uri: {0}")]
    Scheme(String),
    #[error("mcp uri has empty server: {0}")]
    EmptyServer(String),
    #[error("mcp uri has empty resource path: {0}")]
    EmptyResource(String),
}

impl FromStr for McpUri {
    type Err = McpUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| McpUriError::Scheme(s.to_string()))?;
        let (server, resource) = rest
            .split_once('/')
            .ok_or_else(|| McpUriError::EmptyResource(s.to_string()))?;
        if server.is_empty() {
            return Err(McpUriError::EmptyServer(s.to_string()));
        }
        if resource.is_empty() {
            return Err(McpUriError::EmptyResource(s.to_string()));
        }
        Ok(Self {
            server: server.to_string(),
            resource: resource.to_string(),
        })
    }
}

impl fmt::Display for McpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}/{}", self.server, self.resource)
    }
}

static URI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"mcp://[^\s"'<>)\]]+"#).expect("static regex"));

/// Extracts every parseable `mcp://` reference from free text, in order of
/// appearance, without de-duplicating (the caller decides per-round policy).
pub fn scan_text(text: &str) -> Vec<McpUri> {
    URI_PATTERN
        .find_iter(text)
        .filter_map(|m| m.as_str().trim_end_matches(['.', ',']).parse().ok())
        .collect()
}
