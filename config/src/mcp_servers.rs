//! Parse MCP server definitions from an `mcp.json` file.
//!
//! Shape: `{"servers":[{"name":"fs","transport":"stdio","command":"npx",...}]}`.
//! Stdio servers need `command`; http/sse servers need `url`. Disabled entries
//! are kept here and skipped at bootstrap so introspection can still report them.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::gateway::ConfigError;

/// Transport selector for one MCP server entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    Stdio,
    Http,
    Sse,
}

impl std::fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => f.write_str("stdio"),
            Self::Http => f.write_str("http"),
            Self::Sse => f.write_str("sse"),
        }
    }
}

/// One MCP server definition from `mcp.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportKind,
    /// Executable for stdio servers.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint for http/sse servers.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Default per-RPC timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_enabled() -> bool {
    true
}

impl McpServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize)]
struct McpServersFile {
    #[serde(default)]
    servers: Vec<McpServerConfig>,
}

/// Loads and validates `mcp.json`. Rejects duplicate names and entries missing
/// the field their transport requires.
pub fn load_mcp_servers(path: &Path) -> Result<Vec<McpServerConfig>, ConfigError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: display.clone(),
        source,
    })?;
    let file: McpServersFile =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;

    let mut seen = std::collections::HashSet::new();
    for server in &file.servers {
        if !seen.insert(server.name.clone()) {
            return Err(ConfigError::DuplicateServer(server.name.clone()));
        }
        match server.transport {
            McpTransportKind::Stdio if server.command.is_none() => {
                return Err(ConfigError::MissingField {
                    server: server.name.clone(),
                    field: "command",
                    transport: server.transport.to_string(),
                });
            }
            McpTransportKind::Http | McpTransportKind::Sse if server.url.is_none() => {
                return Err(ConfigError::MissingField {
                    server: server.name.clone(),
                    field: "url",
                    transport: server.transport.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(file.servers)
}
