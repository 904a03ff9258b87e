//! Typed gateway configuration parsed from the process environment.
//!
//! [`load_and_apply`](crate::load_and_apply) layers `.env` and XDG TOML into the
//! environment first; `GatewayConfig::from_env` then reads the `HEDDLE_*` keys.
//! Invalid values are startup errors; the binary reports them and exits 1.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::mcp_servers::{load_mcp_servers, McpServerConfig};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 11500;
pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:11434";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate mcp server name: {0}")]
    DuplicateServer(String),
    #[error("mcp server {server}: missing {field} for {transport} transport")]
    MissingField {
        server: String,
        field: &'static str,
        transport: String,
    },
    #[error("tls {role} file not readable: {path}")]
    Tls { role: &'static str, path: String },
}

/// Listen address and optional TLS material.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

/// Upstream model server (Ollama or any OpenAI-compatible endpoint).
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Max entries; 0 = unbounded.
    pub max_size: usize,
    /// Entry lifetime; zero = never expire.
    pub ttl: Duration,
}

/// Tool-dispatch guardrails consumed by the chat loop.
#[derive(Debug, Clone)]
pub struct GuardrailSettings {
    pub allow_tools: Vec<String>,
    pub deny_tools: Vec<String>,
    pub max_rounds: u32,
    pub max_calls_per_round: usize,
    pub max_total_calls: usize,
    pub per_call_timeout: Duration,
    pub max_result_bytes: usize,
}

impl Default for GuardrailSettings {
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

#[derive(Debug, Clone)]
pub struct McpConfig {
    pub enabled: bool,
    pub servers: Vec<McpServerConfig>,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub metadata_ttl: Duration,
    pub pool_idle_time: Duration,
    pub guardrails: GuardrailSettings,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub api_key: Option<String>,
    /// When true, `GET /v1/models` skips API-key auth (`/health` always does).
    pub models_auth_bypass: bool,
    /// Sustained requests per second per caller; 0 disables rate limiting.
    pub rate_limit_rps: f64,
    pub cache: CacheConfig,
    pub mcp: McpConfig,
    pub shutdown_timeout: Duration,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw,
            reason: e.to_string(),
        }),
    }
}

fn env_secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}

fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_opt(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value: raw,
                reason: "expected a boolean (true/false)".into(),
            }),
        },
    }
}

fn env_list(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

impl GatewayConfig {
    /// Reads the full gateway configuration from `HEDDLE_*` environment variables.
    ///
    /// `HEDDLE_BACKEND_URL` falls back to `OLLAMA_HOST` so a standard Ollama
    /// environment works without extra wiring. When `HEDDLE_MCP_SERVERS` points
    /// to an `mcp.json` file, the server definitions are loaded and validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerConfig {
            host: env_opt("HEDDLE_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: env_parse("HEDDLE_PORT", DEFAULT_PORT)?,
            tls_cert: env_opt("HEDDLE_TLS_CERT").map(PathBuf::from),
            tls_key: env_opt("HEDDLE_TLS_KEY").map(PathBuf::from),
        };
        if let Some(cert) = &server.tls_cert {
            if !cert.is_file() {
                return Err(ConfigError::Tls {
                    role: "cert",
                    path: cert.display().to_string(),
                });
            }
        }
        if let Some(key) = &server.tls_key {
            if !key.is_file() {
                return Err(ConfigError::Tls {
                    role: "key",
                    path: key.display().to_string(),
                });
            }
        }

        let backend = BackendConfig {
            url: env_opt("HEDDLE_BACKEND_URL")
                .or_else(|| env_opt("OLLAMA_HOST"))
                .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string()),
            timeout: env_secs("HEDDLE_BACKEND_TIMEOUT_SECS", Duration::from_secs(120))?,
        };

        let cache = CacheConfig {
            max_size: env_parse("HEDDLE_CACHE_MAX_SIZE", 100usize)?,
            ttl: env_secs("HEDDLE_CACHE_TTL_SECS", Duration::from_secs(300))?,
        };

        let guardrails = GuardrailSettings {
            allow_tools: env_list("HEDDLE_ALLOW_TOOLS"),
            deny_tools: env_list("HEDDLE_DENY_TOOLS"),
            max_rounds: env_parse("HEDDLE_MAX_TOOL_ROUNDS", 5u32)?,
            max_calls_per_round: env_parse("HEDDLE_MAX_CALLS_PER_ROUND", 8usize)?,
            max_total_calls: env_parse("HEDDLE_MAX_TOTAL_CALLS", 20usize)?,
            per_call_timeout: env_secs("HEDDLE_TOOL_TIMEOUT_SECS", Duration::from_secs(30))?,
            max_result_bytes: env_parse("HEDDLE_MAX_RESULT_BYTES", 64 * 1024usize)?,
        };

        let servers = match env_opt("HEDDLE_MCP_SERVERS") {
            Some(path) => load_mcp_servers(std::path::Path::new(&path))?,
            None => Vec::new(),
        };
        let mcp = McpConfig {
            enabled: env_bool("HEDDLE_MCP_ENABLED", !servers.is_empty())?,
            servers,
            health_interval: env_secs("HEDDLE_MCP_HEALTH_INTERVAL_SECS", Duration::from_secs(30))?,
            health_timeout: env_secs("HEDDLE_MCP_HEALTH_TIMEOUT_SECS", Duration::from_secs(5))?,
            metadata_ttl: env_secs("HEDDLE_MCP_METADATA_TTL_SECS", Duration::from_secs(300))?,
            pool_idle_time: env_secs("HEDDLE_MCP_POOL_IDLE_SECS", Duration::from_secs(300))?,
            guardrails,
        };

        Ok(Self {
            server,
            backend,
            api_key: env_opt("HEDDLE_API_KEY"),
            models_auth_bypass: env_bool("HEDDLE_MODELS_AUTH_BYPASS", false)?,
            rate_limit_rps: env_parse("HEDDLE_RATE_LIMIT_RPS", 0.0f64)?,
            cache,
            mcp,
            shutdown_timeout: env_secs("HEDDLE_SHUTDOWN_TIMEOUT_SECS", Duration::from_secs(10))?,
        })
    }
}
