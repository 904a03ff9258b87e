//! Fleet of MCP clients: registration, health probes, metadata TTL, shutdown.
//!
//! The manager owns session lifecycles; the tool registry shares the clients
//! read-only. The health loop is a single task owned here, cancelled through
//! the manager's stop token. Never hold the servers lock across a probe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::client::{McpClient, McpClientError, ToolDefinition};
use super::transport::TransportKind;

/// How many consecutive probe failures flip a server to unreachable.
const UNREACHABLE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub state: HealthState,
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for ServerHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Unknown,
            last_checked: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ServerStats {
    pub calls: u64,
    pub errors: u64,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsInner {
    calls: u64,
    errors: u64,
    last_used: Option<DateTime<Utc>>,
    last_used_instant: Option<Instant>,
}

pub struct ManagedServer {
    client: Arc<McpClient>,
    kind: TransportKind,
    health: Mutex<ServerHealth>,
    stats: Mutex<StatsInner>,
    metadata_refreshed: Mutex<Option<Instant>>,
}

impl ManagedServer {
    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn health(&self) -> ServerHealth {
        self.health.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> ServerStats {
        let inner = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        ServerStats {
            calls: inner.calls,
            errors: inner.errors,
            last_used: inner.last_used,
        }
    }

    /// Time since the last tool call through this server, if any.
    pub fn idle_for(&self) -> Option<Duration> {
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_used_instant
            .map(|t| t.elapsed())
    }

    fn probe_succeeded(&self) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.state = HealthState::Healthy;
        health.last_checked = Some(Utc::now());
        health.last_error = None;
        health.consecutive_failures = 0;
    }

    fn probe_failed(&self, error: String) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        health.consecutive_failures += 1;
        health.state = if health.consecutive_failures >= UNREACHABLE_THRESHOLD {
            HealthState::Unreachable
        } else {
            HealthState::Degraded
        };
        health.last_checked = Some(Utc::now());
        health.last_error = Some(error);
    }

    fn note_metadata_refreshed(&self) {
        *self
            .metadata_refreshed
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn metadata_stale(&self, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        self.metadata_refreshed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|t| t.elapsed() > ttl)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub metadata_ttl: Duration,
    pub pool_idle_time: Duration,
    pub drain_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            metadata_ttl: Duration::from_secs(300),
            pool_idle_time: Duration::from_secs(300),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

pub struct ServerManager {
    servers: tokio::sync::RwLock<HashMap<String, Arc<ManagedServer>>>,
    config: ManagerConfig,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl ServerManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            servers: tokio::sync::RwLock::new(HashMap::new()),
            config,
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Registers an initialized client. Health starts unknown; the next probe
    /// or tool call moves it.
    pub async fn add(&self, client: Arc<McpClient>) {
        let name = client.name().to_string();
        let managed = Arc::new(ManagedServer {
            kind: client.kind(),
            client,
            health: Mutex::new(ServerHealth::default()),
            stats: Mutex::new(StatsInner::default()),
            metadata_refreshed: Mutex::new(Some(Instant::now())),
        });
        self.servers.write().await.insert(name, managed);
    }

    /// Deregisters a server; its session is drained and closed in the background.
    pub async fn remove(&self, name: &str) -> bool {
        let Some(managed) = self.servers.write().await.remove(name) else {
            return false;
        };
        let drain = self.config.drain_timeout;
        self.tracker.spawn(async move {
            if let Err(e) = managed.client.close(drain).await {
                tracing::warn!(server = %managed.client.name(), error = %e, "close after remove");
            }
        });
        true
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.servers.read().await.get(name).cloned()
    }

    /// Snapshot of all servers, sorted by name.
    pub async fn list(&self) -> Vec<(String, Arc<ManagedServer>)> {
        let mut entries: Vec<_> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Records one tool call against a server's stats.
    pub async fn record_call(&self, name: &str, ok: bool) {
        if let Some(managed) = self.get(name).await {
            let mut stats = managed.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.calls += 1;
            if !ok {
                stats.errors += 1;
            }
            stats.last_used = Some(Utc::now());
            stats.last_used_instant = Some(Instant::now());
        }
    }

    /// Returns the server's tool list, refreshing the cached metadata when the
    /// TTL has lapsed.
    pub async fn tools(&self, name: &str) -> Result<Vec<ToolDefinition>, McpClientError> {
        let managed = self.get(name).await.ok_or_else(|| McpClientError::NotReady {
            server: name.to_string(),
            state: "unregistered",
        })?;
        if managed.metadata_stale(self.config.metadata_ttl) {
            managed.client.refresh_metadata().await?;
            managed.note_metadata_refreshed();
        }
        Ok(managed.client.cached_tools())
    }

    /// Invalidates and synchronously re-fetches a server's metadata.
    pub async fn refresh(&self, name: &str) -> Result<usize, McpClientError> {
        let managed = self.get(name).await.ok_or_else(|| McpClientError::NotReady {
            server: name.to_string(),
            state: "unregistered",
        })?;
        managed.client.refresh_metadata().await?;
        managed.note_metadata_refreshed();
        Ok(managed.client.cached_tools().len())
    }

    /// Starts the periodic health loop. Probes are cheap `tools/list` calls
    /// with their own timeout; three consecutive failures mark a server
    /// unreachable, one success resets it.
    pub fn start_health_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.tracker.spawn(async move {
            let mut tick = tokio::time::interval(manager.config.health_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = manager.stop.cancelled() => break,
                    _ = tick.tick() => {}
                }
                manager.probe_all().await;
            }
        });
    }

    async fn probe_all(&self) {
        for (name, managed) in self.list().await {
            let probe = tokio::time::timeout(
                self.config.health_timeout,
                managed.client.list_tools(),
            )
            .await;
            match probe {
                Ok(Ok(_)) => {
                    managed.probe_succeeded();
                    managed.note_metadata_refreshed();
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %name, error = %e, "mcp health probe failed");
                    managed.probe_failed(e.to_string());
                }
                Err(_) => {
                    tracing::warn!(server = %name, "mcp health probe timed out");
                    managed.probe_failed(format!(
                        "probe timed out after {:?}",
                        self.config.health_timeout
                    ));
                }
            }
        }
    }

    /// Stops the health loop and closes every client. Individual close errors
    /// are logged; the first one is returned.
    pub async fn shutdown(&self) -> Result<(), McpClientError> {
        self.stop.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let servers: Vec<_> = self.servers.write().await.drain().collect();
        let mut first_error = None;
        for (name, managed) in servers {
            if let Err(e) = managed.client.close(self.config.drain_timeout).await {
                tracing::warn!(server = %name, error = %e, "mcp client close failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
