//! Downstream pool supervision
//!
//! The [`ClientManager`] owns every [`DownstreamClient`] and is the only
//! place the pool map is mutated. Startup gives each configured server a few
//! attempts on a fixed backoff ladder; a crash after startup schedules
//! reconnection on an exponential ladder. Every pool mutation bumps a
//! generation counter so the aggregator can tell a stale catalog from a
//! fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;

use crate::config::ServerConfig;
use crate::mcp::downstream::{ClientState, DeathNotice, DownstreamClient, DownstreamError};
use crate::mcp::types::RawTool;

/// Fan-out ceiling for pool-wide tool queries.
const MAX_PARALLEL_QUERIES: usize = 10;

/// Per-downstream deadline inside a pool-wide tool query.
const POOL_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Supervision timing knobs. The defaults are the production schedule; tests
/// shrink them so crash scenarios run in milliseconds.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Delay before each startup retry; its length bounds the retry count.
    pub startup_backoff: Vec<Duration>,
    /// Delay before the first reconnect attempt after a crash.
    pub reconnect_initial: Duration,
    /// Base for the exponential reconnect ladder (attempts after the first).
    pub reconnect_base: Duration,
    /// Ceiling on any single reconnect delay.
    pub reconnect_cap: Duration,
    /// Total reconnect attempts before giving up on a server.
    pub reconnect_attempts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            startup_backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
            reconnect_initial: Duration::from_secs(5),
            reconnect_base: Duration::from_secs(30),
            reconnect_cap: Duration::from_secs(480),
            reconnect_attempts: 5,
        }
    }
}

impl SupervisorSettings {
    /// Delay before reconnect attempt `n` (1-based): the initial delay for
    /// the first attempt, then `base * 2^(n-1)` capped.
    fn reconnect_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.reconnect_initial;
        }
        let exp = (attempt - 1).min(30);
        let candidate = self.reconnect_base.saturating_mul(2u32.saturating_pow(exp));
        candidate.min(self.reconnect_cap)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("No downstream server named '{0}'")]
    ClientNotFound(String),

    #[error(transparent)]
    Downstream(#[from] DownstreamError),
}

/// Static description of one pool member, as reported by `get_client_info`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientInfoEntry {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    #[serde(rename = "type")]
    pub server_type: String,
    pub tags: Vec<String>,
    pub alive: bool,
}

/// Supervises the pool of downstream clients.
pub struct ClientManager {
    clients: Arc<RwLock<HashMap<String, Arc<DownstreamClient>>>>,
    configs: HashMap<String, ServerConfig>,
    settings: SupervisorSettings,
    generation: Arc<AtomicU64>,
    death_tx: mpsc::Sender<DeathNotice>,
}

impl ClientManager {
    /// Create the manager and spawn its death-watch task. Downstreams are
    /// not started yet; call [`start_all`](Self::start_all).
    pub fn new(configs: Vec<ServerConfig>, settings: SupervisorSettings) -> Arc<Self> {
        let (death_tx, death_rx) = mpsc::channel(64);

        let manager = Arc::new(Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            configs: configs.into_iter().map(|c| (c.name.clone(), c)).collect(),
            settings,
            generation: Arc::new(AtomicU64::new(0)),
            death_tx,
        });

        tokio::spawn(Self::death_watch(Arc::downgrade(&manager), death_rx));
        manager
    }

    /// Start every configured downstream, each on its own retry ladder.
    /// Individual failures are logged and skipped; an empty pool is fine.
    pub async fn start_all(self: Arc<Self>) {
        let mut tasks = JoinSet::new();
        for config in self.configs.values().cloned() {
            let manager = self.clone();
            tasks.spawn(async move {
                manager.start_with_retries(config).await;
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    async fn start_with_retries(self: Arc<Self>, config: ServerConfig) {
        let name = config.name.clone();
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            match DownstreamClient::start(config.clone(), self.death_tx.clone()).await {
                Ok(client) => {
                    tracing::info!(server = %name, attempt, "downstream started");
                    self.insert_client(Arc::new(client)).await;
                    return;
                }
                Err(e) => {
                    let Some(delay) = self.settings.startup_backoff.get(attempt - 1) else {
                        tracing::error!(
                            server = %name,
                            attempts = attempt,
                            error = %e,
                            "giving up on downstream"
                        );
                        return;
                    };
                    tracing::warn!(
                        server = %name,
                        attempt,
                        error = %e,
                        retry_in = ?delay,
                        "downstream start failed"
                    );
                    tokio::time::sleep(*delay).await;
                }
            }
        }
    }

    async fn insert_client(&self, client: Arc<DownstreamClient>) {
        self.clients
            .write()
            .await
            .insert(client.name().to_string(), client);
        self.bump_generation();
    }

    async fn death_watch(
        manager: std::sync::Weak<Self>,
        mut death_rx: mpsc::Receiver<DeathNotice>,
    ) {
        while let Some(notice) = death_rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                return;
            };

            let removed = manager.clients.write().await.remove(&notice.server);
            if removed.is_none() {
                // Startup-ladder failures report here too; the retry loop
                // already owns those.
                tracing::debug!(server = %notice.server, "death notice for unpooled server");
                continue;
            }
            manager.bump_generation();

            if notice.graceful {
                tracing::info!(server = %notice.server, "downstream exited cleanly");
                continue;
            }

            tracing::warn!(server = %notice.server, "downstream crashed, scheduling reconnect");
            let Some(config) = manager.configs.get(&notice.server).cloned() else {
                continue;
            };
            let reconnecting = manager.clone();
            tokio::spawn(async move {
                reconnecting.reconnect_loop(config).await;
            });
        }
    }

    async fn reconnect_loop(self: Arc<Self>, config: ServerConfig) {
        let name = config.name.clone();

        for attempt in 1..=self.settings.reconnect_attempts {
            let delay = self.settings.reconnect_delay(attempt);
            tokio::time::sleep(delay).await;

            // Someone else may have brought the server back in the meantime.
            if self.clients.read().await.contains_key(&name) {
                tracing::debug!(server = %name, "already reconnected, dropping attempt");
                return;
            }

            match DownstreamClient::start(config.clone(), self.death_tx.clone()).await {
                Ok(client) => {
                    tracing::info!(server = %name, attempt, "downstream reconnected");
                    self.insert_client(Arc::new(client)).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(server = %name, attempt, error = %e, "reconnect failed");
                }
            }
        }

        tracing::error!(
            server = %name,
            attempts = self.settings.reconnect_attempts,
            "reconnect attempts exhausted"
        );
    }

    /// Query every live downstream for its tools, bounded fan-out. A dead or
    /// slow downstream contributes an empty list instead of blocking the
    /// aggregate.
    pub async fn list_all_tools(&self) -> HashMap<String, Vec<RawTool>> {
        let snapshot: Vec<Arc<DownstreamClient>> =
            self.clients.read().await.values().cloned().collect();

        let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_QUERIES));
        let mut tasks = JoinSet::new();

        for client in snapshot {
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let name = client.name().to_string();

                if client.state().await != ClientState::Ready {
                    tracing::debug!(server = %name, "skipping non-ready downstream");
                    return (name, Vec::new());
                }

                match tokio::time::timeout(POOL_QUERY_TIMEOUT, client.list_tools()).await {
                    Ok(Ok(tools)) => (name, tools),
                    Ok(Err(e)) => {
                        tracing::warn!(server = %name, error = %e, "tool query failed");
                        (name, Vec::new())
                    }
                    Err(_) => {
                        tracing::warn!(server = %name, "tool query timed out");
                        (name, Vec::new())
                    }
                }
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((name, tools)) = joined {
                results.insert(name, tools);
            }
        }
        results
    }

    /// Route a tool call to a named downstream.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, ManagerError> {
        let client = self
            .clients
            .read()
            .await
            .get(server_name)
            .cloned()
            .ok_or_else(|| ManagerError::ClientNotFound(server_name.to_string()))?;

        Ok(client.call_tool(tool_name, arguments).await?)
    }

    /// Tags configured for a server, whether or not it is currently alive.
    pub fn server_tags(&self, server_name: &str) -> Option<&std::collections::BTreeSet<String>> {
        self.configs.get(server_name).map(|c| &c.tags)
    }

    /// Static + liveness info for every configured server.
    pub async fn get_client_info(&self) -> HashMap<String, ClientInfoEntry> {
        let clients = self.clients.read().await;
        let mut info = HashMap::new();
        for (name, config) in &self.configs {
            let alive = match clients.get(name) {
                Some(client) => client.state().await == ClientState::Ready,
                None => false,
            };
            info.insert(
                name.clone(),
                ClientInfoEntry {
                    command: config.command.clone(),
                    args: config.args.clone(),
                    env: config.env.clone(),
                    server_type: config.server_type.clone(),
                    tags: config.tags.iter().cloned().collect(),
                    alive,
                },
            );
        }
        info
    }

    /// Monotonic counter bumped on every pool mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Names of currently pooled servers.
    pub async fn live_servers(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    /// Terminate every downstream. Sessions are expected to be gone already.
    pub async fn shutdown_all(&self) {
        let snapshot: Vec<Arc<DownstreamClient>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in snapshot {
            tracing::info!(server = %client.name(), "shutting down downstream");
            client.shutdown().await;
        }
        self.bump_generation();
    }

    #[cfg(test)]
    pub(crate) fn bump_generation_for_test(&self) {
        self.bump_generation();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_ladder_matches_schedule() {
        let settings = SupervisorSettings::default();
        assert_eq!(settings.reconnect_delay(1), Duration::from_secs(5));
        assert_eq!(settings.reconnect_delay(2), Duration::from_secs(60));
        assert_eq!(settings.reconnect_delay(3), Duration::from_secs(120));
        assert_eq!(settings.reconnect_delay(4), Duration::from_secs(240));
        assert_eq!(settings.reconnect_delay(5), Duration::from_secs(480));
    }

    #[test]
    fn test_reconnect_ladder_is_capped() {
        let settings = SupervisorSettings {
            reconnect_attempts: 10,
            ..SupervisorSettings::default()
        };
        assert_eq!(settings.reconnect_delay(9), Duration::from_secs(480));
    }

    #[tokio::test]
    async fn test_empty_pool_is_acceptable() {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        manager.clone().start_all().await;
        assert!(manager.list_all_tools().await.is_empty());
        assert!(manager.live_servers().await.is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_unknown_server() {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        let err = manager
            .call_tool("ghost", "anything", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ClientNotFound(_)));
    }

    #[tokio::test]
    async fn test_generation_bumps_on_mutation() {
        let manager = ClientManager::new(Vec::new(), SupervisorSettings::default());
        let before = manager.generation();
        manager.bump_generation_for_test();
        assert!(manager.generation() > before);
    }
}
