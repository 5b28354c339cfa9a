//! Upstream connection management
//!
//! The [`UpstreamManager`] owns every upstream client connection. Bulk
//! initialization bounds its concurrency with a semaphore, concurrent
//! connection attempts for the same upstream collapse onto one shared
//! future, and each record tracks its own status machine:
//!
//! ```text
//! Disconnected ── create_one ──▶ Connecting ── success ──▶ Connected
//!                                   │                          │
//!                                   │ OAuth challenge          │ transport close
//!                                   ▼                          ▼
//!                              AwaitingOauth             Disconnected
//!                                   │
//!                                   │ complete_oauth_and_reconnect
//!                                   ▼
//!                              (Connecting → Connected)
//!      any state ── fatal ──▶ Error
//! ```

pub mod client;
pub mod http;
pub mod retry;
pub mod stdio;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::UpstreamClient;
pub use retry::{connect_with_retry, ConnectOutcome, ConnectPolicy};
pub use transport::{
    DefaultTransportFactory, TransportEvent, TransportFactory, TransportKind, UpstreamTransport,
};

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use manifold_config::{plan_action, ChangeAction, ConfigChange, UpstreamConfig};

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::{CapabilitySet, InitializeResult, ServerInfo};

/// Default bound on concurrent connection attempts during bulk initialize
pub const DEFAULT_MAX_CONCURRENT_LOADS: usize = 10;

/// Connection status of one upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpstreamStatus {
    Disconnected,
    Connecting,
    Connected,
    AwaitingOauth,
    Error,
}

impl UpstreamStatus {
    /// Whether a connection attempt has finished, one way or another
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Error | Self::AwaitingOauth | Self::Disconnected
        )
    }
}

impl fmt::Display for UpstreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AwaitingOauth => "awaiting_oauth",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Mutable portion of an upstream record
struct UpstreamState {
    status: UpstreamStatus,
    client: Option<Arc<UpstreamClient>>,
    last_connected: Option<DateTime<Utc>>,
    oauth_started_at: Option<DateTime<Utc>>,
    authorization_url: Option<String>,
    last_error: Option<ProxyError>,
    capabilities: Option<CapabilitySet>,
    instructions: Option<String>,
}

/// One upstream connection record
///
/// At most one record exists per upstream name; the client handle is held
/// only while the status is Connecting, Connected, or AwaitingOauth.
pub struct UpstreamRecord {
    name: String,
    config: SyncRwLock<UpstreamConfig>,
    state: RwLock<UpstreamState>,
}

/// Read-only view of a record for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSnapshot {
    pub name: String,
    pub status: UpstreamStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub oauth_started_at: Option<DateTime<Utc>>,
    pub authorization_url: Option<String>,
    pub last_error: Option<String>,
}

impl UpstreamRecord {
    fn new(name: String, config: UpstreamConfig) -> Self {
        Self {
            name,
            config: SyncRwLock::new(config),
            state: RwLock::new(UpstreamState {
                status: UpstreamStatus::Disconnected,
                client: None,
                last_connected: None,
                oauth_started_at: None,
                authorization_url: None,
                last_error: None,
                capabilities: None,
                instructions: None,
            }),
        }
    }

    /// Upstream name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current configuration
    pub fn config(&self) -> UpstreamConfig {
        self.config.read().clone()
    }

    /// Replace the configuration (tags-only updates take this path)
    pub fn set_config(&self, config: UpstreamConfig) {
        *self.config.write() = config;
    }

    /// Tags from the current configuration
    pub fn tags(&self) -> Vec<String> {
        self.config.read().tags.clone()
    }

    /// Current status
    pub async fn status(&self) -> UpstreamStatus {
        self.state.read().await.status
    }

    /// Live client handle, if connected or awaiting authorization
    pub async fn client(&self) -> Option<Arc<UpstreamClient>> {
        self.state.read().await.client.clone()
    }

    /// Capabilities recorded from the last successful handshake
    pub async fn capabilities(&self) -> Option<CapabilitySet> {
        self.state.read().await.capabilities.clone()
    }

    /// Store capabilities gathered during aggregation
    pub async fn set_capabilities(&self, capabilities: CapabilitySet) {
        self.state.write().await.capabilities = Some(capabilities);
    }

    /// Instruction text recorded from the last successful handshake
    pub async fn instructions(&self) -> Option<String> {
        self.state.read().await.instructions.clone()
    }

    /// Point-in-time view for health reporting
    pub async fn snapshot(&self) -> UpstreamSnapshot {
        let state = self.state.read().await;
        UpstreamSnapshot {
            name: self.name.clone(),
            status: state.status,
            last_connected: state.last_connected,
            oauth_started_at: state.oauth_started_at,
            authorization_url: state.authorization_url.clone(),
            last_error: state.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    async fn transition_connecting(&self) {
        let mut state = self.state.write().await;
        state.status = UpstreamStatus::Connecting;
        state.last_error = None;
    }

    async fn transition_connected(&self, client: Arc<UpstreamClient>, init: &InitializeResult) {
        let mut state = self.state.write().await;
        state.status = UpstreamStatus::Connected;
        state.client = Some(client);
        state.last_connected = Some(Utc::now());
        state.authorization_url = None;
        state.oauth_started_at = None;
        state.last_error = None;
        state.capabilities = Some(init.capabilities.clone());
        state.instructions = init.instructions.clone();
    }

    async fn transition_awaiting_oauth(
        &self,
        client: Arc<UpstreamClient>,
        authorization_url: Option<String>,
    ) {
        let mut state = self.state.write().await;
        state.status = UpstreamStatus::AwaitingOauth;
        state.client = Some(client);
        state.oauth_started_at = Some(Utc::now());
        state.authorization_url = authorization_url.clone();
        state.last_error = Some(ProxyError::OauthRequired {
            upstream: self.name.clone(),
            authorization_url,
        });
    }

    async fn transition_failed(&self, error: ProxyError) {
        let mut state = self.state.write().await;
        state.status = if error == ProxyError::Cancelled {
            UpstreamStatus::Disconnected
        } else {
            UpstreamStatus::Error
        };
        state.client = None;
        state.last_error = Some(error);
    }

    async fn mark_disconnected_if_current(&self, client: &Arc<UpstreamClient>) {
        let mut state = self.state.write().await;
        let is_current = state
            .client
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, client));
        if is_current && state.status == UpstreamStatus::Connected {
            info!(upstream = %self.name, "upstream transport closed");
            state.status = UpstreamStatus::Disconnected;
            state.client = None;
        }
    }

    async fn take_awaiting_client(&self) -> ProxyResult<Arc<UpstreamClient>> {
        let mut state = self.state.write().await;
        if state.status != UpstreamStatus::AwaitingOauth {
            return Err(ProxyError::invalid_params(format!(
                "upstream '{}' is not awaiting authorization",
                self.name
            )));
        }
        let client = state.client.take().ok_or_else(|| {
            ProxyError::internal(format!("upstream '{}' lost its pending client", self.name))
        })?;
        state.status = UpstreamStatus::Disconnected;
        Ok(client)
    }

    async fn close(&self) {
        let client = {
            let mut state = self.state.write().await;
            state.status = UpstreamStatus::Disconnected;
            state.client.take()
        };
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                debug!(upstream = %self.name, "error closing client: {}", e);
            }
        }
    }
}

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name this proxy advertises; upstreams reporting it are refused as
    /// circular
    pub server_name: String,

    /// Version this proxy advertises
    pub server_version: String,

    /// Bound on concurrent connection attempts
    pub max_concurrent_loads: usize,

    /// Retry parameters for each upstream connection
    pub connect: ConnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server_name: "manifold".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            max_concurrent_loads: DEFAULT_MAX_CONCURRENT_LOADS,
            connect: ConnectPolicy::default(),
        }
    }
}

/// Outcome of a bulk initialize
#[derive(Debug, Default)]
pub struct StartupSummary {
    pub connected: Vec<String>,
    pub awaiting_oauth: Vec<String>,
    pub failed: Vec<(String, String)>,
}

type SharedConnect = Shared<BoxFuture<'static, Result<UpstreamStatus, ProxyError>>>;

/// Owner of all upstream client connections
pub struct UpstreamManager {
    config: ManagerConfig,
    factory: Arc<dyn TransportFactory>,
    records: RwLock<BTreeMap<String, Arc<UpstreamRecord>>>,
    // Generation numbers let a finished attempt remove only its own entry.
    in_flight: SyncMutex<HashMap<String, (u64, SharedConnect)>>,
    connect_seq: std::sync::atomic::AtomicU64,
    semaphore: Arc<Semaphore>,
    bulk_lock: tokio::sync::Mutex<()>,
}

impl UpstreamManager {
    /// Create a manager with the given transport factory
    pub fn new(config: ManagerConfig, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        let permits = config.max_concurrent_loads.max(1);
        Arc::new(Self {
            config,
            factory,
            records: RwLock::new(BTreeMap::new()),
            in_flight: SyncMutex::new(HashMap::new()),
            connect_seq: std::sync::atomic::AtomicU64::new(0),
            semaphore: Arc::new(Semaphore::new(permits)),
            bulk_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a manager with default config and the built-in transports
    pub fn with_defaults() -> Arc<Self> {
        Self::new(
            ManagerConfig::default(),
            Arc::new(DefaultTransportFactory),
        )
    }

    /// Identity this proxy advertises to upstreams and downstreams
    pub fn server_info(&self) -> ServerInfo {
        ServerInfo {
            name: self.config.server_name.clone(),
            version: self.config.server_version.clone(),
        }
    }

    /// Idempotent bulk initialize: tears down prior records, then connects
    /// every enabled upstream with bounded concurrency. Returns once every
    /// upstream has reached a terminal status.
    pub async fn create_all(
        self: &Arc<Self>,
        configs: &BTreeMap<String, UpstreamConfig>,
    ) -> StartupSummary {
        let _guard = self.bulk_lock.lock().await;

        let prior = std::mem::take(&mut *self.records.write().await);
        for record in prior.values() {
            record.close().await;
        }
        self.in_flight.lock().clear();

        let attempts = configs
            .iter()
            .filter(|(_, cfg)| !cfg.disabled)
            .map(|(name, cfg)| {
                let manager = Arc::clone(self);
                let name = name.clone();
                let cfg = cfg.clone();
                async move {
                    let result = manager.create_one(&name, cfg, None).await;
                    (name, result)
                }
            })
            .collect::<Vec<_>>();

        let mut summary = StartupSummary::default();
        for (name, result) in join_all(attempts).await {
            match result {
                Ok(UpstreamStatus::Connected) => summary.connected.push(name),
                Ok(UpstreamStatus::AwaitingOauth) => summary.awaiting_oauth.push(name),
                Ok(status) => summary.failed.push((name, status.to_string())),
                Err(e) => summary.failed.push((name, e.to_string())),
            }
        }

        info!(
            connected = summary.connected.len(),
            awaiting_oauth = summary.awaiting_oauth.len(),
            failed = summary.failed.len(),
            "upstream initialization complete"
        );
        summary
    }

    /// Connect a single upstream. Concurrent calls for the same name join
    /// the in-flight attempt instead of starting another.
    pub async fn create_one(
        self: &Arc<Self>,
        name: &str,
        config: UpstreamConfig,
        cancel: Option<CancellationToken>,
    ) -> ProxyResult<UpstreamStatus> {
        if config.disabled {
            return Err(ProxyError::Configuration {
                message: format!("upstream '{}' is disabled", name),
            });
        }

        let (generation, fut) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(name) {
                Some((generation, existing)) => {
                    debug!(upstream = %name, "joining in-flight connection attempt");
                    (*generation, existing.clone())
                }
                None => {
                    let generation = self
                        .connect_seq
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    let manager = Arc::clone(self);
                    let task_name = name.to_string();
                    let cancel = cancel.unwrap_or_default();
                    let task = tokio::spawn(async move {
                        manager.connect_task(task_name, config, cancel).await
                    });
                    let shared: SharedConnect = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(ProxyError::internal(format!(
                                "connect task failed: {}",
                                e
                            ))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(name.to_string(), (generation, shared.clone()));
                    (generation, shared)
                }
            }
        };

        let result = fut.await;

        let mut in_flight = self.in_flight.lock();
        if in_flight
            .get(name)
            .is_some_and(|(held, _)| *held == generation)
        {
            in_flight.remove(name);
        }
        result
    }

    async fn connect_task(
        self: Arc<Self>,
        name: String,
        config: UpstreamConfig,
        cancel: CancellationToken,
    ) -> Result<UpstreamStatus, ProxyError> {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::internal("connection manager is shut down"))?;

        let record = {
            let mut records = self.records.write().await;
            let entry = records
                .entry(name.clone())
                .or_insert_with(|| Arc::new(UpstreamRecord::new(name.clone(), config.clone())));
            Arc::clone(entry)
        };
        record.set_config(config.clone());
        record.transition_connecting().await;

        let proxy_info = self.server_info();
        match connect_with_retry(
            &name,
            &config,
            self.factory.as_ref(),
            &self.config.connect,
            &proxy_info,
            &cancel,
        )
        .await
        {
            Ok(ConnectOutcome::Connected { client, init }) => {
                self.watch_disconnect(&record, &client);
                record.transition_connected(client, &init).await;
                info!(upstream = %name, server = %init.server_info.name, "upstream connected");
                Ok(UpstreamStatus::Connected)
            }
            Ok(ConnectOutcome::AwaitingOauth {
                client,
                authorization_url,
            }) => {
                record
                    .transition_awaiting_oauth(client, authorization_url)
                    .await;
                info!(upstream = %name, "upstream awaiting authorization");
                Ok(UpstreamStatus::AwaitingOauth)
            }
            Err(e) => {
                record.transition_failed(e.clone()).await;
                warn!(upstream = %name, error = %e, "upstream connection failed");
                Err(e)
            }
        }
    }

    fn watch_disconnect(&self, record: &Arc<UpstreamRecord>, client: &Arc<UpstreamClient>) {
        let record = Arc::clone(record);
        let client = Arc::clone(client);
        tokio::spawn(async move {
            client.wait_disconnected().await;
            record.mark_disconnected_if_current(&client).await;
        });
    }

    /// Close and drop one upstream
    pub async fn remove(&self, name: &str) -> ProxyResult<()> {
        let record = self
            .records
            .write()
            .await
            .remove(name)
            .ok_or_else(|| ProxyError::not_found("upstream", name))?;
        record.close().await;
        Ok(())
    }

    /// Close every upstream and clear the record map
    pub async fn shutdown(&self) {
        let records = std::mem::take(&mut *self.records.write().await);
        for record in records.values() {
            record.close().await;
        }
        self.in_flight.lock().clear();
    }

    /// Look up one record
    pub async fn get(&self, name: &str) -> Option<Arc<UpstreamRecord>> {
        self.records.read().await.get(name).cloned()
    }

    /// All records in name order
    pub async fn all(&self) -> Vec<Arc<UpstreamRecord>> {
        self.records.read().await.values().cloned().collect()
    }

    /// Names of all managed upstreams, in order
    pub async fn transport_names(&self) -> Vec<String> {
        self.records.read().await.keys().cloned().collect()
    }

    /// Health snapshot of every upstream
    pub async fn snapshots(&self) -> Vec<UpstreamSnapshot> {
        let records = self.all().await;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            snapshots.push(record.snapshot().await);
        }
        snapshots
    }

    /// Run an operation against a connected upstream's client
    pub async fn execute_on<T, F, Fut>(&self, name: &str, op: F) -> ProxyResult<T>
    where
        F: FnOnce(Arc<UpstreamClient>) -> Fut,
        Fut: Future<Output = ProxyResult<T>>,
    {
        let record = self
            .get(name)
            .await
            .ok_or_else(|| ProxyError::not_found("upstream", name))?;

        let client = {
            let state = record.state.read().await;
            if state.status != UpstreamStatus::Connected {
                return Err(ProxyError::not_connected(name));
            }
            state
                .client
                .clone()
                .ok_or_else(|| ProxyError::not_connected(name))?
        };

        op(client).await
    }

    /// Finish a pending OAuth exchange and reconnect with a fresh transport
    /// of the same kind
    pub async fn complete_oauth_and_reconnect(
        self: &Arc<Self>,
        name: &str,
        code: &str,
    ) -> ProxyResult<UpstreamStatus> {
        let record = self
            .get(name)
            .await
            .ok_or_else(|| ProxyError::not_found("upstream", name))?;

        let config = record.config();
        if !config.transport.supports_oauth() {
            return Err(ProxyError::Configuration {
                message: format!(
                    "upstream '{}' uses a {} transport, which cannot complete OAuth",
                    name,
                    config.transport.type_name()
                ),
            });
        }

        let client = record.take_awaiting_client().await?;
        client.finish_auth(code).await?;
        if let Err(e) = client.close().await {
            debug!(upstream = %name, "error closing pre-auth transport: {}", e);
        }

        self.create_one(name, config, None).await
    }

    /// React to one configuration change with the minimal action
    pub async fn apply_change(
        self: &Arc<Self>,
        change: &ConfigChange,
        new_config: Option<&UpstreamConfig>,
    ) -> ProxyResult<ChangeAction> {
        let name = change.name().to_string();
        let was_running = self.records.read().await.contains_key(&name);
        let action = plan_action(change, new_config, was_running);

        match action {
            ChangeAction::Start => {
                let config = new_config
                    .cloned()
                    .ok_or_else(|| ProxyError::internal("start action without a config"))?;
                if let Err(e) = self.create_one(&name, config, None).await {
                    warn!(upstream = %name, error = %e, "start after config change failed");
                }
            }
            ChangeAction::Stop => {
                let _ = self.remove(&name).await;
            }
            ChangeAction::Restart => {
                let _ = self.remove(&name).await;
                let config = new_config
                    .cloned()
                    .ok_or_else(|| ProxyError::internal("restart action without a config"))?;
                if let Err(e) = self.create_one(&name, config, None).await {
                    warn!(upstream = %name, error = %e, "restart after config change failed");
                }
            }
            ChangeAction::UpdateMetadata => {
                if let (Some(record), Some(config)) = (self.get(&name).await, new_config) {
                    record.set_config(config.clone());
                    debug!(upstream = %name, "updated tags without restart");
                }
            }
            ChangeAction::None => {}
        }

        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::testing::{stub_upstream_config, MockBehavior, MockFactory};
    use manifold_config::ChangedField;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn manager_with(factory: MockFactory) -> Arc<UpstreamManager> {
        UpstreamManager::new(ManagerConfig::default(), Arc::new(factory))
    }

    fn fast_manager_with(factory: MockFactory) -> Arc<UpstreamManager> {
        UpstreamManager::new(
            ManagerConfig {
                connect: ConnectPolicy {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(10),
                },
                ..Default::default()
            },
            Arc::new(factory),
        )
    }

    #[tokio::test]
    async fn test_create_all_reaches_terminal_statuses() {
        let factory = MockFactory::new();
        factory.register("alpha", MockBehavior::default());
        factory.register(
            "broken",
            MockBehavior {
                fail_connects: 99,
                ..Default::default()
            },
        );
        let manager = fast_manager_with(factory);

        let mut configs = BTreeMap::new();
        configs.insert("alpha".to_string(), stub_upstream_config(&["x"]));
        configs.insert("broken".to_string(), stub_upstream_config(&[]));
        let mut disabled = stub_upstream_config(&[]);
        disabled.disabled = true;
        configs.insert("ignored".to_string(), disabled);

        let summary = manager.create_all(&configs).await;

        assert_eq!(summary.connected, vec!["alpha".to_string()]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "broken");
        // Disabled upstreams are skipped entirely.
        assert!(manager.get("ignored").await.is_none());

        assert_eq!(
            manager.get("alpha").await.unwrap().status().await,
            UpstreamStatus::Connected
        );
        assert_eq!(
            manager.get("broken").await.unwrap().status().await,
            UpstreamStatus::Error
        );
    }

    #[tokio::test]
    async fn test_create_all_is_idempotent() {
        let factory = MockFactory::new();
        let state = factory.register("alpha", MockBehavior::default());
        let manager = manager_with(factory);

        let mut configs = BTreeMap::new();
        configs.insert("alpha".to_string(), stub_upstream_config(&[]));

        manager.create_all(&configs).await;
        manager.create_all(&configs).await;

        assert_eq!(manager.transport_names().await, vec!["alpha".to_string()]);
        // The first generation's transport was closed before the second ran.
        assert!(state.closed_transports.load(Ordering::SeqCst) >= 1);
        assert_eq!(
            manager.get("alpha").await.unwrap().status().await,
            UpstreamStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_concurrent_create_one_is_deduplicated() {
        let factory = MockFactory::new();
        let state = factory.register(
            "alpha",
            MockBehavior {
                connect_delay: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let manager = manager_with(factory);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager
                    .create_one("alpha", stub_upstream_config(&[]), None)
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), UpstreamStatus::Connected);
        }

        assert_eq!(state.created_transports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bulk_concurrency_is_bounded() {
        let factory = MockFactory::new();
        for i in 0..6 {
            factory.register(
                &format!("u{}", i),
                MockBehavior {
                    connect_delay: Some(Duration::from_millis(30)),
                    ..Default::default()
                },
            );
        }
        let gauge = Arc::clone(&factory.gauge);

        let manager = UpstreamManager::new(
            ManagerConfig {
                max_concurrent_loads: 2,
                ..Default::default()
            },
            Arc::new(factory),
        );

        let mut configs = BTreeMap::new();
        for i in 0..6 {
            configs.insert(format!("u{}", i), stub_upstream_config(&[]));
        }
        let summary = manager.create_all(&configs).await;

        assert_eq!(summary.connected.len(), 6);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_recover() {
        let factory = MockFactory::new();
        let state = factory.register(
            "flaky",
            MockBehavior {
                fail_connects: 2,
                ..Default::default()
            },
        );
        let manager = UpstreamManager::new(
            ManagerConfig {
                connect: ConnectPolicy {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(100),
                },
                ..Default::default()
            },
            Arc::new(factory),
        );

        let started = tokio::time::Instant::now();
        let status = manager
            .create_one("flaky", stub_upstream_config(&[]), None)
            .await
            .unwrap();

        assert_eq!(status, UpstreamStatus::Connected);
        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_circular_upstream_is_fatal() {
        let factory = MockFactory::new();
        let state = factory.register(
            "loop",
            MockBehavior {
                server_name: Some("manifold".to_string()),
                ..Default::default()
            },
        );
        let manager = fast_manager_with(factory);

        let err = manager
            .create_one("loop", stub_upstream_config(&[]), None)
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::CircularDependency { .. }));
        assert_eq!(state.connect_calls.load(Ordering::SeqCst), 1);

        let record = manager.get("loop").await.unwrap();
        assert_eq!(record.status().await, UpstreamStatus::Error);
        let snapshot = record.snapshot().await;
        assert!(snapshot.last_error.unwrap().contains("resolves back"));
    }

    #[tokio::test]
    async fn test_oauth_round_trip() {
        let factory = MockFactory::new();
        let state = factory.register_kind(
            "h",
            MockBehavior {
                unauthorized_until_auth: true,
                ..Default::default()
            },
            TransportKind::StreamableHttp,
        );
        let manager = fast_manager_with(factory);

        let mut config = manifold_config::UpstreamConfig::new(
            manifold_config::UpstreamTransportConfig::StreamableHttp {
                url: "https://h.example.com/mcp".to_string(),
                headers: Default::default(),
                oauth: None,
            },
        );
        config.tags = vec!["web".to_string()];

        let status = manager
            .create_one("h", config.clone(), None)
            .await
            .unwrap();
        assert_eq!(status, UpstreamStatus::AwaitingOauth);

        let record = manager.get("h").await.unwrap();
        let snapshot = record.snapshot().await;
        assert_eq!(
            snapshot.authorization_url.as_deref(),
            Some("https://auth.example.com/authorize")
        );
        assert!(snapshot.oauth_started_at.is_some());

        let status = manager
            .complete_oauth_and_reconnect("h", "code-xyz")
            .await
            .unwrap();

        assert_eq!(status, UpstreamStatus::Connected);
        assert_eq!(
            state.finish_auth_codes.lock().clone(),
            vec!["code-xyz".to_string()]
        );
        // Old transport closed, fresh one constructed for the reconnect.
        assert!(state.closed_transports.load(Ordering::SeqCst) >= 1);
        assert_eq!(state.created_transports.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oauth_completion_requires_capable_transport() {
        let factory = MockFactory::new();
        factory.register("s", MockBehavior::default());
        let manager = manager_with(factory);

        manager
            .create_one("s", stub_upstream_config(&[]), None)
            .await
            .unwrap();

        let err = manager
            .complete_oauth_and_reconnect("s", "code")
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_execute_on_errors() {
        let factory = MockFactory::new();
        factory.register(
            "down",
            MockBehavior {
                fail_connects: 99,
                ..Default::default()
            },
        );
        let manager = fast_manager_with(factory);

        let err = manager
            .execute_on("missing", |client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { .. }));

        let _ = manager
            .create_one("down", stub_upstream_config(&[]), None)
            .await;
        let err = manager
            .execute_on("down", |client| async move { client.ping().await })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::NotConnected { .. }));
    }

    #[tokio::test]
    async fn test_execute_on_runs_against_live_client() {
        let factory = MockFactory::new();
        factory.register("alpha", MockBehavior::default());
        let manager = manager_with(factory);

        manager
            .create_one("alpha", stub_upstream_config(&[]), None)
            .await
            .unwrap();

        manager
            .execute_on("alpha", |client| async move { client.ping().await })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_closes_transport() {
        let factory = MockFactory::new();
        let state = factory.register("alpha", MockBehavior::default());
        let manager = manager_with(factory);

        manager
            .create_one("alpha", stub_upstream_config(&[]), None)
            .await
            .unwrap();
        manager.remove("alpha").await.unwrap();

        assert!(manager.get("alpha").await.is_none());
        assert_eq!(state.closed_transports.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.remove("alpha").await.unwrap_err(),
            ProxyError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_tags_only_change_skips_reconnect() {
        let factory = MockFactory::new();
        let state = factory.register("alpha", MockBehavior::default());
        let manager = manager_with(factory);

        manager
            .create_one("alpha", stub_upstream_config(&["old"]), None)
            .await
            .unwrap();
        assert_eq!(state.created_transports.load(Ordering::SeqCst), 1);

        let change = ConfigChange::Modified {
            name: "alpha".to_string(),
            fields_changed: vec![ChangedField::Tags],
        };
        let new_config = stub_upstream_config(&["new-tag"]);
        let action = manager
            .apply_change(&change, Some(&new_config))
            .await
            .unwrap();

        assert_eq!(action, ChangeAction::UpdateMetadata);
        // No transport churn: the connection was left alone.
        assert_eq!(state.created_transports.load(Ordering::SeqCst), 1);
        assert_eq!(state.closed_transports.load(Ordering::SeqCst), 0);
        let record = manager.get("alpha").await.unwrap();
        assert_eq!(record.tags(), vec!["new-tag".to_string()]);
        assert_eq!(record.status().await, UpstreamStatus::Connected);
    }

    #[tokio::test]
    async fn test_transport_change_restarts_connection() {
        let factory = MockFactory::new();
        let state = factory.register("alpha", MockBehavior::default());
        let manager = manager_with(factory);

        manager
            .create_one("alpha", stub_upstream_config(&[]), None)
            .await
            .unwrap();

        let change = ConfigChange::Modified {
            name: "alpha".to_string(),
            fields_changed: vec![ChangedField::Transport],
        };
        let action = manager
            .apply_change(&change, Some(&stub_upstream_config(&[])))
            .await
            .unwrap();

        assert_eq!(action, ChangeAction::Restart);
        assert_eq!(state.created_transports.load(Ordering::SeqCst), 2);
        assert_eq!(state.closed_transports.load(Ordering::SeqCst), 1);
    }
}
