//! Schema cache with request coalescing
//!
//! Full tool input schemas are loaded from upstreams on demand and kept in a
//! size-bounded, TTL-aware map keyed by `server:tool`. Concurrent loads for
//! the same key collapse onto one shared future so the upstream sees exactly
//! one request regardless of how many readers arrive first.

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ProxyError, ProxyResult};
use crate::protocol::ToolDefinition;

/// Default bound on cached schemas
pub const DEFAULT_MAX_ENTRIES: usize = 512;

/// Default schema time-to-live
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache configuration
#[derive(Debug, Clone)]
pub struct SchemaCacheConfig {
    /// Hard bound on stored entries
    pub max_entries: usize,

    /// Entry lifetime; `None` disables expiry
    pub ttl: Option<Duration>,
}

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: Some(DEFAULT_TTL),
        }
    }
}

/// Counter snapshot reported by [`SchemaCache::stats`]
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct StatsCollector {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

impl StatsCollector {
    fn snapshot(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            coalesced: self.coalesced.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

struct SchemaEntry {
    tool: ToolDefinition,
    cached_at: Instant,
}

type SharedLoad = Shared<BoxFuture<'static, Result<ToolDefinition, ProxyError>>>;

/// Request-coalescing, bounded, TTL-aware cache of tool schemas
pub struct SchemaCache {
    entries: Mutex<HashMap<String, SchemaEntry>>,
    // Generation numbers let a finished load remove only its own entry.
    in_flight: Mutex<HashMap<String, (u64, SharedLoad)>>,
    load_seq: AtomicU64,
    config: SchemaCacheConfig,
    stats: StatsCollector,
}

impl SchemaCache {
    /// Create a cache with the given bounds
    pub fn new(config: SchemaCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            load_seq: AtomicU64::new(0),
            config,
            stats: StatsCollector::default(),
        }
    }

    /// Cache key for a server-qualified tool
    pub fn key(server: &str, tool: &str) -> String {
        format!("{}:{}", server, tool)
    }

    fn is_expired(&self, entry: &SchemaEntry) -> bool {
        match self.config.ttl {
            Some(ttl) => entry.cached_at.elapsed() > ttl,
            None => false,
        }
    }

    /// Return the cached schema, join an in-flight load, or run the loader.
    ///
    /// The loader runs at most once per key per flight; every concurrent
    /// caller observes the same outcome, success or failure.
    pub async fn get_or_load<F, Fut>(
        &self,
        server: &str,
        tool: &str,
        loader: F,
    ) -> ProxyResult<ToolDefinition>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProxyResult<ToolDefinition>> + Send + 'static,
    {
        let key = Self::key(server, tool);

        {
            let mut entries = self.entries.lock();
            match entries.get(&key) {
                Some(entry) if !self.is_expired(entry) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.tool.clone());
                }
                Some(_) => {
                    entries.remove(&key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {}
            }
        }

        let (generation, load, joined) = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some((generation, existing)) => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    (*generation, existing.clone(), true)
                }
                None => {
                    self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    let generation = self.load_seq.fetch_add(1, Ordering::Relaxed);
                    let task = tokio::spawn(loader());
                    let shared: SharedLoad = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(ProxyError::internal(format!("schema load failed: {}", e))),
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key.clone(), (generation, shared.clone()));
                    (generation, shared, false)
                }
            }
        };

        let result = load.await;

        if !joined {
            let mut in_flight = self.in_flight.lock();
            if in_flight
                .get(&key)
                .is_some_and(|(held, _)| *held == generation)
            {
                in_flight.remove(&key);
            }
            if let Ok(tool) = &result {
                self.store(key, tool.clone());
            }
        }

        result
    }

    fn store(&self, key: String, tool: ToolDefinition) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(key = %oldest, "evicting oldest schema entry");
                entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key,
            SchemaEntry {
                tool,
                cached_at: Instant::now(),
            },
        );
    }

    /// Whether a fresh entry exists for the key
    pub fn has(&self, server: &str, tool: &str) -> bool {
        let key = Self::key(server, tool);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if !self.is_expired(entry) => true,
            Some(_) => {
                entries.remove(&key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                false
            }
            None => false,
        }
    }

    /// Return the cached schema without ever triggering a load. An expired
    /// entry observed here is removed.
    pub fn get_if_cached(&self, server: &str, tool: &str) -> Option<ToolDefinition> {
        let key = Self::key(server, tool);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if !self.is_expired(entry) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.tool.clone())
            }
            Some(_) => {
                entries.remove(&key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a schema directly
    pub fn insert(&self, server: &str, tool: ToolDefinition) {
        let key = Self::key(server, &tool.name);
        self.store(key, tool);
    }

    /// Remove one entry; returns whether it existed
    pub fn remove(&self, server: &str, tool: &str) -> bool {
        self.entries.lock().remove(&Self::key(server, tool)).is_some()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of stored entries, including any not yet observed as expired
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Load many schemas in parallel through `get_or_load`. Individual
    /// failures are collected, never propagated.
    pub async fn preload<F, Fut>(&self, list: &[(String, String)], loader: F) -> PreloadOutcome
    where
        F: Fn(String, String) -> Fut,
        Fut: Future<Output = ProxyResult<ToolDefinition>> + Send + 'static,
    {
        let attempts = list.iter().map(|(server, tool)| {
            let load = loader(server.clone(), tool.clone());
            async move {
                let result = self.get_or_load(server, tool, move || load).await;
                (server.clone(), tool.clone(), result)
            }
        });

        let mut outcome = PreloadOutcome::default();
        for (server, tool, result) in join_all(attempts).await {
            match result {
                Ok(_) => outcome.loaded += 1,
                Err(e) => outcome.failed.push((server, tool, e.to_string())),
            }
        }
        outcome
    }

    /// Current counter snapshot
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(SchemaCacheConfig::default())
    }
}

/// Result of a bulk preload
#[derive(Debug, Default)]
pub struct PreloadOutcome {
    pub loaded: usize,
    pub failed: Vec<(String, String, String)>,
}
