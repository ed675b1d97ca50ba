//! Two-tier cache store.
//!
//! Reads try the remote tier (unless fallback is active) and then the memory
//! tier. Writes and deletes go to both. Remote failures are absorbed and fed
//! into [`CacheFallback`]; callers only ever see hits or misses. A store
//! without any tier is a pure bypass.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::fallback::{CacheFallback, FallbackMode, FallbackSnapshot};
use super::memory::MemoryCache;
use super::traits::{CacheBackend, CacheObserver, CacheTier};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CacheStoreConfig {
    /// Prefix for every key, as `namespace:key`.
    pub namespace: String,
    /// Disable to run without an in-process tier.
    pub memory_enabled: bool,
    pub memory_max_entries: usize,
    pub sweep_interval: Duration,
    /// Consecutive remote failures before bypassing the remote tier.
    pub fallback_threshold: u32,
    pub fallback_cooldown: Duration,
    /// Fraction of the TTL shaved off at random by `remember`.
    pub ttl_jitter_ratio: f64,
    pub ttl_jitter_max: Duration,
    pub redis_url: Option<String>,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "tzona".to_string(),
            memory_enabled: true,
            memory_max_entries: 5000,
            sweep_interval: Duration::from_secs(60),
            fallback_threshold: 3,
            fallback_cooldown: Duration::from_secs(60),
            ttl_jitter_ratio: 0.15,
            ttl_jitter_max: Duration::from_secs(10),
            redis_url: None,
        }
    }
}

impl CacheStoreConfig {
    /// Environment variables:
    /// - `TZONA_CACHE_NAMESPACE` (default: tzona)
    /// - `TZONA_CACHE_MEMORY_ENABLED` (default: true)
    /// - `TZONA_CACHE_MEMORY_MAX_ENTRIES` (default: 5000, min 100)
    /// - `TZONA_CACHE_SWEEP_INTERVAL_MS` (default: 60000, min 1000)
    /// - `TZONA_CACHE_FALLBACK_THRESHOLD` (default: 3)
    /// - `TZONA_CACHE_FALLBACK_COOLDOWN_MS` (default: 60000)
    /// - `TZONA_CACHE_REDIS_URL`, falling back to `REDIS_URL`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let namespace = std::env::var("TZONA_CACHE_NAMESPACE")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.namespace);

        let memory_enabled = std::env::var("TZONA_CACHE_MEMORY_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        let memory_max_entries = std::env::var("TZONA_CACHE_MEMORY_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.memory_max_entries);

        let sweep_interval = std::env::var("TZONA_CACHE_SWEEP_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.sweep_interval);

        let fallback_threshold = std::env::var("TZONA_CACHE_FALLBACK_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.fallback_threshold);

        let fallback_cooldown = std::env::var("TZONA_CACHE_FALLBACK_COOLDOWN_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.fallback_cooldown);

        let redis_url = std::env::var("TZONA_CACHE_REDIS_URL")
            .or_else(|_| std::env::var("REDIS_URL"))
            .ok()
            .filter(|s| !s.trim().is_empty());

        Self {
            namespace,
            memory_enabled,
            memory_max_entries,
            sweep_interval,
            fallback_threshold,
            fallback_cooldown,
            redis_url,
            ..defaults
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn without_memory(mut self) -> Self {
        self.memory_enabled = false;
        self
    }

    pub fn with_ttl_jitter(mut self, ratio: f64, max: Duration) -> Self {
        self.ttl_jitter_ratio = ratio;
        self.ttl_jitter_max = max;
        self
    }

    pub fn with_fallback(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.fallback_threshold = threshold;
        self.fallback_cooldown = cooldown;
        self
    }
}

/// Diagnostics for health and dashboard surfaces.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStoreSnapshot {
    pub namespace: String,
    pub remote_configured: bool,
    pub fallback: FallbackSnapshot,
    pub memory_entries: usize,
    pub inflight_loads: usize,
}

// ============================================================================
// STORE
// ============================================================================

/// Slot shared by concurrent `remember` callers for one key. Holds the
/// serialized value once the first caller has produced it.
type InflightSlot = Arc<tokio::sync::Mutex<Option<String>>>;

pub struct CacheStore {
    namespace: String,
    remote: Option<Arc<dyn CacheBackend>>,
    memory: Option<Arc<MemoryCache>>,
    fallback: CacheFallback,
    inflight: DashMap<String, InflightSlot>,
    /// Keys deleted while the remote tier was unreachable.
    pending_deletes: DashSet<String>,
    observer: Option<Arc<dyn CacheObserver>>,
    ttl_jitter_ratio: f64,
    ttl_jitter_max: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    fallback_threshold: u32,
    fallback_cooldown: Duration,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("namespace", &self.namespace)
            .field("remote", &self.remote.as_ref().map(|r| r.name()))
            .field("memory", &self.memory.as_ref().map(|m| m.len()))
            .field("fallback", &self.fallback.mode())
            .finish()
    }
}

impl CacheStore {
    /// Store with the memory tier only (or no tier if memory is disabled).
    pub fn new(config: CacheStoreConfig) -> Self {
        let memory = config
            .memory_enabled
            .then(|| Arc::new(MemoryCache::new(config.memory_max_entries)));
        Self {
            namespace: config.namespace,
            remote: None,
            memory,
            fallback: CacheFallback::disabled(),
            inflight: DashMap::new(),
            pending_deletes: DashSet::new(),
            observer: None,
            ttl_jitter_ratio: config.ttl_jitter_ratio.clamp(0.0, 1.0),
            ttl_jitter_max: config.ttl_jitter_max,
            sweep_interval: config.sweep_interval,
            sweeper: Mutex::new(None),
            fallback_threshold: config.fallback_threshold,
            fallback_cooldown: config.fallback_cooldown,
        }
    }

    /// Store that caches nothing.
    pub fn bypass(namespace: impl Into<String>) -> Self {
        Self::new(CacheStoreConfig::default().with_namespace(namespace).without_memory())
    }

    /// Attach a remote tier. Enables fallback tracking.
    pub fn with_remote(mut self, remote: Arc<dyn CacheBackend>) -> Self {
        self.remote = Some(remote);
        self.fallback = CacheFallback::new(self.fallback_threshold, self.fallback_cooldown);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CacheObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        self.fallback.mode()
    }

    pub fn fallback(&self) -> &CacheFallback {
        &self.fallback
    }

    pub fn memory(&self) -> Option<&Arc<MemoryCache>> {
        self.memory.as_ref()
    }

    pub fn snapshot(&self) -> CacheStoreSnapshot {
        CacheStoreSnapshot {
            namespace: self.namespace.clone(),
            remote_configured: self.remote.is_some(),
            fallback: self.fallback.snapshot(),
            memory_entries: self.memory.as_ref().map_or(0, |m| m.len()),
            inflight_loads: self.inflight.len(),
        }
    }

    /// Start the memory sweeper. No-op without a memory tier or if already
    /// running.
    pub fn start_sweeper(&self) {
        let Some(memory) = &self.memory else {
            return;
        };
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Some(memory.spawn_sweeper(self.sweep_interval));
        }
    }

    /// Stop the sweeper and drop all in-process state.
    pub fn close(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        if let Some(memory) = &self.memory {
            memory.clear();
        }
        self.inflight.clear();
        self.pending_deletes.clear();
    }

    fn format_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn remote_tier(&self) -> Option<&Arc<dyn CacheBackend>> {
        self.remote.as_ref().filter(|_| !self.fallback.is_active())
    }

    fn observe_hit(&self, tier: CacheTier) {
        if let Some(observer) = &self.observer {
            observer.on_hit(tier);
        }
    }

    fn observe_miss(&self) {
        if let Some(observer) = &self.observer {
            observer.on_miss();
        }
    }

    /// Deletes the remote tier has not seen yet.
    pub fn pending_remote_deletes(&self) -> usize {
        self.pending_deletes.len()
    }

    /// Replay deletes that missed the remote tier. Stops at the first failure.
    async fn flush_pending_deletes(&self, remote: &Arc<dyn CacheBackend>) {
        if self.pending_deletes.is_empty() {
            return;
        }
        let keys: Vec<String> = self.pending_deletes.iter().map(|k| k.key().clone()).collect();
        for key in keys {
            match remote.delete(&key).await {
                Ok(()) => {
                    self.pending_deletes.remove(&key);
                    self.fallback.record_success();
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "Replaying remote cache delete failed");
                    self.fallback.record_failure("remote cache delete failed");
                    return;
                }
            }
        }
        debug!("Replayed pending remote cache deletes");
    }

    async fn get_raw(&self, namespaced: &str) -> Option<(String, CacheTier)> {
        if let Some(remote) = self.remote_tier() {
            self.flush_pending_deletes(remote).await;
        }
        // A key still pending deletion must not be served from the remote.
        let remote = self
            .remote_tier()
            .filter(|_| !self.pending_deletes.contains(namespaced));
        if let Some(remote) = remote {
            match remote.get(namespaced).await {
                Ok(Some(raw)) => {
                    self.fallback.record_success();
                    return Some((raw, CacheTier::Remote));
                }
                Ok(None) => self.fallback.record_success(),
                Err(err) => {
                    warn!(key = %namespaced, error = %err, "Remote cache get failed");
                    self.fallback.record_failure("remote cache get failed");
                }
            }
        }
        self.memory
            .as_ref()
            .and_then(|memory| memory.get_raw(namespaced))
            .map(|raw| (raw, CacheTier::Memory))
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let namespaced = self.format_key(key);
        if let Some((raw, tier)) = self.get_raw(&namespaced).await {
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    self.observe_hit(tier);
                    return Some(value);
                }
                Err(err) => {
                    warn!(key = %namespaced, error = %err, "Discarding unreadable cache entry");
                }
            }
        }
        self.observe_miss();
        None
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key = %key, error = %err, "Failed to serialize cache value");
                return;
            }
        };
        self.set_raw(&self.format_key(key), raw, ttl).await;
    }

    async fn set_raw(&self, namespaced: &str, raw: String, ttl: Duration) {
        let ttl = ttl.max(Duration::from_secs(1));
        if let Some(remote) = self.remote_tier() {
            self.flush_pending_deletes(remote).await;
            match remote.set(namespaced, raw.clone(), ttl).await {
                Ok(()) => {
                    self.pending_deletes.remove(namespaced);
                    self.fallback.record_success();
                }
                Err(err) => {
                    warn!(key = %namespaced, error = %err, "Remote cache set failed");
                    self.fallback.record_failure("remote cache set failed");
                }
            }
        }
        if let Some(memory) = &self.memory {
            memory.set_raw(namespaced, raw, ttl);
        }
    }

    /// Remove `key` from both tiers. A delete the remote tier cannot take,
    /// during fallback or on error, is replayed on the next remote access.
    pub async fn delete(&self, key: &str) {
        let namespaced = self.format_key(key);
        match self.remote_tier() {
            Some(remote) => {
                self.flush_pending_deletes(remote).await;
                match remote.delete(&namespaced).await {
                    Ok(()) => {
                        self.pending_deletes.remove(&namespaced);
                        self.fallback.record_success();
                    }
                    Err(err) => {
                        warn!(key = %namespaced, error = %err, "Remote cache delete failed");
                        self.fallback.record_failure("remote cache delete failed");
                        self.pending_deletes.insert(namespaced.clone());
                    }
                }
            }
            None if self.remote.is_some() => {
                self.pending_deletes.insert(namespaced.clone());
            }
            None => {}
        }
        if let Some(memory) = &self.memory {
            memory.remove(&namespaced);
        }
    }

    /// Read-through with per-key single flight.
    ///
    /// Concurrent callers for the same key wait for the first one and reuse
    /// its value. Factory errors reach the caller that ran the factory; the
    /// next waiter then runs the factory itself. Cache errors never surface.
    pub async fn remember<T, E, F, Fut>(&self, key: &str, ttl: Duration, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let namespaced = self.format_key(key);
        let slot: InflightSlot = self
            .inflight
            .entry(namespaced.clone())
            .or_default()
            .clone();
        let mut produced = slot.lock().await;

        if let Some(raw) = produced.as_deref() {
            if let Ok(value) = serde_json::from_str(raw) {
                debug!(key = %namespaced, "Reused in-flight cache load");
                return Ok(value);
            }
        }
        // Another caller may have filled the cache while we waited.
        if let Some(cached) = self.get(key).await {
            return Ok(cached);
        }

        let result = factory().await;
        if let Ok(value) = &result {
            match serde_json::to_string(value) {
                Ok(raw) => {
                    *produced = Some(raw.clone());
                    self.set_raw(&namespaced, raw, self.jittered_ttl(ttl)).await;
                }
                Err(err) => {
                    warn!(key = %namespaced, error = %err, "Failed to serialize cache value");
                }
            }
        }
        self.inflight
            .remove_if(&namespaced, |_, current| Arc::ptr_eq(current, &slot));
        drop(produced);
        result
    }

    /// Shave a random amount off `ttl` so entries written together do not
    /// expire together. Never below one second.
    pub fn jittered_ttl(&self, ttl: Duration) -> Duration {
        let secs = ttl.as_secs();
        let percent = (secs as f64 * self.ttl_jitter_ratio).floor() as u64;
        let cap = percent.min(self.ttl_jitter_max.as_secs());
        if cap == 0 {
            return ttl;
        }
        let jitter = rand::rng().random_range(0..=cap);
        Duration::from_secs(secs.saturating_sub(jitter).max(1))
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}
