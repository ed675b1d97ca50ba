//! In-process cache tier.
//!
//! Entries expire at `now + max(1s, ttl)`. Expired entries are dropped lazily
//! on read and periodically by a sweeper task. Over capacity, expired entries
//! go first, then the oldest writes in one batch that leaves a little room.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::traits::{CacheBackend, CacheResult, CacheStats};

/// Lower bound on capacity.
pub const MIN_MEMORY_ENTRIES: usize = 100;

/// Lower bound on the sweep interval.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
    written_seq: u64,
}

#[derive(Debug)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    max_entries: usize,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(5000)
    }
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(MIN_MEMORY_ENTRIES),
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let lookup = self
            .entries
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                // Guard from `get` is dropped before removing.
                if self
                    .entries
                    .remove_if(key, |_, entry| entry.expires_at <= now)
                    .is_some()
                {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn set_raw(&self, key: &str, value: String, ttl: Duration) {
        let ttl = ttl.max(Duration::from_secs(1));
        let entry = MemoryEntry {
            value,
            expires_at: Instant::now() + ttl,
            written_seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        self.entries.insert(key.to_string(), entry);
        self.evict_if_needed();
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Entries freed beyond the overflow once live entries must go, so the
    /// next few inserts do not each pay for a full scan.
    fn eviction_headroom(&self) -> usize {
        (self.max_entries / 20).max(1)
    }

    fn evict_if_needed(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        self.sweep_expired();
        if self.entries.len() <= self.max_entries {
            return;
        }

        let target = self.max_entries - self.eviction_headroom();
        let excess = self.entries.len().saturating_sub(target);
        let mut by_age: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().written_seq, entry.key().clone()))
            .collect();
        if excess < by_age.len() {
            by_age.select_nth_unstable(excess);
            by_age.truncate(excess);
        }

        let mut evicted = 0u64;
        for (_, key) in by_age {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(evicted, remaining = self.entries.len(), "Evicted oldest memory cache entries");
    }

    pub fn stats_snapshot(&self) -> CacheStats {
        let memory_bytes = self
            .entries
            .iter()
            .map(|entry| (entry.key().len() + entry.value().value.len()) as u64)
            .sum();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.entries.len() as u64,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic sweeper. It stops by itself once the cache is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                cache.evict_if_needed();
                if removed > 0 {
                    debug!(removed, remaining = cache.len(), "Swept expired memory cache entries");
                }
            }
        })
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.get_raw(key))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        self.set_raw(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.remove(key);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(self.stats_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = MemoryCache::new(100);
        cache.set_raw("k", "v".to_string(), Duration::from_secs(2));
        assert_eq!(cache.get_raw("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get_raw("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_lives_one_second() {
        let cache = MemoryCache::new(100);
        cache.set_raw("k", "v".to_string(), Duration::ZERO);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(cache.get_raw("k").is_some());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get_raw("k").is_none());
    }

    #[test]
    fn test_capacity_has_floor() {
        assert_eq!(MemoryCache::new(3).max_entries(), MIN_MEMORY_ENTRIES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_prefers_expired_then_oldest() {
        let cache = MemoryCache::new(100);
        cache.set_raw("short", "x".to_string(), Duration::from_secs(1));
        for i in 0..99 {
            cache.set_raw(&format!("k{i}"), "x".to_string(), Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 100);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set_raw("new", "x".to_string(), Duration::from_secs(60));
        // The expired entry made room, so no live entry was evicted.
        assert_eq!(cache.len(), 100);
        assert!(cache.get_raw("k0").is_some());

        // Live entries go oldest first, down to 95% of capacity.
        cache.set_raw("newer", "x".to_string(), Duration::from_secs(60));
        assert_eq!(cache.len(), 95);
        for i in 0..6 {
            assert!(cache.get_raw(&format!("k{i}")).is_none(), "k{i}");
        }
        assert!(cache.get_raw("k6").is_some());
        assert!(cache.get_raw("newer").is_some());
        assert_eq!(cache.stats_snapshot().evictions, 7);
    }

    #[test]
    fn test_eviction_leaves_headroom_for_later_inserts() {
        let cache = MemoryCache::new(200);
        for i in 0..201 {
            cache.set_raw(&format!("k{i}"), "x".to_string(), Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 190);
        let evicted = cache.stats_snapshot().evictions;
        assert_eq!(evicted, 11);

        // Refilling the headroom evicts nothing.
        for i in 201..211 {
            cache.set_raw(&format!("k{i}"), "x".to_string(), Duration::from_secs(60));
        }
        assert_eq!(cache.len(), 200);
        assert_eq!(cache.stats_snapshot().evictions, evicted);
        assert!(cache.get_raw("k11").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(MemoryCache::new(100));
        cache.set_raw("a", "1".to_string(), Duration::from_secs(1));
        cache.set_raw("b", "2".to_string(), Duration::from_secs(120));
        let sweeper = cache.spawn_sweeper(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(cache.len(), 1);
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let cache = MemoryCache::new(100);
        cache.set("k", "value".to_string(), Duration::from_secs(10)).await.unwrap();
        let _ = cache.get("k").await.unwrap();
        let _ = cache.get("missing").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.memory_bytes, 6);
    }
}
