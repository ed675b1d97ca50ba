//! Cache backend trait and statistics.
//!
//! Backends store opaque serialized payloads keyed by fully namespaced
//! strings. Serialization and key construction belong to the callers
//! ([`super::CacheStore`] and [`super::CacheLayer`]).

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Error type for cache operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Backend could not be reached or refused the command.
    #[error("{backend} cache unavailable: {message}")]
    Unavailable { backend: String, message: String },

    /// Backend answered with something unusable.
    #[error("{backend} cache command failed: {message}")]
    Command { backend: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    pub fn unavailable(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::Unavailable {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    pub fn command(backend: impl Into<String>, message: impl ToString) -> Self {
        Self::Command {
            backend: backend.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Pluggable cache tier.
///
/// Implementations must be safe for concurrent use. A TTL below one second is
/// treated as one second.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Short tier name used in logs and metrics (`memory`, `redis`, ...).
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    async fn stats(&self) -> CacheResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    /// Approximate payload bytes held.
    pub memory_bytes: u64,
    /// Entries removed for capacity or expiry.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Which tier answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Remote,
    Memory,
}

impl CacheTier {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheTier::Remote => "remote",
            CacheTier::Memory => "memory",
        }
    }
}

/// Hook for recording cache lookups, e.g. into Prometheus.
pub trait CacheObserver: Send + Sync {
    fn on_hit(&self, tier: CacheTier);
    fn on_miss(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 30,
            misses: 10,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::unavailable("redis", "connection refused");
        assert_eq!(err.to_string(), "redis cache unavailable: connection refused");
    }
}
