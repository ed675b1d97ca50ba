//! TZONA Storage - persistence contract, database resilience and caching
//!
//! - [`persistence`]: the [`DataStore`] trait, the raw-query guard and an
//!   in-memory store for development and tests.
//! - [`database`]: error classification, the availability tracker that lets
//!   the API fail fast during outages, and the retry policy.
//! - [`cache`]: the two-tier cache store and the resource-aware layer on top.

pub mod cache;
pub mod database;
pub mod persistence;

pub use cache::{
    AdaptiveTtl, AdaptiveTtlConfig, AdviceType, CacheBackend, CacheError, CacheFallback,
    CacheLayer, CacheObserver, CacheResource, CacheResult, CacheStats, CacheStore,
    CacheStoreConfig, CacheStoreSnapshot, CacheTier, CacheVersioning, ExerciseFilter,
    FallbackMode, FallbackSnapshot, MemoryCache, ResourceParams, ScopeVersions,
};
#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use database::{
    classify, is_connectivity_error, is_constraint_error, is_transient_error,
    AvailabilityConfig, AvailabilitySnapshot, AvailabilityTracker, Backoff, ErrorClass,
    LastDbError, ProbeStrategy, RetryPolicy,
};
pub use persistence::{
    DataStore, GuardedStore, InMemoryStore, PersistenceError, PersistenceResult, Record,
    RAW_QUERY_DISABLED, REFRESHABLE_VIEWS, VIEW_NOT_ALLOWED,
};
