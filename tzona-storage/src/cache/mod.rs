//! Layered cache.
//!
//! [`CacheStore`] holds the tiers: an optional remote backend guarded by
//! [`CacheFallback`], and an in-process [`MemoryCache`]. [`CacheLayer`] sits
//! on top and knows about resources: key construction, scope versions,
//! adaptive TTLs and invalidation.
//!
//! ```ignore
//! let layer = CacheLayer::new(Arc::new(CacheStore::new(CacheStoreConfig::from_env())));
//! let summary = layer
//!     .remember(&ResourceParams::ProfileSummary { profile_id }, None, || load(profile_id))
//!     .await?;
//! layer.invalidate_session_derived(Some(profile_id)).await;
//! ```

pub mod adaptive_ttl;
pub mod fallback;
pub mod invalidation;
pub mod layer;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;
pub mod scope_version;
pub mod store;
pub mod strategy;
pub mod traits;

pub use adaptive_ttl::{AdaptiveTtl, AdaptiveTtlConfig, AdaptiveTtlSnapshot, ScopeActivity, GLOBAL_SCOPE};
pub use fallback::{CacheFallback, FallbackMode, FallbackSnapshot};
pub use layer::CacheLayer;
pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis_backend::RedisCache;
pub use scope_version::ScopeVersions;
pub use store::{CacheStore, CacheStoreConfig, CacheStoreSnapshot};
pub use strategy::{AdviceType, CacheResource, CacheVersioning, ExerciseFilter, ResourceParams};
pub use traits::{CacheBackend, CacheError, CacheObserver, CacheResult, CacheStats, CacheTier};
