//! Shared application state for Axum routers.

use std::sync::Arc;

use tzona_storage::{
    AvailabilityConfig, AvailabilityTracker, CacheLayer, CacheStore, CacheStoreConfig,
    DataStore, InMemoryStore,
};

use crate::analytics::Analytics;
use crate::config::ApiConfig;
use crate::db::DbClient;
use crate::health::HealthService;

/// Application-wide state shared across all routes and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    /// Tracked database client. Its availability tracker drives the gate.
    pub db: DbClient,
    pub cache: Arc<CacheLayer>,
    pub analytics: Analytics,
    pub health: Arc<HealthService>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        db: DbClient,
        cache: Arc<CacheLayer>,
        analytics: Analytics,
    ) -> Self {
        let health = HealthService::new(
            &config,
            db.availability().clone(),
            cache.store().clone(),
            analytics.clone(),
        )
        .with_http_probes(&config);
        Self {
            config: Arc::new(config),
            db,
            cache,
            analytics,
            health: Arc::new(health),
        }
    }

    /// State backed by an in-memory store and a memory-only cache.
    pub fn in_memory(config: ApiConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    /// State over an arbitrary data store with default resilience settings.
    pub fn with_store(config: ApiConfig, store: Arc<dyn DataStore>) -> Self {
        let analytics = Analytics::default();
        let availability = Arc::new(AvailabilityTracker::new(AvailabilityConfig::default()));
        let db = DbClient::new(store, availability, analytics.slow_queries.clone());
        let cache = Arc::new(CacheLayer::new(Arc::new(CacheStore::new(
            CacheStoreConfig::default(),
        ))));
        Self::new(config, db, cache, analytics)
    }

    pub fn availability(&self) -> &Arc<AvailabilityTracker> {
        self.db.availability()
    }
}

crate::impl_from_ref!(DbClient, db);
crate::impl_from_ref!(Arc<ApiConfig>, config);
crate::impl_from_ref!(Arc<CacheLayer>, cache);
crate::impl_from_ref!(Analytics, analytics);
crate::impl_from_ref!(Arc<HealthService>, health);
