//! Service bootstrap.
//!
//! Startup is three lifecycle steps over a shared [`ServiceContext`]:
//!
//! 1. `database` - pool, tracked client, initial probe
//! 2. `cache` - store, optional remote tier, sweeper, resource layer
//! 3. `http` - bind and serve with graceful shutdown
//!
//! Shutdown runs the cleanups in reverse: stop serving, close the cache,
//! close the pool.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tzona_core::{ApplicationLifecycle, BoxError, LifecycleError, LifecycleStep};
use tzona_storage::{
    AdaptiveTtlConfig, AvailabilityConfig, AvailabilityTracker, CacheLayer, CacheStore,
    CacheStoreConfig, CacheVersioning, DataStore, InMemoryStore, RetryPolicy,
};

use crate::analytics::Analytics;
use crate::config::ApiConfig;
use crate::db::{DbClient, DbConfig};
use crate::error::ApiError;
use crate::routes::build_router;
use crate::state::AppState;
use crate::telemetry::metrics;

/// How long the `http` cleanup waits for in-flight requests.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the service keeps its records.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    Postgres(DbConfig),
    /// Process-local store for development.
    InMemory,
}

impl StoreBackend {
    /// Environment variables:
    /// - `TZONA_DB_BACKEND`: `postgres` (default) or `memory`
    pub fn from_env() -> Self {
        match std::env::var("TZONA_DB_BACKEND") {
            Ok(value) if value.eq_ignore_ascii_case("memory") => StoreBackend::InMemory,
            _ => StoreBackend::Postgres(DbConfig::from_env()),
        }
    }
}

struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Everything the lifecycle steps build and tear down.
pub struct ServiceContext {
    pub config: ApiConfig,
    pub backend: StoreBackend,
    pub cache_config: CacheStoreConfig,
    pub analytics: Analytics,
    pub availability: Arc<AvailabilityTracker>,
    pub retry: RetryPolicy,
    pub drain_timeout: Duration,
    db: Mutex<Option<DbClient>>,
    cache: Mutex<Option<Arc<CacheLayer>>>,
    server: Mutex<Option<ServerHandle>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceContext {
    pub fn new(config: ApiConfig, backend: StoreBackend) -> Self {
        Self {
            config,
            backend,
            cache_config: CacheStoreConfig::default(),
            analytics: Analytics::default(),
            availability: Arc::new(AvailabilityTracker::new(AvailabilityConfig::default())),
            retry: RetryPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            db: Mutex::new(None),
            cache: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    pub fn from_env() -> Self {
        Self {
            cache_config: CacheStoreConfig::from_env(),
            analytics: Analytics::from_env(),
            availability: Arc::new(AvailabilityTracker::new(AvailabilityConfig::from_env())),
            retry: RetryPolicy::from_env(),
            ..Self::new(ApiConfig::from_env(), StoreBackend::from_env())
        }
    }

    pub fn db(&self) -> Option<DbClient> {
        lock(&self.db).clone()
    }

    pub fn cache(&self) -> Option<Arc<CacheLayer>> {
        lock(&self.cache).clone()
    }

    /// Bound address once the `http` step has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.server).as_ref().map(|s| s.local_addr)
    }

    // ========================================================================
    // STEP ACTIONS
    // ========================================================================

    async fn start_database(&self) -> Result<(), BoxError> {
        let db = match &self.backend {
            StoreBackend::Postgres(config) => DbClient::from_config(
                config,
                self.availability.clone(),
                self.analytics.slow_queries.clone(),
            )?,
            StoreBackend::InMemory => {
                let store: Arc<dyn DataStore> = Arc::new(InMemoryStore::new());
                DbClient::new(
                    store,
                    self.availability.clone(),
                    self.analytics.slow_queries.clone(),
                )
            }
        }
        .with_retry(self.retry.clone());

        // An unreachable database closes the gate instead of failing startup.
        match db.ping().await {
            Ok(()) => info!(pool_size = db.pool_size(), "Database ready"),
            Err(e) => warn!(error = %e, "Database unreachable at startup, serving degraded"),
        }

        *lock(&self.db) = Some(db);
        Ok(())
    }

    async fn stop_database(&self) -> Result<(), BoxError> {
        if let Some(db) = lock(&self.db).take() {
            db.close();
            info!("Database pool closed");
        }
        Ok(())
    }

    async fn start_cache(&self) -> Result<(), BoxError> {
        let mut store = CacheStore::new(self.cache_config.clone());
        if let Some(m) = metrics() {
            store = store.with_observer(Arc::new(m.clone()));
        }
        store = self.attach_remote(store).await;
        store.start_sweeper();

        let layer = CacheLayer::new(Arc::new(store))
            .with_adaptive_ttl(AdaptiveTtlConfig::from_env())
            .with_versioning(CacheVersioning::from_env());
        info!(
            namespace = %layer.store().namespace(),
            mode = layer.store().fallback_mode().as_str(),
            "Cache ready"
        );
        *lock(&self.cache) = Some(Arc::new(layer));
        Ok(())
    }

    #[cfg(feature = "redis")]
    async fn attach_remote(&self, store: CacheStore) -> CacheStore {
        let Some(url) = self.cache_config.redis_url.as_deref() else {
            return store;
        };
        match tzona_storage::RedisCache::connect(url).await {
            Ok(remote) => store.with_remote(Arc::new(remote)),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, continuing with the memory tier");
                store
            }
        }
    }

    #[cfg(not(feature = "redis"))]
    async fn attach_remote(&self, store: CacheStore) -> CacheStore {
        if self.cache_config.redis_url.is_some() {
            warn!("Redis URL configured but the redis feature is disabled");
        }
        store
    }

    async fn stop_cache(&self) -> Result<(), BoxError> {
        if let Some(layer) = lock(&self.cache).take() {
            layer.store().close();
            info!("Cache closed");
        }
        Ok(())
    }

    async fn start_http(&self) -> Result<(), BoxError> {
        let db = self
            .db()
            .ok_or_else(|| ApiError::internal_error("database step has not run"))?;
        let cache = self
            .cache()
            .ok_or_else(|| ApiError::internal_error("cache step has not run"))?;

        let addr = self.config.bind_addr()?;
        let state = AppState::new(self.config.clone(), db, cache, self.analytics.clone());
        let app = build_router(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.notified().await });
            if let Err(e) = server.await {
                tracing::error!(error = %e, "HTTP server error");
            }
        });

        info!(addr = %local_addr, "HTTP server listening");
        *lock(&self.server) = Some(ServerHandle {
            local_addr,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn stop_http(&self) -> Result<(), BoxError> {
        let Some(server) = lock(&self.server).take() else {
            return Ok(());
        };
        server.shutdown.notify_one();
        match tokio::time::timeout(self.drain_timeout, server.task).await {
            Ok(_) => info!("HTTP server stopped"),
            Err(_) => warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "HTTP server did not drain in time"
            ),
        }
        Ok(())
    }
}

/// Register the `database`, `cache` and `http` steps.
pub fn build_lifecycle(
    context: ServiceContext,
) -> Result<ApplicationLifecycle<ServiceContext>, LifecycleError> {
    let lifecycle = ApplicationLifecycle::new(context);

    lifecycle.register_step(
        LifecycleStep::new("database")
            .on_run(|ctx: Arc<ServiceContext>| async move { ctx.start_database().await })
            .on_cleanup(|ctx: Arc<ServiceContext>| async move { ctx.stop_database().await }),
    )?;
    lifecycle.register_step(
        LifecycleStep::new("cache")
            .on_run(|ctx: Arc<ServiceContext>| async move { ctx.start_cache().await })
            .on_cleanup(|ctx: Arc<ServiceContext>| async move { ctx.stop_cache().await }),
    )?;
    lifecycle.register_step(
        LifecycleStep::new("http")
            .on_run(|ctx: Arc<ServiceContext>| async move { ctx.start_http().await })
            .on_cleanup(|ctx: Arc<ServiceContext>| async move { ctx.stop_http().await }),
    )?;

    Ok(lifecycle)
}

/// Resolve on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tzona_core::LifecyclePhase;

    fn memory_context() -> ServiceContext {
        let config = ApiConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ApiConfig::default()
        };
        ServiceContext::new(config, StoreBackend::InMemory)
    }

    #[tokio::test]
    async fn test_lifecycle_starts_and_stops_in_order() {
        let lifecycle = build_lifecycle(memory_context()).unwrap();
        lifecycle.start().await.unwrap();

        assert_eq!(lifecycle.executed_steps(), vec!["database", "cache", "http"]);
        let ctx = lifecycle.context().clone();
        assert!(ctx.db().is_some());
        assert!(ctx.cache().is_some());
        let addr = ctx.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let stream = tokio::net::TcpStream::connect(addr).await;
        assert!(stream.is_ok());
        drop(stream);

        lifecycle.shutdown().await;
        assert_eq!(lifecycle.phase(), LifecyclePhase::Shutdown);
        assert!(ctx.db().is_none());
        assert!(ctx.cache().is_none());
        assert!(ctx.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_bad_bind_address_unwinds_started_steps() {
        let config = ApiConfig {
            host: "not an address".to_string(),
            ..ApiConfig::default()
        };
        let lifecycle = build_lifecycle(ServiceContext::new(config, StoreBackend::InMemory)).unwrap();

        let err = lifecycle.start().await.unwrap_err();
        assert_eq!(err.step(), Some("http"));
        assert_eq!(lifecycle.phase(), LifecyclePhase::Shutdown);
        assert!(lifecycle.context().db().is_none());
        assert!(lifecycle.context().cache().is_none());
    }
}
