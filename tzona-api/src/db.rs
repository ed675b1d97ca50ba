//! Database Connection Pool Module
//!
//! PostgreSQL connection pooling using deadpool-postgres, a [`PgStore`] that
//! implements the storage crate's [`DataStore`] contract over `(id, data)`
//! JSONB tables, and the [`DbClient`] the service talks to. Every operation
//! through `DbClient` is:
//!
//! - routed through the raw-query guard,
//! - retried on transient errors,
//! - reported to the availability tracker,
//! - timed for the slow-query monitor and Prometheus.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Instant;
use tokio_postgres::NoTls;
use tzona_core::{DependencyStatus, HealthCheck};
use tzona_storage::{
    AvailabilityTracker, DataStore, GuardedStore, PersistenceError, PersistenceResult, Record,
    RetryPolicy,
};

use crate::analytics::SlowQueryMonitor;
use crate::error::{ApiError, ApiResult};
use crate::telemetry::metrics;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Wait, create and recycle timeout
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "tzona".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            max_size: 16,
            timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    ///
    /// - `TZONA_DB_HOST`, `TZONA_DB_PORT`, `TZONA_DB_NAME`, `TZONA_DB_USER`,
    ///   `TZONA_DB_PASSWORD`
    /// - `TZONA_DB_POOL_SIZE` (default: 16, min 1)
    /// - `TZONA_DB_TIMEOUT_SECS` (default: 5, min 1)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("TZONA_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("TZONA_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: std::env::var("TZONA_DB_NAME").unwrap_or(defaults.dbname),
            user: std::env::var("TZONA_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("TZONA_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("TZONA_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .map(|n| n.max(1))
                .unwrap_or(defaults.max_size),
            timeout: std::env::var("TZONA_DB_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| Duration::from_secs(secs.max(1)))
                .unwrap_or(defaults.timeout),
        }
    }

    /// Create a connection pool from this configuration.
    ///
    /// The pool connects lazily; the first checkout opens a connection.
    pub fn create_pool(&self) -> ApiResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_config = deadpool_postgres::PoolConfig::new(self.max_size);
        pool_config.timeouts.wait = Some(self.timeout);
        pool_config.timeouts.create = Some(self.timeout);
        pool_config.timeouts.recycle = Some(self.timeout);
        cfg.pool = Some(pool_config);

        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ApiError::database_error(format!("Failed to create pool: {}", e)))
    }
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

/// Map a driver error onto SQLSTATE-coded persistence errors.
pub fn map_pg_error(err: tokio_postgres::Error) -> PersistenceError {
    if let Some(db) = err.as_db_error() {
        let error = PersistenceError::new(db.code().code(), db.message());
        return match db.constraint().or(db.table()) {
            Some(target) => error.with_target(target),
            None => error,
        };
    }
    let lost_connection = err.is_closed()
        || std::error::Error::source(&err)
            .is_some_and(|source| source.downcast_ref::<std::io::Error>().is_some());
    if lost_connection {
        PersistenceError::new("08006", err.to_string())
    } else {
        PersistenceError::from_message(err.to_string())
    }
}

pub fn map_pool_error(err: PoolError) -> PersistenceError {
    match err {
        PoolError::Timeout(kind) => {
            PersistenceError::new("POOL_TIMEOUT", format!("Connection pool timeout: {:?}", kind))
        }
        PoolError::Closed => PersistenceError::new("POOL_CLOSED", "Connection pool is closed"),
        PoolError::Backend(e) => map_pg_error(e),
        other => PersistenceError::new("08001", format!("Failed to acquire connection: {}", other)),
    }
}

// ============================================================================
// POSTGRES STORE
// ============================================================================

static TABLE_NAME: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$"));

/// Table names are interpolated into SQL, so only plain identifiers pass.
fn validate_table(table: &str) -> PersistenceResult<&str> {
    match TABLE_NAME.as_ref() {
        Ok(pattern) if pattern.is_match(table) => Ok(table),
        _ => Err(PersistenceError::new("42602", format!("Invalid table name '{table}'"))),
    }
}

/// [`DataStore`] over tables shaped `(id text primary key, data jsonb)`.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn get_conn(&self) -> PersistenceResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(map_pool_error)
    }
}

#[async_trait]
impl DataStore for PgStore {
    async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        let table = validate_table(table)?;
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(&format!("SELECT data FROM {table} WHERE id = $1"), &[&id])
            .await
            .map_err(map_pg_error)?;
        row.map(|row| row.try_get::<_, Record>(0).map_err(map_pg_error))
            .transpose()
    }

    async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record> {
        let table = validate_table(table)?;
        let conn = self.get_conn().await?;
        let row = conn
            .query_one(
                &format!("INSERT INTO {table} (id, data) VALUES ($1, $2) RETURNING data"),
                &[&id, &data],
            )
            .await
            .map_err(map_pg_error)?;
        row.try_get::<_, Record>(0).map_err(map_pg_error)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Record,
    ) -> PersistenceResult<Option<Record>> {
        let table = validate_table(table)?;
        let conn = self.get_conn().await?;
        let row = conn
            .query_opt(
                &format!("UPDATE {table} SET data = $2 WHERE id = $1 RETURNING data"),
                &[&id, &data],
            )
            .await
            .map_err(map_pg_error)?;
        row.map(|row| row.try_get::<_, Record>(0).map_err(map_pg_error))
            .transpose()
    }

    async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool> {
        let table = validate_table(table)?;
        let conn = self.get_conn().await?;
        let affected = conn
            .execute(&format!("DELETE FROM {table} WHERE id = $1"), &[&id])
            .await
            .map_err(map_pg_error)?;
        Ok(affected > 0)
    }

    async fn ping(&self) -> PersistenceResult<()> {
        let conn = self.get_conn().await?;
        conn.query_one("SELECT 1", &[]).await.map_err(map_pg_error)?;
        Ok(())
    }

    async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64> {
        let conn = self.get_conn().await?;
        conn.execute(statement, &[]).await.map_err(map_pg_error)
    }
}

// ============================================================================
// DATABASE CLIENT WRAPPER
// ============================================================================

/// The service's database handle.
#[derive(Clone)]
pub struct DbClient {
    store: Arc<GuardedStore<Arc<dyn DataStore>>>,
    availability: Arc<AvailabilityTracker>,
    retry: RetryPolicy,
    slow_queries: Arc<SlowQueryMonitor>,
    pool: Option<Pool>,
}

impl DbClient {
    pub fn new(
        store: Arc<dyn DataStore>,
        availability: Arc<AvailabilityTracker>,
        slow_queries: Arc<SlowQueryMonitor>,
    ) -> Self {
        Self {
            store: Arc::new(GuardedStore::new(store)),
            availability,
            retry: RetryPolicy::default(),
            slow_queries,
            pool: None,
        }
    }

    /// Create a pooled Postgres client from configuration.
    pub fn from_config(
        config: &DbConfig,
        availability: Arc<AvailabilityTracker>,
        slow_queries: Arc<SlowQueryMonitor>,
    ) -> ApiResult<Self> {
        let pool = config.create_pool()?;
        let store: Arc<dyn DataStore> = Arc::new(PgStore::new(pool.clone()));
        Ok(Self {
            pool: Some(pool),
            ..Self::new(store, availability, slow_queries)
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry.normalized();
        self
    }

    pub fn availability(&self) -> &Arc<AvailabilityTracker> {
        &self.availability
    }

    /// Get the current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.as_ref().map(|p| p.status().size).unwrap_or(0)
    }

    /// Error returned without touching the database while the gate is closed.
    fn unavailable_error() -> PersistenceError {
        PersistenceError::new("57P03", "Database temporarily unavailable")
    }

    async fn tracked<T, F, Fut>(&self, operation: &str, target: &str, op: F) -> PersistenceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = PersistenceResult<T>>,
    {
        if self.availability.is_temporarily_unavailable() {
            return Err(Self::unavailable_error());
        }

        let this = self;
        let op = &op;
        let result = self
            .retry
            .run(operation, move || async move {
                let started = Instant::now();
                let result = this.availability.observe(op()).await;
                let elapsed = started.elapsed().as_secs_f64();
                this.slow_queries
                    .observe(&format!("{target}.{operation}"), elapsed * 1000.0);
                if let Some(m) = metrics() {
                    m.record_db_operation(operation, result.is_ok(), elapsed);
                }
                result
            })
            .await;

        if let Some(m) = metrics() {
            m.set_db_available(!self.availability.is_temporarily_unavailable());
        }
        result
    }

    pub async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        self.tracked("find", table, || self.store.find(table, id)).await
    }

    pub async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record> {
        self.tracked("insert", table, || self.store.insert(table, id, data.clone()))
            .await
    }

    pub async fn update(
        &self,
        table: &str,
        id: &str,
        data: Record,
    ) -> PersistenceResult<Option<Record>> {
        self.tracked("update", table, || self.store.update(table, id, data.clone()))
            .await
    }

    pub async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool> {
        self.tracked("delete", table, || self.store.delete(table, id)).await
    }

    /// Always rejected by the guard.
    pub async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64> {
        self.store.execute_raw(statement).await
    }

    pub async fn refresh_materialized_view(
        &self,
        view: &str,
        concurrently: bool,
    ) -> PersistenceResult<()> {
        self.tracked("refresh_view", view, || {
            self.store.refresh_materialized_view(view, concurrently)
        })
        .await
    }

    /// Probe the database, bypassing the gate so a probe can close it.
    pub async fn ping(&self) -> PersistenceResult<()> {
        let started = Instant::now();
        let result = self.availability.observe(self.store.ping()).await;
        if let Some(m) = metrics() {
            m.record_db_operation("ping", result.is_ok(), started.elapsed().as_secs_f64());
            m.set_db_available(!self.availability.is_temporarily_unavailable());
        }
        result
    }

    /// Database dependency status from the tracker. Never touches the pool.
    pub fn health(&self) -> HealthCheck {
        let snapshot = self.availability.snapshot();
        let check = HealthCheck::new("database", snapshot.dependency_status());
        match (&snapshot.last_error, snapshot.dependency_status()) {
            (Some(error), DependencyStatus::Degraded) => check.with_message(error.message.clone()),
            _ => check,
        }
    }

    /// Close the pool. Outstanding connections are dropped as they return.
    pub fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close();
        }
    }
}
