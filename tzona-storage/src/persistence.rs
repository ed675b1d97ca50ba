//! Persistence contract and raw-query guard.
//!
//! The persistence engine is consumed through [`DataStore`]. Records are JSON
//! documents addressed by `(table, id)`. [`GuardedStore`] wraps any store and
//! disables the raw-statement escape hatch, except for refreshing an allowlisted
//! set of materialized views.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// A stored document.
pub type Record = serde_json::Value;

/// Error code returned for any blocked raw statement.
pub const RAW_QUERY_DISABLED: &str = "RAW_QUERY_DISABLED";

/// Error code returned when a materialized view is not on the allowlist.
pub const VIEW_NOT_ALLOWED: &str = "VIEW_NOT_ALLOWED";

/// Materialized views that may be refreshed through the guard.
pub const REFRESHABLE_VIEWS: [&str; 3] = [
    "session_volume_mv",
    "profile_rpe_distribution_mv",
    "profile_summary_mv",
];

// ============================================================================
// ERRORS
// ============================================================================

/// Error raised by the persistence engine.
///
/// `code` is a Postgres SQLSTATE (`08006`, `23505`, ...) or one of the pool or
/// guard codes (`POOL_TIMEOUT`, `RAW_QUERY_DISABLED`, ...).
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", describe(.code, .message))]
pub struct PersistenceError {
    pub code: Option<String>,
    pub message: String,
    pub target: Option<String>,
}

impl PersistenceError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            target: None,
        }
    }

    /// Error without a code; classification falls back to the message.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn raw_query_disabled() -> Self {
        Self::new(
            RAW_QUERY_DISABLED,
            "Raw query execution is disabled to prevent SQL injection",
        )
    }

    pub fn view_not_allowed(view: &str) -> Self {
        Self::new(
            VIEW_NOT_ALLOWED,
            format!("Materialized view '{view}' is not refreshable"),
        )
        .with_target(view)
    }

    /// True for errors produced by the raw-query guard.
    pub fn is_guard_error(&self) -> bool {
        matches!(self.code.as_deref(), Some(RAW_QUERY_DISABLED | VIEW_NOT_ALLOWED))
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

fn describe(code: &Option<String>, message: &str) -> String {
    match code {
        Some(code) => format!("[{code}] {message}"),
        None => message.to_string(),
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

// ============================================================================
// CONTRACT
// ============================================================================

/// Typed CRUD over JSON documents plus a raw-statement escape hatch.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>>;

    /// Insert a new record. Fails with SQLSTATE `23505` if the id exists.
    async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record>;

    /// Replace an existing record. Returns `None` if it does not exist.
    async fn update(&self, table: &str, id: &str, data: Record)
        -> PersistenceResult<Option<Record>>;

    /// Returns whether a record was removed.
    async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> PersistenceResult<()>;

    /// Execute a raw statement, returning the affected row count.
    async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64>;
}

#[async_trait]
impl<S: DataStore + ?Sized> DataStore for Arc<S> {
    async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        (**self).find(table, id).await
    }

    async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record> {
        (**self).insert(table, id, data).await
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Record,
    ) -> PersistenceResult<Option<Record>> {
        (**self).update(table, id, data).await
    }

    async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool> {
        (**self).delete(table, id).await
    }

    async fn ping(&self) -> PersistenceResult<()> {
        (**self).ping().await
    }

    async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64> {
        (**self).execute_raw(statement).await
    }
}

// ============================================================================
// RAW-QUERY GUARD
// ============================================================================

/// Wraps a store and refuses raw statements.
#[derive(Debug, Clone)]
pub struct GuardedStore<S> {
    inner: S,
}

impl<S: DataStore> GuardedStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Refresh one of [`REFRESHABLE_VIEWS`].
    pub async fn refresh_materialized_view(
        &self,
        view: &str,
        concurrently: bool,
    ) -> PersistenceResult<()> {
        if !REFRESHABLE_VIEWS.contains(&view) {
            error!(view = %view, "Blocked refresh of non-allowlisted materialized view");
            return Err(PersistenceError::view_not_allowed(view));
        }
        let statement = if concurrently {
            format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {view}")
        } else {
            format!("REFRESH MATERIALIZED VIEW {view}")
        };
        self.inner.execute_raw(&statement).await.map(|_| ())
    }
}

#[async_trait]
impl<S: DataStore> DataStore for GuardedStore<S> {
    async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        self.inner.find(table, id).await
    }

    async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record> {
        self.inner.insert(table, id, data).await
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Record,
    ) -> PersistenceResult<Option<Record>> {
        self.inner.update(table, id, data).await
    }

    async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool> {
        self.inner.delete(table, id).await
    }

    async fn ping(&self) -> PersistenceResult<()> {
        self.inner.ping().await
    }

    async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64> {
        let preview: String = statement.chars().take(120).collect();
        error!(preview = %preview, "Blocked raw query execution");
        Err(PersistenceError::raw_query_disabled())
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Development and test store. Can be switched offline to simulate lost
/// connectivity, or primed with one-shot failures.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<HashMap<String, HashMap<String, Record>>>,
    offline: AtomicBool,
    injected: Mutex<VecDeque<PersistenceError>>,
    statements: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Queue an error returned by the next operation.
    pub fn fail_next(&self, error: PersistenceError) {
        lock(&self.injected).push_back(error);
    }

    /// Raw statements that reached this store.
    pub fn executed_statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    fn check_available(&self) -> PersistenceResult<()> {
        if let Some(err) = lock(&self.injected).pop_front() {
            return Err(err);
        }
        if self.is_offline() {
            return Err(PersistenceError::new(
                "08006",
                "connection to server was lost",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DataStore for InMemoryStore {
    async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        self.check_available()?;
        Ok(lock(&self.tables)
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record> {
        self.check_available()?;
        let mut tables = lock(&self.tables);
        let rows = tables.entry(table.to_string()).or_default();
        if rows.contains_key(id) {
            return Err(PersistenceError::new(
                "23505",
                format!("duplicate key value violates unique constraint \"{table}_pkey\""),
            )
            .with_target(format!("{table}.id")));
        }
        rows.insert(id.to_string(), data.clone());
        Ok(data)
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Record,
    ) -> PersistenceResult<Option<Record>> {
        self.check_available()?;
        let mut tables = lock(&self.tables);
        match tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(existing) => {
                *existing = data.clone();
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool> {
        self.check_available()?;
        Ok(lock(&self.tables)
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .is_some())
    }

    async fn ping(&self) -> PersistenceResult<()> {
        self.check_available()
    }

    async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64> {
        self.check_available()?;
        lock(&self.statements).push(statement.to_string());
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_crud() {
        let store = InMemoryStore::new();
        store
            .insert("profiles", "p1", json!({"name": "Ana"}))
            .await
            .unwrap();

        let found = store.find("profiles", "p1").await.unwrap();
        assert_eq!(found, Some(json!({"name": "Ana"})));

        let updated = store
            .update("profiles", "p1", json!({"name": "Ana B"}))
            .await
            .unwrap();
        assert_eq!(updated, Some(json!({"name": "Ana B"})));

        assert!(store.delete("profiles", "p1").await.unwrap());
        assert!(!store.delete("profiles", "p1").await.unwrap());
        assert_eq!(store.find("profiles", "p1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_constraint_violation() {
        let store = InMemoryStore::new();
        store.insert("sessions", "s1", json!({})).await.unwrap();

        let err = store.insert("sessions", "s1", json!({})).await.unwrap_err();
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.target.as_deref(), Some("sessions.id"));
    }

    #[tokio::test]
    async fn test_offline_store_reports_connection_loss() {
        let store = InMemoryStore::new();
        store.set_offline(true);

        let err = store.ping().await.unwrap_err();
        assert_eq!(err.code(), Some("08006"));

        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_are_one_shot() {
        let store = InMemoryStore::new();
        store.fail_next(PersistenceError::new("40001", "could not serialize access"));

        assert!(store.find("t", "x").await.is_err());
        assert!(store.find("t", "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_guard_blocks_raw_queries() {
        let guarded = GuardedStore::new(InMemoryStore::new());

        let err = guarded.execute_raw("DELETE FROM profiles").await.unwrap_err();
        assert_eq!(err.code(), Some(RAW_QUERY_DISABLED));
        assert_eq!(
            err.message,
            "Raw query execution is disabled to prevent SQL injection"
        );
        assert!(err.is_guard_error());
        assert!(guarded.inner().executed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_guard_allows_listed_view_refresh() {
        let guarded = GuardedStore::new(InMemoryStore::new());

        guarded
            .refresh_materialized_view("session_volume_mv", true)
            .await
            .unwrap();
        guarded
            .refresh_materialized_view("profile_summary_mv", false)
            .await
            .unwrap();

        assert_eq!(
            guarded.inner().executed_statements(),
            vec![
                "REFRESH MATERIALIZED VIEW CONCURRENTLY session_volume_mv",
                "REFRESH MATERIALIZED VIEW profile_summary_mv",
            ]
        );
    }

    #[tokio::test]
    async fn test_guard_rejects_unlisted_view() {
        let guarded = GuardedStore::new(InMemoryStore::new());

        let err = guarded
            .refresh_materialized_view("users; DROP TABLE users", false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(VIEW_NOT_ALLOWED));
        assert!(guarded.inner().executed_statements().is_empty());
    }

    #[test]
    fn test_error_display_includes_code() {
        let err = PersistenceError::new("57P01", "terminating connection");
        assert_eq!(err.to_string(), "[57P01] terminating connection");
        assert_eq!(
            PersistenceError::from_message("boom").to_string(),
            "boom"
        );
    }
}
