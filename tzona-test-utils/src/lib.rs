//! TZONA Test Utilities
//!
//! Shared test infrastructure for the TZONA workspace:
//! - Environment variable guards that serialise env-mutating tests
//! - Lifecycle steps that record their execution order
//! - Flaky data stores and failing cache backends
//! - Persistence error fixtures and response assertions
//! - Proptest generators

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

// Re-export the types fixtures are built from
pub use tzona_core::{ApplicationLifecycle, BoxError, LifecycleStep};
pub use tzona_storage::{
    CacheBackend, CacheError, CacheResult, CacheStats, DataStore, InMemoryStore,
    PersistenceError, PersistenceResult, Record,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// ENVIRONMENT
// ============================================================================

static ENV_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    // Guards held by this thread, plus the process-wide lock while any are live.
    static ENV_HOLD: RefCell<(usize, Option<MutexGuard<'static, ()>>)> =
        const { RefCell::new((0, None)) };
}

fn acquire_env() {
    ENV_HOLD.with(|hold| {
        let mut hold = hold.borrow_mut();
        if hold.0 == 0 {
            hold.1 = Some(ENV_LOCK.lock().unwrap_or_else(PoisonError::into_inner));
        }
        hold.0 += 1;
    });
}

fn release_env() {
    ENV_HOLD.with(|hold| {
        let mut hold = hold.borrow_mut();
        hold.0 = hold.0.saturating_sub(1);
        if hold.0 == 0 {
            hold.1 = None;
        }
    });
}

/// Sets or removes an environment variable and restores it on drop.
///
/// While any guard is alive on a thread, other threads block when creating
/// their first guard, so tests that touch the environment do not interleave.
#[derive(Debug)]
pub struct EnvVarGuard {
    key: &'static str,
    previous: Option<OsString>,
}

impl EnvVarGuard {
    pub fn set(key: &'static str, value: &str) -> Self {
        acquire_env();
        let previous = std::env::var_os(key);
        std::env::set_var(key, value);
        Self { key, previous }
    }

    pub fn unset(key: &'static str) -> Self {
        acquire_env();
        let previous = std::env::var_os(key);
        std::env::remove_var(key);
        Self { key, previous }
    }
}

impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match self.previous.take() {
            Some(value) => std::env::set_var(self.key, value),
            None => std::env::remove_var(self.key),
        }
        release_env();
    }
}

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Builds lifecycle steps that append `start:<name>` and `cleanup:<name>`
/// to a shared log.
#[derive(Debug, Clone, Default)]
pub struct StepRecorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl StepRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.events).clone()
    }

    fn push(&self, event: String) {
        lock(&self.events).push(event);
    }

    /// Step whose run and cleanup both succeed.
    pub fn step<C: Send + Sync + 'static>(&self, name: &str) -> LifecycleStep<C> {
        self.build(name, None, None)
    }

    /// Step whose run fails with `message`.
    pub fn failing_step<C: Send + Sync + 'static>(
        &self,
        name: &str,
        message: &'static str,
    ) -> LifecycleStep<C> {
        self.build(name, Some(message), None)
    }

    /// Step that starts fine but fails during cleanup.
    pub fn failing_cleanup_step<C: Send + Sync + 'static>(
        &self,
        name: &str,
        message: &'static str,
    ) -> LifecycleStep<C> {
        self.build(name, None, Some(message))
    }

    fn build<C: Send + Sync + 'static>(
        &self,
        name: &str,
        run_error: Option<&'static str>,
        cleanup_error: Option<&'static str>,
    ) -> LifecycleStep<C> {
        let run_recorder = self.clone();
        let cleanup_recorder = self.clone();
        let run_name = name.to_string();
        let cleanup_name = name.to_string();

        LifecycleStep::new(name)
            .on_run(move |_ctx: Arc<C>| {
                let recorder = run_recorder.clone();
                let name = run_name.clone();
                async move {
                    recorder.push(format!("start:{name}"));
                    match run_error {
                        Some(message) => Err(BoxError::from(message)),
                        None => Ok(()),
                    }
                }
            })
            .on_cleanup(move |_ctx: Arc<C>| {
                let recorder = cleanup_recorder.clone();
                let name = cleanup_name.clone();
                async move {
                    recorder.push(format!("cleanup:{name}"));
                    match cleanup_error {
                        Some(message) => Err(BoxError::from(message)),
                        None => Ok(()),
                    }
                }
            })
    }
}

// ============================================================================
// DATA STORES
// ============================================================================

/// In-memory store that fails a scripted number of calls before delegating.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failures: Mutex<VecDeque<PersistenceError>>,
    calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls with `error`.
    pub fn failing(times: usize, error: PersistenceError) -> Self {
        let store = Self::new();
        for _ in 0..times {
            store.push_failure(error.clone());
        }
        store
    }

    pub fn push_failure(&self, error: PersistenceError) {
        lock(&self.failures).push_back(error);
    }

    /// Calls received, failed or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    fn enter(&self) -> PersistenceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataStore for FlakyStore {
    async fn find(&self, table: &str, id: &str) -> PersistenceResult<Option<Record>> {
        self.enter()?;
        self.inner.find(table, id).await
    }

    async fn insert(&self, table: &str, id: &str, data: Record) -> PersistenceResult<Record> {
        self.enter()?;
        self.inner.insert(table, id, data).await
    }

    async fn update(
        &self,
        table: &str,
        id: &str,
        data: Record,
    ) -> PersistenceResult<Option<Record>> {
        self.enter()?;
        self.inner.update(table, id, data).await
    }

    async fn delete(&self, table: &str, id: &str) -> PersistenceResult<bool> {
        self.enter()?;
        self.inner.delete(table, id).await
    }

    async fn ping(&self) -> PersistenceResult<()> {
        self.enter()?;
        self.inner.ping().await
    }

    async fn execute_raw(&self, statement: &str) -> PersistenceResult<u64> {
        self.enter()?;
        self.inner.execute_raw(statement).await
    }
}

// ============================================================================
// CACHE BACKENDS
// ============================================================================

/// Remote cache tier that can be switched between refusing every command
/// and behaving like a plain map.
#[derive(Debug)]
pub struct FailingCacheBackend {
    healthy: AtomicBool,
    calls: AtomicUsize,
    entries: Mutex<HashMap<String, String>>,
}

impl Default for FailingCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FailingCacheBackend {
    /// Starts unhealthy.
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn enter(&self) -> CacheResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::unavailable("failing", "connection refused"))
        }
    }
}

#[async_trait]
impl CacheBackend for FailingCacheBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.enter()?;
        Ok(lock(&self.entries).get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _ttl: Duration) -> CacheResult<()> {
        self.enter()?;
        lock(&self.entries).insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.enter()?;
        lock(&self.entries).remove(key);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        self.enter()?;
        Ok(CacheStats {
            entry_count: lock(&self.entries).len() as u64,
            ..CacheStats::default()
        })
    }
}

// ============================================================================
// ERROR FIXTURES
// ============================================================================

pub mod errors {
    //! Persistence errors for each classification.

    use super::PersistenceError;

    /// Connection lost. Trips the availability breaker.
    pub fn connectivity() -> PersistenceError {
        PersistenceError::new("08006", "connection to server was lost")
    }

    /// Serialization failure. Retried, never trips the breaker.
    pub fn transient() -> PersistenceError {
        PersistenceError::new("40001", "could not serialize access due to concurrent update")
    }

    /// Unique violation on `target`.
    pub fn constraint(target: &str) -> PersistenceError {
        PersistenceError::new("23505", "duplicate key value violates unique constraint")
            .with_target(target)
    }

    /// Undefined table. Neither retried nor tripping.
    pub fn other() -> PersistenceError {
        PersistenceError::new("42P01", "relation does not exist")
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over the JSON error envelope.

    use serde_json::Value;

    /// Assert `body` is a failure envelope carrying `code`.
    #[track_caller]
    pub fn assert_error_envelope(body: &Value, code: &str) {
        assert_eq!(body["success"], Value::Bool(false), "not a failure envelope: {body}");
        assert_eq!(
            body["error"]["error"].as_str(),
            Some(code),
            "unexpected error code in {body}"
        );
        assert!(
            body["error"]["message"].is_string(),
            "error message missing in {body}"
        );
    }

    /// Assert the envelope's trace id, in both `error` and `meta`.
    #[track_caller]
    pub fn assert_trace_id(body: &Value, trace_id: &str) {
        assert_eq!(body["error"]["traceId"].as_str(), Some(trace_id), "in {body}");
        assert_eq!(body["meta"]["traceId"].as_str(), Some(trace_id), "in {body}");
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for trace ids, URL input and request samples.

    use proptest::prelude::*;

    /// Non-blank trace id as a client might send it.
    pub fn arb_trace_id() -> impl Strategy<Value = String> {
        "[A-Za-z0-9][A-Za-z0-9-]{0,35}"
    }

    /// Empty or whitespace-only candidate.
    pub fn arb_blank() -> impl Strategy<Value = String> {
        "[ \t\n]{0,8}"
    }

    /// Path segment that passes URL input validation unchanged.
    pub fn arb_safe_segment() -> impl Strategy<Value = String> {
        "[A-Za-z0-9._~-]{1,32}"
    }

    /// Segment containing at least one symbol outside the allowed set.
    pub fn arb_forbidden_segment() -> impl Strategy<Value = String> {
        (
            "[A-Za-z0-9]{0,8}",
            prop::sample::select(vec!['<', '>', '"', '{', '}', '|', '\\', '^', '`']),
            "[A-Za-z0-9]{0,8}",
        )
            .prop_map(|(head, symbol, tail)| format!("{head}{symbol}{tail}"))
    }

    pub fn arb_status_code() -> impl Strategy<Value = u16> {
        100u16..600
    }

    pub fn arb_duration_ms() -> impl Strategy<Value = f64> {
        0.0f64..10_000.0
    }

    /// Distinct step names, in registration order.
    pub fn arb_step_names(max: usize) -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set("[a-z]{1,8}", 1..=max.max(1))
            .prop_map(|names| names.into_iter().collect())
    }
}
