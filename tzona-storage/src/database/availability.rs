//! Database availability tracker.
//!
//! A circuit breaker fed by the outcomes of real persistence operations.
//! Connectivity failures inside a sliding window trip it. While it is open,
//! [`AvailabilityTracker::is_temporarily_unavailable`] lets request handlers
//! fail fast with a retry hint instead of waiting on a dead pool. It closes
//! again on a successful operation or once the cooldown elapses, depending on
//! the [`ProbeStrategy`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tzona_core::DependencyStatus;

use super::classify::is_connectivity_error;
use crate::persistence::PersistenceError;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// How the breaker closes after tripping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStrategy {
    /// Any successful operation closes the breaker immediately.
    #[default]
    Optimistic,
    /// The breaker stays open for the full cooldown regardless of successes.
    Cooldown,
}

impl std::str::FromStr for ProbeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Ok(Self::Optimistic),
            "cooldown" => Ok(Self::Cooldown),
            other => Err(format!("unknown probe strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityConfig {
    /// Connectivity failures within `failure_window` needed to trip.
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub probe_strategy: ProbeStrategy,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(30),
            probe_strategy: ProbeStrategy::Optimistic,
        }
    }
}

impl AvailabilityConfig {
    /// Environment variables:
    /// - `TZONA_DB_FAILURE_THRESHOLD` (default: 1)
    /// - `TZONA_DB_FAILURE_WINDOW_MS` (default: 30000)
    /// - `TZONA_DB_COOLDOWN_MS` (default: 30000)
    /// - `TZONA_DB_PROBE_STRATEGY`: `optimistic` or `cooldown`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let failure_threshold = std::env::var("TZONA_DB_FAILURE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.failure_threshold);

        let failure_window = std::env::var("TZONA_DB_FAILURE_WINDOW_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.failure_window);

        let cooldown = std::env::var("TZONA_DB_COOLDOWN_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.cooldown);

        let probe_strategy = std::env::var("TZONA_DB_PROBE_STRATEGY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            failure_threshold,
            failure_window,
            cooldown,
            probe_strategy,
        }
        .normalized()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self.normalized()
    }

    pub fn with_failure_window(mut self, window: Duration) -> Self {
        self.failure_window = window;
        self.normalized()
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self.normalized()
    }

    pub fn with_probe_strategy(mut self, strategy: ProbeStrategy) -> Self {
        self.probe_strategy = strategy;
        self
    }

    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.failure_threshold = self.failure_threshold.max(1);
        if self.failure_window.is_zero() {
            self.failure_window = defaults.failure_window;
        }
        if self.cooldown.is_zero() {
            self.cooldown = defaults.cooldown;
        }
        self
    }
}

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Last connectivity error seen by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastDbError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&PersistenceError> for LastDbError {
    fn from(err: &PersistenceError) -> Self {
        Self {
            code: err.code.clone(),
            message: err.message.clone(),
            target: err.target.clone(),
            at: Utc::now(),
        }
    }
}

/// Point-in-time view of the breaker. `retry_after_ms` is set only while
/// unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySnapshot {
    pub unavailable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastDbError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
}

impl AvailabilitySnapshot {
    pub fn status(&self) -> &'static str {
        if self.unavailable {
            "unavailable"
        } else {
            "available"
        }
    }

    /// An outage degrades readiness; the gate already fails requests fast.
    pub fn dependency_status(&self) -> DependencyStatus {
        if self.unavailable {
            DependencyStatus::Degraded
        } else {
            DependencyStatus::Ok
        }
    }
}

// ============================================================================
// TRACKER
// ============================================================================

#[derive(Debug, Default)]
struct TrackerState {
    failures: VecDeque<Instant>,
    unavailable_until: Option<Instant>,
    unavailable_since: Option<Instant>,
    last_error: Option<LastDbError>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Process-wide database circuit breaker.
#[derive(Debug)]
pub struct AvailabilityTracker {
    config: AvailabilityConfig,
    unavailable: AtomicBool,
    state: Mutex<TrackerState>,
}

impl Default for AvailabilityTracker {
    fn default() -> Self {
        Self::new(AvailabilityConfig::default())
    }
}

impl AvailabilityTracker {
    pub fn new(config: AvailabilityConfig) -> Self {
        Self {
            config: config.normalized(),
            unavailable: AtomicBool::new(false),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn config(&self) -> &AvailabilityConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fast check used on every request. Never touches the database.
    pub fn is_temporarily_unavailable(&self) -> bool {
        if !self.unavailable.load(Ordering::Acquire) {
            return false;
        }
        let mut state = self.lock();
        self.refresh(&mut state, Instant::now())
    }

    /// Remaining cooldown while unavailable, at least one millisecond.
    pub fn retry_after(&self) -> Option<Duration> {
        if !self.unavailable.load(Ordering::Acquire) {
            return None;
        }
        let mut state = self.lock();
        let now = Instant::now();
        if !self.refresh(&mut state, now) {
            return None;
        }
        state
            .unavailable_until
            .map(|until| until.saturating_duration_since(now).max(Duration::from_millis(1)))
    }

    pub fn snapshot(&self) -> AvailabilitySnapshot {
        let mut state = self.lock();
        let now = Instant::now();
        let unavailable = self.unavailable.load(Ordering::Acquire) && self.refresh(&mut state, now);
        let retry_after_ms = if unavailable {
            state.unavailable_until.map(|until| {
                let remaining = until.saturating_duration_since(now).as_millis();
                u64::try_from(remaining).unwrap_or(u64::MAX).max(1)
            })
        } else {
            None
        };

        AvailabilitySnapshot {
            unavailable,
            retry_after_ms,
            last_error: state.last_error.clone(),
            last_failure_at: state.last_failure_at,
            last_success_at: state.last_success_at,
        }
    }

    /// Record a successful persistence operation.
    pub fn record_success(&self) {
        let mut state = self.lock();
        let now = Instant::now();
        state.last_success_at = Some(Utc::now());

        if !self.unavailable.load(Ordering::Acquire) {
            return;
        }
        match self.config.probe_strategy {
            ProbeStrategy::Optimistic => self.restore(&mut state, now, "successful operation"),
            ProbeStrategy::Cooldown => {
                self.refresh(&mut state, now);
            }
        }
    }

    /// Record a failed persistence operation.
    ///
    /// Returns `true` if the error was a connectivity error and was counted.
    pub fn record_failure(&self, error: &PersistenceError) -> bool {
        if !is_connectivity_error(error) {
            return false;
        }

        let now = Instant::now();
        let mut state = self.lock();
        state.last_failure_at = Some(Utc::now());
        state.last_error = Some(LastDbError::from(error));

        let window = self.config.failure_window;
        while state
            .failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            state.failures.pop_front();
        }
        state.failures.push_back(now);

        let threshold = usize::try_from(self.config.failure_threshold).unwrap_or(usize::MAX);
        if state.failures.len() >= threshold {
            self.trip(&mut state, now, self.config.cooldown, error);
        }
        true
    }

    /// Force the unavailable state, for operators and tests.
    pub fn mark_unavailable(&self, error: &PersistenceError, retry_after: Option<Duration>) {
        let now = Instant::now();
        let mut state = self.lock();
        state.last_failure_at = Some(Utc::now());
        state.last_error = Some(LastDbError::from(error));
        let cooldown = retry_after
            .filter(|d| !d.is_zero())
            .unwrap_or(self.config.cooldown);
        self.trip(&mut state, now, cooldown, error);
    }

    /// Await a persistence operation and record its outcome.
    pub async fn observe<T, F>(&self, operation: F) -> Result<T, PersistenceError>
    where
        F: Future<Output = Result<T, PersistenceError>>,
    {
        let result = operation.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => {
                self.record_failure(err);
            }
        }
        result
    }

    // ------------------------------------------------------------------------
    // Transitions (caller holds the state lock)
    // ------------------------------------------------------------------------

    fn trip(
        &self,
        state: &mut TrackerState,
        now: Instant,
        cooldown: Duration,
        error: &PersistenceError,
    ) {
        state.unavailable_until = Some(now + cooldown);
        if self.unavailable.swap(true, Ordering::AcqRel) {
            return;
        }
        state.unavailable_since = Some(now);
        error!(
            cooldown_ms = cooldown.as_millis() as u64,
            code = error.code().unwrap_or("unknown"),
            error = %error.message,
            "Database unavailable; entering degraded mode"
        );
    }

    /// Returns whether the tracker is still unavailable after applying
    /// cooldown expiry.
    fn refresh(&self, state: &mut TrackerState, now: Instant) -> bool {
        match state.unavailable_until {
            Some(until) if now < until => true,
            _ => {
                self.restore(state, now, "cooldown elapsed");
                false
            }
        }
    }

    fn restore(&self, state: &mut TrackerState, now: Instant, reason: &str) {
        state.unavailable_until = None;
        state.failures.clear();
        if !self.unavailable.swap(false, Ordering::AcqRel) {
            return;
        }
        let outage_ms = state
            .unavailable_since
            .take()
            .map(|since| now.saturating_duration_since(since).as_millis() as u64);
        match outage_ms {
            Some(outage_ms) => {
                warn!(outage_ms, reason, "Database connectivity restored after outage")
            }
            None => info!(reason, "Database connectivity restored"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_lost() -> PersistenceError {
        PersistenceError::new("08006", "connection to server was lost")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connectivity_failure_trips_and_cooldown_recovers() {
        let tracker = AvailabilityTracker::default();
        assert!(!tracker.is_temporarily_unavailable());

        assert!(tracker.record_failure(&connection_lost()));
        assert!(tracker.is_temporarily_unavailable());

        let snapshot = tracker.snapshot();
        assert!(snapshot.unavailable);
        assert_eq!(snapshot.retry_after_ms, Some(30_000));
        assert_eq!(
            snapshot.last_error.as_ref().and_then(|e| e.code.as_deref()),
            Some("08006")
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.snapshot().retry_after_ms, Some(20_000));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!tracker.is_temporarily_unavailable());
        let snapshot = tracker.snapshot();
        assert!(!snapshot.unavailable);
        assert_eq!(snapshot.retry_after_ms, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_has_one_ms_floor() {
        let tracker = AvailabilityTracker::default();
        tracker.mark_unavailable(&connection_lost(), Some(Duration::from_millis(5)));

        tokio::time::advance(Duration::from_micros(4_900)).await;
        assert_eq!(tracker.snapshot().retry_after_ms, Some(1));
        assert_eq!(tracker.retry_after(), Some(Duration::from_millis(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_connectivity_errors_are_ignored() {
        let tracker = AvailabilityTracker::default();

        let constraint = PersistenceError::new("23505", "duplicate key");
        assert!(!tracker.record_failure(&constraint));
        let deadlock = PersistenceError::new("40P01", "deadlock detected");
        assert!(!tracker.record_failure(&deadlock));

        assert!(!tracker.is_temporarily_unavailable());
        assert!(tracker.snapshot().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_success_restores_immediately() {
        let tracker = AvailabilityTracker::default();
        tracker.record_failure(&connection_lost());
        assert!(tracker.is_temporarily_unavailable());

        tracker.record_success();

        assert!(!tracker.is_temporarily_unavailable());
        let snapshot = tracker.snapshot();
        assert!(snapshot.last_success_at.is_some());
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_strategy_ignores_success_during_dwell() {
        let config = AvailabilityConfig::default().with_probe_strategy(ProbeStrategy::Cooldown);
        let tracker = AvailabilityTracker::new(config);
        tracker.record_failure(&connection_lost());

        tracker.record_success();
        assert!(tracker.is_temporarily_unavailable());
        assert!(tracker.snapshot().last_success_at.is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!tracker.is_temporarily_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_counts_within_sliding_window() {
        let config = AvailabilityConfig::default()
            .with_failure_threshold(3)
            .with_failure_window(Duration::from_secs(10));
        let tracker = AvailabilityTracker::new(config);

        tracker.record_failure(&connection_lost());
        tracker.record_failure(&connection_lost());
        assert!(!tracker.is_temporarily_unavailable());

        // First two failures slide out of the window.
        tokio::time::advance(Duration::from_secs(11)).await;
        tracker.record_failure(&connection_lost());
        assert!(!tracker.is_temporarily_unavailable());

        tracker.record_failure(&connection_lost());
        tracker.record_failure(&connection_lost());
        assert!(tracker.is_temporarily_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_records_outcomes() {
        let tracker = AvailabilityTracker::default();

        let result: Result<(), _> = tracker.observe(async { Err(connection_lost()) }).await;
        assert!(result.is_err());
        assert!(tracker.is_temporarily_unavailable());

        let value = tracker.observe(async { Ok::<_, PersistenceError>(7) }).await;
        assert_eq!(value, Ok(7));
        assert!(!tracker.is_temporarily_unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_unavailable_uses_explicit_retry_after() {
        let tracker = AvailabilityTracker::default();
        tracker.mark_unavailable(&connection_lost(), Some(Duration::from_secs(5)));
        assert_eq!(tracker.snapshot().retry_after_ms, Some(5_000));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!tracker.is_temporarily_unavailable());
    }

    #[test]
    fn test_probe_strategy_parses() {
        assert_eq!("Cooldown".parse::<ProbeStrategy>(), Ok(ProbeStrategy::Cooldown));
        assert_eq!(" optimistic ".parse::<ProbeStrategy>(), Ok(ProbeStrategy::Optimistic));
        assert!("eager".parse::<ProbeStrategy>().is_err());
    }

    #[test]
    fn test_config_normalizes_zero_values() {
        let config = AvailabilityConfig::default()
            .with_failure_threshold(0)
            .with_cooldown(Duration::ZERO);
        assert_eq!(config.failure_threshold, 1);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }
}
