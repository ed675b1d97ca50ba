//! Slow database query tracking.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: u64 = 250;
pub const SLOW_QUERY_HISTORY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuerySample {
    pub target: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowQuerySnapshot {
    pub total: u64,
    pub last_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<f64>,
    pub last_target: Option<String>,
    pub threshold_ms: u64,
    pub recent_count: usize,
    pub recent_p95_ms: Option<f64>,
}

#[derive(Default)]
struct SlowQueryState {
    total: u64,
    last: Option<SlowQuerySample>,
    history: VecDeque<f64>,
}

/// Counts queries slower than the threshold and keeps a bounded history.
pub struct SlowQueryMonitor {
    threshold_ms: u64,
    state: Mutex<SlowQueryState>,
}

impl Default for SlowQueryMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_SLOW_QUERY_THRESHOLD_MS)
    }
}

impl SlowQueryMonitor {
    pub fn new(threshold_ms: u64) -> Self {
        Self {
            threshold_ms: threshold_ms.max(1),
            state: Mutex::new(SlowQueryState::default()),
        }
    }

    /// Environment variables:
    /// - `TZONA_SLOW_QUERY_THRESHOLD_MS`: Threshold (default: 250)
    pub fn from_env() -> Self {
        let threshold = std::env::var("TZONA_SLOW_QUERY_THRESHOLD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SLOW_QUERY_THRESHOLD_MS);
        Self::new(threshold)
    }

    pub fn threshold_ms(&self) -> u64 {
        self.threshold_ms
    }

    fn state(&self) -> MutexGuard<'_, SlowQueryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a query duration. Returns whether it counted as slow.
    pub fn observe(&self, target: &str, duration_ms: f64) -> bool {
        if duration_ms.is_nan() || duration_ms < self.threshold_ms as f64 {
            return false;
        }
        warn!(
            target_name = %target,
            duration_ms,
            threshold_ms = self.threshold_ms,
            "Slow query"
        );

        let mut state = self.state();
        state.total += 1;
        state.history.push_back(duration_ms);
        while state.history.len() > SLOW_QUERY_HISTORY {
            state.history.pop_front();
        }
        state.last = Some(SlowQuerySample {
            target: target.to_string(),
            duration_ms,
            timestamp: Utc::now(),
        });
        true
    }

    pub fn snapshot(&self) -> SlowQuerySnapshot {
        let state = self.state();
        let recent_p95_ms = if state.history.is_empty() {
            None
        } else {
            let mut sorted: Vec<f64> = state.history.iter().copied().collect();
            sorted.sort_by(f64::total_cmp);
            let index = ((0.95 * (sorted.len() - 1) as f64).floor() as usize).min(sorted.len() - 1);
            Some(sorted[index])
        };

        SlowQuerySnapshot {
            total: state.total,
            last_at: state.last.as_ref().map(|s| s.timestamp),
            last_duration_ms: state.last.as_ref().map(|s| s.duration_ms),
            last_target: state.last.as_ref().map(|s| s.target.clone()),
            threshold_ms: self.threshold_ms,
            recent_count: state.history.len(),
            recent_p95_ms,
        }
    }

    pub fn reset(&self) {
        *self.state() = SlowQueryState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_queries_are_ignored() {
        let monitor = SlowQueryMonitor::default();
        assert!(!monitor.observe("sessions.find", 249.9));
        assert!(!monitor.observe("sessions.find", f64::NAN));
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.recent_p95_ms, None);
        assert_eq!(snapshot.threshold_ms, 250);
    }

    #[test]
    fn test_records_last_sample_and_p95() {
        let monitor = SlowQueryMonitor::default();
        for ms in 1..=20 {
            monitor.observe("profiles.find", 250.0 + ms as f64);
        }
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total, 20);
        assert_eq!(snapshot.last_duration_ms, Some(270.0));
        assert_eq!(snapshot.last_target.as_deref(), Some("profiles.find"));
        // floor(0.95 * 19) = 18
        assert_eq!(snapshot.recent_p95_ms, Some(269.0));
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = SlowQueryMonitor::new(10);
        for _ in 0..(SLOW_QUERY_HISTORY + 50) {
            monitor.observe("x", 20.0);
        }
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.total, (SLOW_QUERY_HISTORY + 50) as u64);
        assert_eq!(snapshot.recent_count, SLOW_QUERY_HISTORY);

        monitor.reset();
        assert_eq!(monitor.snapshot().total, 0);
    }
}
