//! Remote cache fallback state.
//!
//! Tracks consecutive remote-tier failures. After `failure_threshold` of them
//! the store bypasses the remote tier until the cooldown expires, then probes
//! it again (`Unknown`). A remote success always returns to `Ready`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};
use tzona_core::DependencyStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    /// No remote tier configured.
    Disabled,
    /// Remote tier not yet confirmed, or probing after a cooldown.
    Unknown,
    Ready,
    /// Remote tier bypassed until the cooldown expires.
    Fallback,
}

impl FallbackMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackMode::Disabled => "disabled",
            FallbackMode::Unknown => "unknown",
            FallbackMode::Ready => "ready",
            FallbackMode::Fallback => "fallback",
        }
    }

    /// Health mapping. Running without a remote tier is not a fault.
    pub fn dependency_status(self) -> DependencyStatus {
        match self {
            FallbackMode::Disabled => DependencyStatus::Disabled,
            FallbackMode::Unknown => DependencyStatus::Unknown,
            FallbackMode::Ready => DependencyStatus::Ok,
            FallbackMode::Fallback => DependencyStatus::Degraded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallbackSnapshot {
    pub enabled: bool,
    pub mode: FallbackMode,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct FallbackState {
    mode: FallbackMode,
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    fallback_until: Option<Instant>,
    reason: Option<String>,
}

#[derive(Debug)]
pub struct CacheFallback {
    enabled: bool,
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<FallbackState>,
}

impl CacheFallback {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            enabled: true,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(FallbackState {
                mode: FallbackMode::Unknown,
                failure_count: 0,
                last_failure_at: None,
                fallback_until: None,
                reason: None,
            }),
        }
    }

    /// Fallback tracking for a store without a remote tier.
    pub fn disabled() -> Self {
        let mut fallback = Self::new(1, Duration::ZERO);
        fallback.enabled = false;
        fallback.lock().mode = FallbackMode::Disabled;
        fallback
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, FallbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the remote tier should currently be bypassed. Moves an expired
    /// fallback back to `Unknown`.
    pub fn is_active(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let mut state = self.lock();
        Self::expire(&mut state, Instant::now());
        state.mode == FallbackMode::Fallback
    }

    pub fn mode(&self) -> FallbackMode {
        let mut state = self.lock();
        Self::expire(&mut state, Instant::now());
        state.mode
    }

    pub fn record_failure(&self, reason: &str) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        let mut state = self.lock();
        state.failure_count += 1;
        state.last_failure_at = Some(Utc::now());
        state.reason = Some(reason.to_string());

        if state.failure_count < self.failure_threshold {
            return;
        }
        if state.mode == FallbackMode::Fallback
            && state.fallback_until.is_some_and(|until| until > now)
        {
            return;
        }
        state.mode = FallbackMode::Fallback;
        state.failure_count = 0;
        state.fallback_until = Some(now + self.cooldown);
        warn!(
            reason,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "Remote cache unavailable; using in-memory cache only"
        );
    }

    pub fn record_success(&self) {
        if !self.enabled {
            return;
        }
        let mut state = self.lock();
        if state.mode == FallbackMode::Ready && state.failure_count == 0 {
            return;
        }
        let previous = state.mode;
        state.mode = FallbackMode::Ready;
        state.failure_count = 0;
        state.last_failure_at = None;
        state.fallback_until = None;
        state.reason = None;
        if previous == FallbackMode::Fallback {
            info!("Remote cache connection restored");
        }
    }

    pub fn snapshot(&self) -> FallbackSnapshot {
        let now = Instant::now();
        let mut state = self.lock();
        Self::expire(&mut state, now);
        FallbackSnapshot {
            enabled: self.enabled,
            mode: state.mode,
            failure_count: state.failure_count,
            last_failure_at: state.last_failure_at,
            fallback_remaining_ms: state
                .fallback_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64),
            reason: state.reason.clone(),
        }
    }

    fn expire(state: &mut FallbackState, now: Instant) {
        if state.mode == FallbackMode::Fallback
            && state.fallback_until.is_some_and(|until| now >= until)
        {
            state.mode = FallbackMode::Unknown;
            state.fallback_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_activate_fallback_until_cooldown() {
        let fallback = CacheFallback::new(3, Duration::from_secs(60));
        assert_eq!(fallback.mode(), FallbackMode::Unknown);

        fallback.record_failure("get failed");
        fallback.record_failure("get failed");
        assert!(!fallback.is_active());
        fallback.record_failure("set failed");
        assert!(fallback.is_active());
        assert_eq!(fallback.snapshot().reason.as_deref(), Some("set failed"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(fallback.is_active());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!fallback.is_active());
        assert_eq!(fallback.mode(), FallbackMode::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_to_ready() {
        let fallback = CacheFallback::new(3, Duration::from_secs(60));
        fallback.record_failure("boom");
        fallback.record_failure("boom");
        fallback.record_success();
        assert_eq!(fallback.mode(), FallbackMode::Ready);

        // Counter restarted, so two more failures are not enough.
        fallback.record_failure("boom");
        fallback.record_failure("boom");
        assert!(!fallback.is_active());
    }

    #[test]
    fn test_disabled_never_activates() {
        let fallback = CacheFallback::disabled();
        for _ in 0..10 {
            fallback.record_failure("boom");
        }
        assert!(!fallback.is_active());
        assert_eq!(fallback.mode(), FallbackMode::Disabled);
        assert!(!fallback.snapshot().enabled);
        assert_eq!(fallback.mode().dependency_status(), DependencyStatus::Disabled);
    }
}
