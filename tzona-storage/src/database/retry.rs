//! Retry with backoff for transient persistence errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::classify::is_transient_error;
use crate::persistence::PersistenceError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Exponential,
    Fixed,
}

impl std::str::FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "fixed" => Ok(Self::Fixed),
            other => Err(format!("unknown backoff: {other}")),
        }
    }
}

/// Retry policy for persistence operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction in `[0, 1]`.
    pub jitter_ratio: f64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
            multiplier: 2.0,
            jitter_ratio: 0.25,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Environment variables:
    /// - `TZONA_DB_RETRY_MAX_ATTEMPTS` (default: 3)
    /// - `TZONA_DB_RETRY_INITIAL_DELAY_MS` (default: 200)
    /// - `TZONA_DB_RETRY_MAX_DELAY_MS` (default: 2000)
    /// - `TZONA_DB_RETRY_MULTIPLIER` (default: 2)
    /// - `TZONA_DB_RETRY_JITTER` (default: 0.25)
    /// - `TZONA_DB_RETRY_BACKOFF`: `exponential` or `fixed`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_attempts = std::env::var("TZONA_DB_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_attempts);

        let initial_delay = std::env::var("TZONA_DB_RETRY_INITIAL_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.initial_delay);

        let max_delay = std::env::var("TZONA_DB_RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay);

        let multiplier = std::env::var("TZONA_DB_RETRY_MULTIPLIER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.multiplier);

        let jitter_ratio = std::env::var("TZONA_DB_RETRY_JITTER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.jitter_ratio);

        let backoff = std::env::var("TZONA_DB_RETRY_BACKOFF")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            jitter_ratio,
            backoff,
        }
        .normalized()
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self.normalized()
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self.normalized()
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Clamp out-of-range values back to usable ones.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.max_attempts = self.max_attempts.max(1);
        if self.initial_delay.is_zero() {
            self.initial_delay = Duration::from_millis(1);
        }
        self.max_delay = self.max_delay.max(self.initial_delay);
        if !self.multiplier.is_finite() || self.multiplier <= 0.0 {
            self.multiplier = defaults.multiplier;
        }
        self.jitter_ratio = if self.jitter_ratio.is_finite() && self.jitter_ratio >= 0.0 {
            self.jitter_ratio.min(1.0)
        } else {
            defaults.jitter_ratio
        };
        self
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let ms = match self.backoff {
            Backoff::Fixed => initial_ms,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                (initial_ms * self.multiplier.powi(exponent)).round()
            }
        };
        Duration::from_millis(ms.min(max_ms).max(0.0) as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let base_ms = base.as_millis() as f64;
        let spread = base_ms * self.jitter_ratio;
        if spread <= 0.0 {
            return base;
        }
        let offset = rand::rng().random_range(-spread..=spread).round();
        Duration::from_millis((base_ms + offset).max(0.0) as u64)
    }

    /// Run `operation`, retrying transient errors until `max_attempts` is
    /// reached. Non-transient errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistenceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_transient_error(&err) => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = %operation_name,
                        code = err.code().unwrap_or("unknown"),
                        next_attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Transient database error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(2), Duration::from_millis(400));
        assert_eq!(policy.base_delay(3), Duration::from_millis(800));
        assert_eq!(policy.base_delay(5), Duration::from_millis(2000));
        assert_eq!(policy.base_delay(60), Duration::from_millis(2000));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::default().with_backoff(Backoff::Fixed);
        assert_eq!(policy.base_delay(1), Duration::from_millis(200));
        assert_eq!(policy.base_delay(4), Duration::from_millis(200));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay_for_attempt(2).as_millis();
            assert!((300..=500).contains(&delay), "{delay}");
        }
        let no_jitter = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(no_jitter.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_normalized_clamps_invalid_values() {
        let policy = RetryPolicy {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(100),
            multiplier: f64::NAN,
            jitter_ratio: 4.0,
            backoff: Backoff::Exponential,
        }
        .normalized();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_delay, Duration::from_millis(500));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.jitter_ratio, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result = policy
            .run("find_profile", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(PersistenceError::new("40001", "could not serialize access"))
                    } else {
                        Ok("profile")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("profile"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<(), _> = policy
            .run("ping", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PersistenceError::new("08006", "connection lost")) }
            })
            .await;

        assert_eq!(result.unwrap_err().code(), Some("08006"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_retries_non_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default().with_max_attempts(5);

        let result: Result<(), _> = policy
            .run("insert_session", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PersistenceError::new("23505", "duplicate key")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
