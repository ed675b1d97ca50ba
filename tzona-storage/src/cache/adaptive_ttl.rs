//! Adaptive TTL.
//!
//! Scopes mutated recently get shorter TTLs, quiet scopes longer ones. The
//! multiplier is `min` right after a mutation, `max` once the slow window
//! has passed, and interpolated linearly in between.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::strategy::CacheResource;

/// Scope name used when a resource has no scope.
pub const GLOBAL_SCOPE: &str = "__global";

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveTtlConfig {
    pub enabled: bool,
    pub fast_window: Duration,
    pub slow_window: Duration,
    pub min_multiplier: f64,
    pub max_multiplier: f64,
}

impl Default for AdaptiveTtlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fast_window: Duration::from_secs(120),
            slow_window: Duration::from_secs(3600),
            min_multiplier: 0.5,
            max_multiplier: 2.0,
        }
    }
}

impl AdaptiveTtlConfig {
    /// Environment variables:
    /// - `TZONA_CACHE_ADAPTIVE_TTL_ENABLED` (default: true)
    /// - `TZONA_CACHE_ADAPTIVE_TTL_FAST_WINDOW_SECS` (default: 120, 10..=3600)
    /// - `TZONA_CACHE_ADAPTIVE_TTL_SLOW_WINDOW_SECS` (default: 3600, 60..=86400)
    /// - `TZONA_CACHE_ADAPTIVE_TTL_MIN_MULTIPLIER` (default: 0.5, 0.1..=1)
    /// - `TZONA_CACHE_ADAPTIVE_TTL_MAX_MULTIPLIER` (default: 2, 1..=5)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("TZONA_CACHE_ADAPTIVE_TTL_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.enabled);

        let fast_window = std::env::var("TZONA_CACHE_ADAPTIVE_TTL_FAST_WINDOW_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.fast_window);

        let slow_window = std::env::var("TZONA_CACHE_ADAPTIVE_TTL_SLOW_WINDOW_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.slow_window);

        let min_multiplier = std::env::var("TZONA_CACHE_ADAPTIVE_TTL_MIN_MULTIPLIER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.min_multiplier);

        let max_multiplier = std::env::var("TZONA_CACHE_ADAPTIVE_TTL_MAX_MULTIPLIER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_multiplier);

        Self {
            enabled,
            fast_window,
            slow_window,
            min_multiplier,
            max_multiplier,
        }
        .normalized()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn normalized(mut self) -> Self {
        let fast = self.fast_window.as_secs().clamp(10, 3600);
        let slow = self.slow_window.as_secs().clamp(60, 86_400).max(fast + 1);
        self.fast_window = Duration::from_secs(fast);
        self.slow_window = Duration::from_secs(slow);
        self.min_multiplier = clamp_or(self.min_multiplier, 0.1, 1.0);
        self.max_multiplier = clamp_or(self.max_multiplier, 1.0, 5.0);
        self
    }
}

fn clamp_or(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        min
    } else {
        value.clamp(min, max)
    }
}

/// Mutation activity for one (resource, scope).
#[derive(Debug, Clone, Copy)]
pub struct ScopeActivity {
    pub last_mutation_at: Instant,
    /// Mutations since `window_start`. Resets once the slow window elapses.
    pub recent_mutation_count: u64,
    pub window_start: Instant,
    /// Multiplier from the last TTL computation.
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveTtlSnapshot {
    pub enabled: bool,
    pub tracked_scopes: usize,
}

#[derive(Debug, Default)]
pub struct AdaptiveTtl {
    config: AdaptiveTtlConfig,
    scopes: DashMap<(CacheResource, String), ScopeActivity>,
}

impl AdaptiveTtl {
    pub fn new(config: AdaptiveTtlConfig) -> Self {
        Self {
            config: config.normalized(),
            scopes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AdaptiveTtlConfig {
        &self.config
    }

    fn scope_key(scope: Option<&str>) -> String {
        scope
            .filter(|s| !s.is_empty())
            .unwrap_or(GLOBAL_SCOPE)
            .to_string()
    }

    pub fn record_mutation(&self, resource: CacheResource, scope: Option<&str>) {
        if !self.config.enabled {
            return;
        }
        let now = Instant::now();
        let slow_window = self.config.slow_window;
        self.scopes
            .entry((resource, Self::scope_key(scope)))
            .and_modify(|activity| {
                if now.duration_since(activity.window_start) >= slow_window {
                    activity.window_start = now;
                    activity.recent_mutation_count = 0;
                }
                activity.last_mutation_at = now;
                activity.recent_mutation_count += 1;
                activity.multiplier = self.config.min_multiplier;
            })
            .or_insert(ScopeActivity {
                last_mutation_at: now,
                recent_mutation_count: 1,
                window_start: now,
                multiplier: self.config.min_multiplier,
            });
    }

    pub fn activity(&self, resource: CacheResource, scope: Option<&str>) -> Option<ScopeActivity> {
        self.scopes
            .get(&(resource, Self::scope_key(scope)))
            .map(|activity| *activity)
    }

    /// Current multiplier, always within `[min, max]`.
    pub fn multiplier(&self, resource: CacheResource, scope: Option<&str>) -> f64 {
        if !self.config.enabled {
            return 1.0;
        }
        let key = (resource, Self::scope_key(scope));
        let Some(mut activity) = self.scopes.get_mut(&key) else {
            return 1.0;
        };
        let age = activity.last_mutation_at.elapsed();
        let multiplier = self.multiplier_for_age(age);
        activity.multiplier = multiplier;
        multiplier
    }

    fn multiplier_for_age(&self, age: Duration) -> f64 {
        let AdaptiveTtlConfig {
            fast_window,
            slow_window,
            min_multiplier,
            max_multiplier,
            ..
        } = self.config;
        if age <= fast_window {
            return min_multiplier;
        }
        if age >= slow_window {
            return max_multiplier;
        }
        let span = (slow_window - fast_window).as_secs_f64().max(1.0);
        let ratio = ((age - fast_window).as_secs_f64() / span).clamp(0.0, 1.0);
        (min_multiplier + ratio * (max_multiplier - min_multiplier)).clamp(min_multiplier, max_multiplier)
    }

    /// `max(1, round(base * multiplier))`; identity when disabled.
    pub fn ttl_seconds(&self, resource: CacheResource, scope: Option<&str>, base_seconds: u64) -> u64 {
        if !self.config.enabled {
            return base_seconds;
        }
        let multiplier = self.multiplier(resource, scope);
        ((base_seconds as f64 * multiplier).round() as u64).max(1)
    }

    pub fn snapshot(&self) -> AdaptiveTtlSnapshot {
        AdaptiveTtlSnapshot {
            enabled: self.config.enabled,
            tracked_scopes: self.scopes.len(),
        }
    }
}
