//! Readiness aggregation.
//!
//! Folds the database availability snapshot, the cache tier mode and
//! downstream microservice probes into one [`HealthSnapshot`]. Snapshots are
//! reused for `health_cache_ttl` so probes do not run on every poll.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;
use tzona_core::{DependencyStatus, HealthStatus, TRACE_HEADER};
use tzona_storage::{AvailabilitySnapshot, AvailabilityTracker, CacheStore, FallbackMode};

use crate::analytics::{Analytics, PerformanceSnapshot, SlaSnapshot, SlowQuerySnapshot, WebVitalsSnapshot};
use crate::config::{ApiConfig, MicroserviceTarget};

// ============================================================================
// SNAPSHOT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub status: DependencyStatus,
    pub mode: FallbackMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CacheHealth {
    pub fn from_store(store: &CacheStore) -> Self {
        let fallback = store.fallback().snapshot();
        Self {
            status: fallback.mode.dependency_status(),
            mode: fallback.mode,
            reason: fallback.reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MicroserviceHealth {
    pub status: DependencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MicroserviceHealth {
    pub fn ok(latency_ms: u64, upstream_status: Option<String>) -> Self {
        Self {
            status: DependencyStatus::Ok,
            latency_ms: Some(latency_ms),
            checked_at: Utc::now(),
            upstream_status,
            error_code: None,
            message: None,
        }
    }

    pub fn unavailable(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: DependencyStatus::Unhealthy,
            latency_ms: Some(latency_ms),
            checked_at: Utc::now(),
            upstream_status: None,
            error_code: Some("microservice_unavailable".to_string()),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub database: AvailabilitySnapshot,
    pub cache: CacheHealth,
    pub microservices: BTreeMap<String, MicroserviceHealth>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub performance: PerformanceSnapshot,
    pub sla: SlaSnapshot,
    pub slow_queries: SlowQuerySnapshot,
    pub web_vitals: WebVitalsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_ms: u64,
    pub dependencies: DependencyHealth,
    pub metrics: HealthMetrics,
}

impl HealthSnapshot {
    pub fn dependency_statuses(&self) -> Vec<DependencyStatus> {
        let mut statuses = vec![
            self.dependencies.database.dependency_status(),
            self.dependencies.cache.status,
        ];
        statuses.extend(self.dependencies.microservices.values().map(|m| m.status));
        statuses
    }
}

// ============================================================================
// PROBES
// ============================================================================

/// A downstream dependency checked on readiness.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, trace_id: Option<&str>) -> MicroserviceHealth;
}

/// Probes `GET {base_url}/api/health` with a timeout.
pub struct HttpProbe {
    target: MicroserviceTarget,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(target: MicroserviceTarget, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            target,
            client,
            timeout,
        }
    }
}

#[async_trait]
impl DependencyProbe for HttpProbe {
    fn name(&self) -> &str {
        &self.target.name
    }

    async fn check(&self, trace_id: Option<&str>) -> MicroserviceHealth {
        let started = Instant::now();
        let mut request = self.client.get(self.target.health_url()).timeout(self.timeout);
        if let Some(trace_id) = trace_id {
            request = request.header(TRACE_HEADER, trace_id);
        }

        let result = request.send().await.and_then(|r| r.error_for_status());
        let elapsed = || started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                let upstream = response
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("status").and_then(|s| s.as_str()).map(str::to_owned));
                MicroserviceHealth::ok(elapsed(), Some(upstream.unwrap_or_else(|| "ok".to_string())))
            }
            Err(e) => {
                warn!(service = %self.target.name, error = %e, "Microservice health probe failed");
                MicroserviceHealth::unavailable(elapsed(), e.to_string())
            }
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct HealthService {
    service_name: String,
    started_at: Instant,
    ttl: Duration,
    availability: Arc<AvailabilityTracker>,
    cache: Arc<CacheStore>,
    analytics: Analytics,
    probes: Vec<Arc<dyn DependencyProbe>>,
    cached: Mutex<Option<(Instant, HealthSnapshot)>>,
}

impl HealthService {
    pub fn new(
        config: &ApiConfig,
        availability: Arc<AvailabilityTracker>,
        cache: Arc<CacheStore>,
        analytics: Analytics,
    ) -> Self {
        Self {
            service_name: config.service_name.clone(),
            started_at: Instant::now(),
            ttl: config.health_cache_ttl,
            availability,
            cache,
            analytics,
            probes: Vec::new(),
            cached: Mutex::new(None),
        }
    }

    /// Add an HTTP probe per configured microservice.
    pub fn with_http_probes(mut self, config: &ApiConfig) -> Self {
        let client = reqwest::Client::new();
        for target in &config.microservices {
            self.probes.push(Arc::new(HttpProbe::new(
                target.clone(),
                client.clone(),
                config.probe_timeout,
            )));
        }
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn cached(&self) -> MutexGuard<'_, Option<(Instant, HealthSnapshot)>> {
        self.cached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn invalidate(&self) {
        *self.cached() = None;
    }

    /// Current snapshot, reusing a fresh cached one.
    pub async fn snapshot(&self, trace_id: Option<&str>) -> HealthSnapshot {
        let now = Instant::now();
        if let Some((at, snapshot)) = self.cached().as_ref() {
            if now.duration_since(*at) < self.ttl {
                return snapshot.clone();
            }
        }

        let snapshot = self.collect(trace_id).await;
        *self.cached() = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    async fn collect(&self, trace_id: Option<&str>) -> HealthSnapshot {
        let checks = join_all(self.probes.iter().map(|probe| async move {
            (probe.name().to_string(), probe.check(trace_id).await)
        }))
        .await;

        let dependencies = DependencyHealth {
            database: self.availability.snapshot(),
            cache: CacheHealth::from_store(&self.cache),
            microservices: checks.into_iter().collect(),
        };
        let metrics = HealthMetrics {
            performance: self.analytics.performance.snapshot(),
            sla: self.analytics.sla.snapshot(),
            slow_queries: self.analytics.slow_queries.snapshot(),
            web_vitals: self.analytics.web_vitals.snapshot(),
        };

        let mut snapshot = HealthSnapshot {
            status: HealthStatus::Ok,
            service: self.service_name.clone(),
            timestamp: Utc::now(),
            uptime_ms: self.uptime().as_millis() as u64,
            dependencies,
            metrics,
        };
        snapshot.status = HealthStatus::aggregate(snapshot.dependency_statuses());
        snapshot
    }
}
