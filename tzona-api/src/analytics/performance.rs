//! Request performance aggregation.
//!
//! Server-side request samples and client-reported samples land in the same
//! collector so the dashboard reads one snapshot.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Bounds for the collector. Values are clamped by [`PerformanceConfig::normalized`].
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceConfig {
    pub latency_sample_size: usize,
    pub throughput_window: Duration,
    pub slow_request_threshold_ms: u64,
    pub slow_request_sample_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            latency_sample_size: 500,
            throughput_window: Duration::from_secs(60),
            slow_request_threshold_ms: 2000,
            slow_request_sample_size: 20,
        }
    }
}

impl PerformanceConfig {
    /// Environment variables:
    /// - `TZONA_PERF_LATENCY_SAMPLES`: Latency samples kept (default: 500, 10..=10000)
    /// - `TZONA_PERF_THROUGHPUT_WINDOW_MS`: Throughput window (default: 60000, 1s..=15min)
    /// - `TZONA_PERF_SLOW_THRESHOLD_MS`: Slow request threshold (default: 2000, 50..=600000)
    /// - `TZONA_PERF_SLOW_SAMPLES`: Slow requests kept (default: 20, 5..=500)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let read = |key: &str| std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok());
        Self {
            latency_sample_size: read("TZONA_PERF_LATENCY_SAMPLES")
                .map(|n| n as usize)
                .unwrap_or(defaults.latency_sample_size),
            throughput_window: read("TZONA_PERF_THROUGHPUT_WINDOW_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.throughput_window),
            slow_request_threshold_ms: read("TZONA_PERF_SLOW_THRESHOLD_MS")
                .unwrap_or(defaults.slow_request_threshold_ms),
            slow_request_sample_size: read("TZONA_PERF_SLOW_SAMPLES")
                .map(|n| n as usize)
                .unwrap_or(defaults.slow_request_sample_size),
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        self.latency_sample_size = self.latency_sample_size.clamp(10, 10_000);
        self.throughput_window = self
            .throughput_window
            .clamp(Duration::from_secs(1), Duration::from_secs(15 * 60));
        self.slow_request_threshold_ms = self.slow_request_threshold_ms.clamp(50, 10 * 60 * 1000);
        self.slow_request_sample_size = self.slow_request_sample_size.clamp(5, 500);
        self
    }
}

/// One finished request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRequest {
    pub method: String,
    pub path: String,
    /// Matched route template, when the router resolved one.
    pub route: Option<String>,
    pub status: u16,
    pub duration_ms: f64,
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowRequest {
    pub method: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    pub status_code: u16,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTotals {
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub p95_ms: f64,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputStats {
    pub window_ms: u64,
    pub per_second: f64,
    pub per_minute: f64,
    pub sample_count: usize,
}

/// Aggregate of one client-reported metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSampleStats {
    pub metric: String,
    pub samples: u64,
    pub avg: f64,
    pub last: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub totals: RequestTotals,
    pub error_rate: f64,
    pub latency: LatencyStats,
    pub throughput: ThroughputStats,
    pub slow_requests: Vec<SlowRequest>,
    pub client: Vec<ClientSampleStats>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ClientAggregate {
    samples: u64,
    sum: f64,
    last: f64,
}

#[derive(Default)]
struct PerformanceState {
    totals: RequestTotals,
    latency: VecDeque<f64>,
    throughput: VecDeque<Instant>,
    slow: VecDeque<SlowRequest>,
    client: BTreeMap<String, ClientAggregate>,
    last_updated_at: Option<DateTime<Utc>>,
}

/// Index of the 95th percentile in a sorted slice of `len` values.
pub(crate) fn p95_index(len: usize) -> usize {
    let rank = (len as f64 * 0.95).ceil() as usize;
    rank.saturating_sub(1).min(len.saturating_sub(1))
}

#[derive(Default)]
pub struct PerformanceCollector {
    config: PerformanceConfig,
    state: Mutex<PerformanceState>,
}

impl PerformanceCollector {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config: config.normalized(),
            state: Mutex::new(PerformanceState::default()),
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, PerformanceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_request_start(&self) {
        let mut state = self.state();
        state.totals.requests += 1;
        state.totals.in_flight += 1;
    }

    pub fn record_request_end(&self, request: &CompletedRequest) {
        let now = Instant::now();
        let timestamp = Utc::now();
        let duration_ms = if request.duration_ms.is_finite() {
            request.duration_ms.max(0.0)
        } else {
            0.0
        };

        let mut state = self.state();
        state.totals.in_flight = state.totals.in_flight.saturating_sub(1);
        state.totals.responses += 1;
        if request.status >= 500 {
            state.totals.errors += 1;
        }

        state.latency.push_back(duration_ms);
        while state.latency.len() > self.config.latency_sample_size {
            state.latency.pop_front();
        }

        state.throughput.push_back(now);
        self.prune_throughput(&mut state, now);

        if duration_ms >= self.config.slow_request_threshold_ms as f64 {
            state.slow.push_front(SlowRequest {
                method: request.method.clone(),
                path: request.path.clone(),
                route: request.route.clone(),
                status_code: request.status,
                duration_ms,
                timestamp,
                trace_id: request.trace_id.clone(),
            });
            state.slow.truncate(self.config.slow_request_sample_size);
        }

        state.last_updated_at = Some(timestamp);
    }

    /// Record a client-reported sample such as a web vital.
    pub fn record_client_sample(&self, metric: &str, value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut state = self.state();
        let aggregate = state.client.entry(metric.to_string()).or_default();
        aggregate.samples += 1;
        aggregate.sum += value;
        aggregate.last = value;
        state.last_updated_at = Some(Utc::now());
    }

    fn prune_throughput(&self, state: &mut PerformanceState, now: Instant) {
        while let Some(front) = state.throughput.front() {
            if now.duration_since(*front) > self.config.throughput_window {
                state.throughput.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let now = Instant::now();
        let mut state = self.state();
        self.prune_throughput(&mut state, now);

        let mut sorted: Vec<f64> = state.latency.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let latency = match (sorted.first(), sorted.last()) {
            (Some(min), Some(max)) => LatencyStats {
                avg_ms: sorted.iter().sum::<f64>() / sorted.len() as f64,
                p95_ms: sorted[p95_index(sorted.len())],
                min_ms: Some(*min),
                max_ms: Some(*max),
                samples: sorted.len(),
            },
            _ => LatencyStats {
                avg_ms: 0.0,
                p95_ms: 0.0,
                min_ms: None,
                max_ms: None,
                samples: 0,
            },
        };

        let window_secs = self.config.throughput_window.as_secs_f64().max(1.0);
        let per_second = state.throughput.len() as f64 / window_secs;

        PerformanceSnapshot {
            totals: state.totals.clone(),
            error_rate: if state.totals.responses == 0 {
                0.0
            } else {
                state.totals.errors as f64 / state.totals.responses as f64
            },
            latency,
            throughput: ThroughputStats {
                window_ms: self.config.throughput_window.as_millis() as u64,
                per_second,
                per_minute: per_second * 60.0,
                sample_count: state.throughput.len(),
            },
            slow_requests: state.slow.iter().cloned().collect(),
            client: state
                .client
                .iter()
                .map(|(metric, aggregate)| ClientSampleStats {
                    metric: metric.clone(),
                    samples: aggregate.samples,
                    avg: aggregate.sum / aggregate.samples.max(1) as f64,
                    last: aggregate.last,
                })
                .collect(),
            last_updated_at: state.last_updated_at,
        }
    }

    pub fn reset(&self) {
        *self.state() = PerformanceState::default();
    }
}
