//! Prometheus Metrics Definitions
//!
//! Defines all TZONA metrics with appropriate labels and types.
//! Exposes a /metrics endpoint for Prometheus scraping.

use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use tzona_storage::{CacheObserver, CacheTier};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Database operation latency buckets (seconds)
const DB_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<TzonaMetrics>> = Lazy::new(TzonaMetrics::new);

/// The registered metrics, or `None` when registration failed.
pub fn metrics() -> Option<&'static TzonaMetrics> {
    METRICS.as_ref().ok()
}

fn registration_error(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

/// Container for all TZONA metrics.
#[derive(Clone)]
pub struct TzonaMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Database operation counter - labels: operation, outcome
    pub db_operations_total: CounterVec,

    /// Database operation duration histogram - labels: operation
    pub db_operation_duration_seconds: HistogramVec,

    /// 1 while the database is reachable, 0 while the gate is closed
    pub db_available: Gauge,

    /// Cache lookup counter - labels: tier, outcome
    pub cache_lookups_total: CounterVec,

    /// SLA breach counter - labels: target
    pub sla_breaches_total: CounterVec,

    /// Client web vital reports - labels: metric, rating
    pub web_vitals_total: CounterVec,
}

impl TzonaMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        let metrics = Self {
            http_requests_total: register_counter_vec!(
                "tzona_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "tzona_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("http_request_duration_seconds", e))?,

            db_operations_total: register_counter_vec!(
                "tzona_db_operations_total",
                "Total number of database operations",
                &["operation", "outcome"]
            )
            .map_err(|e| registration_error("db_operations_total", e))?,

            db_operation_duration_seconds: register_histogram_vec!(
                "tzona_db_operation_duration_seconds",
                "Database operation duration in seconds",
                &["operation"],
                DB_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("db_operation_duration_seconds", e))?,

            db_available: register_gauge!(
                "tzona_db_available",
                "Whether the database is currently considered available"
            )
            .map_err(|e| registration_error("db_available", e))?,

            cache_lookups_total: register_counter_vec!(
                "tzona_cache_lookups_total",
                "Cache lookups by tier and outcome",
                &["tier", "outcome"]
            )
            .map_err(|e| registration_error("cache_lookups_total", e))?,

            sla_breaches_total: register_counter_vec!(
                "tzona_sla_breaches_total",
                "Samples recorded while a route was breaching its SLA",
                &["target"]
            )
            .map_err(|e| registration_error("sla_breaches_total", e))?,

            web_vitals_total: register_counter_vec!(
                "tzona_web_vitals_total",
                "Client-reported web vital samples",
                &["metric", "rating"]
            )
            .map_err(|e| registration_error("web_vitals_total", e))?,
        };
        metrics.db_available.set(1.0);
        Ok(metrics)
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, status_str.as_str()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record a database operation.
    pub fn record_db_operation(&self, operation: &str, success: bool, duration_secs: f64) {
        let outcome = if success { "success" } else { "error" };
        self.db_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.db_operation_duration_seconds
            .with_label_values(&[operation])
            .observe(duration_secs);
    }

    pub fn set_db_available(&self, available: bool) {
        self.db_available.set(if available { 1.0 } else { 0.0 });
    }

    pub fn record_sla_breach(&self, target: &str) {
        self.sla_breaches_total.with_label_values(&[target]).inc();
    }

    pub fn record_web_vital(&self, metric: &str, rating: &str) {
        self.web_vitals_total
            .with_label_values(&[metric, rating])
            .inc();
    }
}

impl CacheObserver for TzonaMetrics {
    fn on_hit(&self, tier: CacheTier) {
        self.cache_lookups_total
            .with_label_values(&[tier.as_str(), "hit"])
            .inc();
    }

    fn on_miss(&self) {
        self.cache_lookups_total
            .with_label_values(&["none", "miss"])
            .inc();
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/metrics",
    tag = "Observability",
    responses(
        (status = 200, description = "Prometheus metrics in text format", content_type = "text/plain"),
        (status = 500, description = "Failed to encode metrics"),
    ),
))]
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    fn registered() -> Result<&'static TzonaMetrics, String> {
        METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))
    }

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = registered()?;
        assert!(!metrics.http_requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_record_http_request() -> Result<(), String> {
        let metrics = registered()?;
        metrics.record_http_request("GET", "/api/sessions", 200, 0.015);
        let count = metrics
            .http_requests_total
            .with_label_values(&["GET", "/api/sessions", "200"])
            .get();
        assert!(count >= 1.0);
        Ok(())
    }

    #[test]
    fn test_db_availability_gauge() -> Result<(), String> {
        let metrics = registered()?;
        metrics.record_db_operation("find", false, 0.010);
        metrics.set_db_available(false);
        assert_eq!(metrics.db_available.get(), 0.0);
        metrics.set_db_available(true);
        assert_eq!(metrics.db_available.get(), 1.0);
        Ok(())
    }

    #[test]
    fn test_cache_observer_counts() -> Result<(), String> {
        let metrics = registered()?;
        let before = metrics
            .cache_lookups_total
            .with_label_values(&["memory", "hit"])
            .get();
        metrics.on_hit(CacheTier::Memory);
        metrics.on_miss();
        let after = metrics
            .cache_lookups_total
            .with_label_values(&["memory", "hit"])
            .get();
        assert!(after >= before + 1.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_metrics_handler_renders_text() -> Result<(), String> {
        registered()?.record_web_vital("LCP", "good");
        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| e.to_string())?;
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("tzona_web_vitals_total"));
        Ok(())
    }
}
