//! TZONA Telemetry - Observability Infrastructure
//!
//! Structured JSON logging through `tracing-subscriber` and Prometheus
//! metrics for the API layer.

pub mod metrics;
pub mod tracer;

pub use metrics::{metrics, metrics_handler, TzonaMetrics, METRICS};
pub use tracer::{init_tracer, TelemetryConfig, DEFAULT_LOG_FILTER};
