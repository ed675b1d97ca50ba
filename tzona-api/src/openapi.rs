//! OpenAPI Specification for the TZONA API
//!
//! Generated by utoipa from the route annotations and schema derives.

use utoipa::OpenApi;

use crate::analytics::{WebVitalMetric, WebVitalRating, WebVitalReport};
use crate::error::{ApiError, ErrorCategory, ErrorClassification, ErrorCode};
use crate::routes::{health, metrics};
use crate::telemetry::metrics as prometheus_metrics;
use tzona_core::{DependencyStatus, HealthCheck, HealthStatus, TraceContext};

/// OpenAPI document for the TZONA API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "TZONA Training Area API",
        description = "Request pipeline, health/readiness and metrics surfaces of the TZONA training backend",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT"),
        contact(name = "TZONA", url = "https://tzona.fit")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local Development")
    ),
    tags(
        (name = "Health", description = "Liveness and readiness"),
        (name = "Metrics", description = "Client metric ingestion and collector snapshots"),
        (name = "Observability", description = "Prometheus exposition")
    ),
    paths(
        health::liveness,
        health::readiness,
        metrics::report_web_vital,
        metrics::dashboard,
        prometheus_metrics::metrics_handler,
    ),
    components(schemas(
        health::LivenessResponse,
        WebVitalReport,
        WebVitalMetric,
        WebVitalRating,
        ApiError,
        ErrorCode,
        ErrorCategory,
        ErrorClassification,
        HealthStatus,
        DependencyStatus,
        HealthCheck,
        TraceContext,
    ))
)]
pub struct ApiDoc;
