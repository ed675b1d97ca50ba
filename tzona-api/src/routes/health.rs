//! Health Check Endpoints
//!
//! - `/health/live`: process liveness, always 200
//! - `/health`, `/api/health`: readiness over the database, cache and
//!   downstream microservices
//!
//! These paths bypass the availability gate.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tzona_core::HealthStatus;

use crate::health::HealthService;
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct LivenessResponse {
    pub status: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health/live - Process liveness check
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/health/live",
    tag = "Health",
    responses(
        (status = 200, description = "Process is alive", body = LivenessResponse),
    ),
))]
pub async fn liveness(State(health): State<Arc<HealthService>>) -> impl IntoResponse {
    Json(LivenessResponse {
        status: "ok".to_string(),
        service: health.service_name().to_string(),
        timestamp: Utc::now(),
    })
}

/// HTTP status for a readiness result. Only `unhealthy` fails the probe.
pub fn readiness_status_code(status: HealthStatus) -> StatusCode {
    if status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /health - Readiness check
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    responses(
        (status = 200, description = "Ready, possibly degraded"),
        (status = 503, description = "A dependency is unhealthy"),
    ),
))]
pub async fn readiness(State(health): State<Arc<HealthService>>) -> impl IntoResponse {
    let trace_id = tzona_core::trace_id();
    let snapshot = health.snapshot(trace_id.as_deref()).await;
    let status = readiness_status_code(snapshot.status);

    let mut body = serde_json::to_value(&snapshot).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to serialize health snapshot");
        json!({ "status": snapshot.status })
    });
    if let Value::Object(map) = &mut body {
        map.insert("meta".into(), json!({ "traceId": trace_id }));
    }
    (status, Json(body))
}

// ============================================================================
// ROUTER
// ============================================================================

/// Health routes, mounted at the root.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health/live", get(liveness))
        .route("/health", get(readiness))
        .route("/api/health", get(readiness))
}
