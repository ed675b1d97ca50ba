//! Metrics ingestion and dashboard routes.

use axum::{
    extract::{rejection::JsonRejection, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use tzona_storage::{AvailabilitySnapshot, CacheStoreSnapshot};

use crate::analytics::{
    Analytics, PerformanceSnapshot, SlaSnapshot, SlowQuerySnapshot, WebVitalRating,
    WebVitalReport, WebVitalsSnapshot,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::telemetry::metrics;

pub const WEB_VITALS_RESOURCE: &str = "metrics:web-vitals";
pub const DASHBOARD_RESOURCE: &str = "metrics:dashboard";

/// Record one validated report in every collector and log it.
pub fn ingest_web_vital(analytics: &Analytics, report: &WebVitalReport) {
    analytics.web_vitals.record(report);
    analytics
        .performance
        .record_client_sample(report.metric.as_str(), report.value);
    if let Some(m) = metrics() {
        m.record_web_vital(report.metric.as_str(), report.rating.as_str());
    }

    let page = report.page.as_deref().unwrap_or("unknown");
    let session_id = report.session_id.as_deref().unwrap_or("");
    match report.rating {
        WebVitalRating::Poor => error!(
            metric = %report.metric,
            value = report.value,
            rating = report.rating.as_str(),
            page,
            session_id,
            severity = "critical",
            "Web vital reported"
        ),
        WebVitalRating::NeedsImprovement => warn!(
            metric = %report.metric,
            value = report.value,
            rating = report.rating.as_str(),
            page,
            session_id,
            severity = "warning",
            "Web vital reported"
        ),
        WebVitalRating::Good => info!(
            metric = %report.metric,
            value = report.value,
            rating = report.rating.as_str(),
            page,
            session_id,
            severity = "info",
            "Web vital reported"
        ),
    }
}

/// POST /api/metrics/web-vitals - Ingest a client web vital
#[cfg_attr(feature = "openapi", utoipa::path(
    post,
    path = "/api/metrics/web-vitals",
    tag = "Metrics",
    request_body = WebVitalReport,
    responses(
        (status = 200, description = "Report accepted"),
        (status = 422, description = "Invalid report"),
    ),
))]
pub async fn report_web_vital(
    State(analytics): State<Analytics>,
    payload: Result<Json<WebVitalReport>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(report) = payload.map_err(|rejection| {
        ApiError::validation_failed(rejection.body_text()).with_resource(WEB_VITALS_RESOURCE)
    })?;
    if !report.value.is_finite() {
        return Err(ApiError::validation_failed("value must be a finite number")
            .with_resource(WEB_VITALS_RESOURCE));
    }

    ingest_web_vital(&analytics, &report);

    Ok(Json(json!({
        "success": true,
        "data": { "accepted": true },
        "meta": { "traceId": tzona_core::trace_id(), "resource": WEB_VITALS_RESOURCE },
    })))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub performance: PerformanceSnapshot,
    pub sla: SlaSnapshot,
    pub slow_queries: SlowQuerySnapshot,
    pub web_vitals: WebVitalsSnapshot,
    pub database: AvailabilitySnapshot,
    pub cache: CacheStoreSnapshot,
}

/// GET /api/metrics/dashboard - Collector snapshots
#[cfg_attr(feature = "openapi", utoipa::path(
    get,
    path = "/api/metrics/dashboard",
    tag = "Metrics",
    responses(
        (status = 200, description = "Performance, SLA, slow-query, web-vitals and availability snapshots"),
    ),
))]
pub async fn dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let data = DashboardData {
        performance: state.analytics.performance.snapshot(),
        sla: state.analytics.sla.snapshot(),
        slow_queries: state.analytics.slow_queries.snapshot(),
        web_vitals: state.analytics.web_vitals.snapshot(),
        database: state.availability().snapshot(),
        cache: state.cache.store().snapshot(),
    };
    Json(json!({
        "success": true,
        "data": data,
        "meta": { "traceId": tzona_core::trace_id(), "resource": DASHBOARD_RESOURCE },
    }))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/web-vitals", post(report_web_vital))
        .route("/dashboard", get(dashboard))
}
