//! HTTP Routes Module
//!
//! - Health checks (liveness and readiness)
//! - Metrics ingestion and the analytics dashboard
//! - Prometheus exposition and the OpenAPI document
//!
//! [`build_router`] wraps every route in the request pipeline.

pub mod health;
pub mod metrics;

use axum::{middleware::from_fn, middleware::from_fn_with_state, routing::get, Router};
use tower_http::timeout::TimeoutLayer;

use crate::middleware::{
    availability_gate_middleware, performance_middleware, trace_middleware, url_input_middleware,
    AvailabilityGateState,
};
use crate::state::AppState;
use crate::telemetry::metrics_handler;

pub use health::create_router as health_router;
pub use metrics::create_router as metrics_router;

// ============================================================================
// OPENAPI ENDPOINT
// ============================================================================

/// Handler for /openapi.json endpoint.
#[cfg(feature = "openapi")]
async fn openapi_json() -> impl axum::response::IntoResponse {
    use utoipa::OpenApi;
    axum::Json(crate::openapi::ApiDoc::openapi())
}

// ============================================================================
// ROUTER
// ============================================================================

/// Routes without the pipeline.
pub fn create_routes() -> Router<AppState> {
    let router = Router::new()
        .merge(health::create_router())
        .nest("/api/metrics", metrics::create_router())
        .route("/metrics", get(metrics_handler));

    #[cfg(feature = "openapi")]
    let router = router.route("/openapi.json", get(openapi_json));

    router
}

/// Build the service router with the full middleware pipeline.
///
/// # Middleware Order (outer to inner)
/// 1. Trace - trace id scope, response header, completion log
/// 2. Request timeout
/// 3. Availability gate - 503 while the database is down
/// 4. URL input - sanitised params and query (matched routes only)
/// 5. Performance - latency and SLA sampling (matched routes only)
pub fn build_router(state: AppState) -> Router {
    build_router_with(create_routes(), state)
}

/// Wrap caller-supplied routes in the pipeline. Route layers only apply to
/// routes present in `routes`.
pub fn build_router_with(routes: Router<AppState>, state: AppState) -> Router {
    let gate = AvailabilityGateState::new(
        state.availability().clone(),
        &state.config.availability_bypass_paths,
    );

    routes
        .route_layer(from_fn_with_state(
            state.analytics.clone(),
            performance_middleware,
        ))
        .route_layer(from_fn(url_input_middleware))
        .layer(from_fn_with_state(gate, availability_gate_middleware))
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(from_fn(trace_middleware))
        .with_state(state)
}
