//! Database availability gate.
//!
//! While the tracker reports the database as temporarily unavailable, every
//! non-bypassed request is answered with 503 before any handler runs.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::debug;
use tzona_storage::{AvailabilitySnapshot, AvailabilityTracker};

use crate::error::ApiError;

/// State for [`availability_gate_middleware`].
#[derive(Clone)]
pub struct AvailabilityGateState {
    tracker: Arc<AvailabilityTracker>,
    bypass_paths: Arc<HashSet<String>>,
}

impl AvailabilityGateState {
    pub fn new(tracker: Arc<AvailabilityTracker>, bypass_paths: &[String]) -> Self {
        Self {
            tracker,
            bypass_paths: Arc::new(bypass_paths.iter().cloned().collect()),
        }
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.contains(path)
    }
}

/// Resource label for a gated path: `/api/sessions/42` becomes `sessions/42`.
pub fn gate_resource(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let resource = trimmed.strip_prefix("api/").unwrap_or(trimmed);
    if resource.is_empty() {
        "http_request".to_string()
    } else {
        resource.to_string()
    }
}

/// `Retry-After` seconds, rounded up and never below one.
pub fn retry_after_secs(retry_after_ms: u64) -> u64 {
    retry_after_ms.div_ceil(1000).max(1)
}

/// The 503 for a closed gate, or `None` when `snapshot` shows the database
/// available. A rejection always carries `Retry-After`.
pub fn gate_rejection(snapshot: AvailabilitySnapshot, path: &str) -> Option<ApiError> {
    if !snapshot.unavailable {
        return None;
    }
    let resource = gate_resource(path);
    let retry_after_ms = snapshot.retry_after_ms.unwrap_or(1);
    debug!(resource = %resource, retry_after_ms, "Database gate closed");

    let mut error = ApiError::database_unavailable(resource)
        .with_retry_after(retry_after_secs(retry_after_ms));
    if let Some(last) = snapshot.last_error {
        error = error.with_details(json!({ "code": last.code, "message": last.message }));
    }
    Some(error)
}

pub async fn availability_gate_middleware(
    State(state): State<AvailabilityGateState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if state.is_bypassed(path) || !state.tracker.is_temporarily_unavailable() {
        return next.run(request).await;
    }

    // Decide from one snapshot; the cooldown may have lapsed since the check.
    match gate_rejection(state.tracker.snapshot(), path) {
        Some(error) => error.into_response(),
        None => next.run(request).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header::RETRY_AFTER, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use std::time::Duration;
    use tower::ServiceExt;
    use tzona_storage::{AvailabilityConfig, PersistenceError};

    fn app(tracker: Arc<AvailabilityTracker>) -> Router {
        let gate = AvailabilityGateState::new(tracker, &["/health".to_string()]);
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/sessions", get(|| async { "sessions" }))
            .layer(middleware::from_fn_with_state(gate, availability_gate_middleware))
    }

    fn get_request(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_gate_resource() {
        assert_eq!(gate_resource("/api/sessions"), "sessions");
        assert_eq!(gate_resource("/api/profile/summary"), "profile/summary");
        assert_eq!(gate_resource("/internal/jobs"), "internal/jobs");
        assert_eq!(gate_resource("/"), "http_request");
        assert_eq!(gate_resource("/api/"), "http_request");
    }

    #[test]
    fn test_retry_after_rounding() {
        assert_eq!(retry_after_secs(0), 1);
        assert_eq!(retry_after_secs(999), 1);
        assert_eq!(retry_after_secs(1000), 1);
        assert_eq!(retry_after_secs(1001), 2);
        assert_eq!(retry_after_secs(4500), 5);
    }

    fn outage(retry_after_ms: Option<u64>) -> AvailabilitySnapshot {
        AvailabilitySnapshot {
            unavailable: true,
            retry_after_ms,
            last_error: None,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    #[test]
    fn test_rejection_always_carries_retry_after() {
        let available = AvailabilitySnapshot {
            unavailable: false,
            ..outage(None)
        };
        assert!(gate_rejection(available, "/api/sessions").is_none());

        let error = gate_rejection(outage(None), "/api/sessions").unwrap();
        assert_eq!(error.retry_after_secs, Some(1));
        assert_eq!(error.resource.as_deref(), Some("sessions"));

        let error = gate_rejection(outage(Some(4500)), "/api/sessions").unwrap();
        assert_eq!(error.retry_after_secs, Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_cooldown_passes_through() {
        let tracker = Arc::new(AvailabilityTracker::new(AvailabilityConfig::default()));
        tracker.mark_unavailable(
            &PersistenceError::new("08006", "connection to server was lost"),
            Some(Duration::from_millis(10)),
        );
        tokio::time::advance(Duration::from_millis(11)).await;

        let response = app(tracker).oneshot(get_request("/api/sessions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[tokio::test]
    async fn test_open_gate_passes_through() {
        let tracker = Arc::new(AvailabilityTracker::new(AvailabilityConfig::default()));
        let response = app(tracker).oneshot(get_request("/api/sessions")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_gate_short_circuits() {
        let tracker = Arc::new(AvailabilityTracker::new(AvailabilityConfig::default()));
        tracker.mark_unavailable(
            &PersistenceError::new("08006", "connection to server was lost"),
            Some(Duration::from_millis(4500)),
        );

        let response = app(tracker.clone())
            .oneshot(get_request("/api/sessions"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "5");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["error"], "service_unavailable");
        assert_eq!(body["error"]["category"], "dependencies");
        assert_eq!(body["error"]["resource"], "sessions");
        assert_eq!(body["error"]["details"]["code"], "08006");

        let bypassed = app(tracker).oneshot(get_request("/health")).await.unwrap();
        assert_eq!(bypassed.status(), StatusCode::OK);
    }
}
