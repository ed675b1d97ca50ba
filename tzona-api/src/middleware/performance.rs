//! Request performance and SLA sampling.
//!
//! Each request gets a [`RequestSample`] that is finalised exactly once:
//! with the response status when the handler returns, or as 499 when the
//! future is dropped first (client went away, timeout layer fired).

use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use tokio::time::Instant;
use tracing::debug;

use crate::analytics::{Analytics, CompletedRequest};
use crate::telemetry::metrics;

/// Status recorded when a request is abandoned before it produced a response.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// In-flight request measurement.
pub struct RequestSample {
    analytics: Analytics,
    method: String,
    path: String,
    route: Option<String>,
    trace_id: Option<String>,
    started: Instant,
    finalized: AtomicBool,
}

impl RequestSample {
    /// Count the request as started.
    pub fn start(
        analytics: Analytics,
        method: impl Into<String>,
        path: impl Into<String>,
        route: Option<String>,
    ) -> Self {
        analytics.performance.record_request_start();
        Self {
            analytics,
            method: method.into(),
            path: path.into(),
            route,
            trace_id: tzona_core::trace_id(),
            started: Instant::now(),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Record the outcome. Returns `false` if already finalised.
    pub fn finalize(&self, status: u16) -> bool {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return false;
        }

        let elapsed = self.started.elapsed();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let completed = CompletedRequest {
            method: self.method.clone(),
            path: self.path.clone(),
            route: self.route.clone(),
            status,
            duration_ms,
            trace_id: self.trace_id.clone(),
        };
        self.analytics.performance.record_request_end(&completed);
        let evaluation =
            self.analytics
                .sla
                .record(&self.method, self.route.as_deref(), status, duration_ms);

        if let Some(m) = metrics() {
            let label = self.route.as_deref().unwrap_or("unmatched");
            m.record_http_request(&self.method, label, status, elapsed.as_secs_f64());
            if let Some(evaluation) = evaluation.as_ref().filter(|e| e.breached) {
                m.record_sla_breach(&evaluation.target_id);
            }
        }
        true
    }
}

impl Drop for RequestSample {
    fn drop(&mut self) {
        if self.finalize(CLIENT_CLOSED_REQUEST) {
            debug!(method = %self.method, path = %self.path, "Request dropped before completion");
        }
    }
}

pub async fn performance_middleware(
    State(analytics): State<Analytics>,
    matched: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let sample = RequestSample::start(
        analytics,
        request.method().as_str(),
        request.uri().path(),
        matched.map(|m| m.as_str().to_string()),
    );
    let response = next.run(request).await;
    sample.finalize(response.status().as_u16());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analytics() -> Analytics {
        Analytics::default()
    }

    #[tokio::test]
    async fn test_finalize_records_once() {
        let analytics = analytics();
        let sample = RequestSample::start(
            analytics.clone(),
            "GET",
            "/api/sessions",
            Some("/api/sessions".to_string()),
        );
        assert_eq!(analytics.performance.snapshot().totals.in_flight, 1);

        assert!(sample.finalize(200));
        assert!(!sample.finalize(500));
        drop(sample);

        let snapshot = analytics.performance.snapshot();
        assert_eq!(snapshot.totals.requests, 1);
        assert_eq!(snapshot.totals.responses, 1);
        assert_eq!(snapshot.totals.errors, 0);
        assert_eq!(snapshot.totals.in_flight, 0);

        let sla = analytics.sla.snapshot();
        let sessions = sla
            .targets
            .iter()
            .find(|t| t.id == "sessions")
            .map(|t| t.window_samples);
        assert_eq!(sessions, Some(1));
    }

    #[tokio::test]
    async fn test_drop_records_client_closed() {
        let analytics = analytics();
        let sample = RequestSample::start(analytics.clone(), "GET", "/api/sessions", None);
        drop(sample);

        let snapshot = analytics.performance.snapshot();
        assert_eq!(snapshot.totals.responses, 1);
        assert_eq!(snapshot.totals.in_flight, 0);
        assert_eq!(snapshot.totals.errors, 0);
    }
}
