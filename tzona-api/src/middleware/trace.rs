//! Trace context middleware.
//!
//! Outermost stage. Everything downstream, including error envelopes built
//! by later stages, observes the request's trace id through
//! [`tzona_core::trace_id`].

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};
use tzona_core::{ensure_trace_id, run_with_trace, TraceInit, REQUEST_ID_HEADER, TRACE_HEADER};

/// Inbound trace id: `x-trace-id`, then `x-request-id`.
pub fn inbound_trace_id(headers: &HeaderMap) -> Option<&str> {
    [TRACE_HEADER, REQUEST_ID_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
}

pub async fn trace_middleware(request: Request, next: Next) -> Response {
    let trace_id = ensure_trace_id(inbound_trace_id(request.headers()));
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        method = %method,
        path = %path,
    );

    let started = Instant::now();
    let mut response = run_with_trace(TraceInit::from(trace_id.as_str()), next.run(request))
        .instrument(span.clone())
        .await;

    match HeaderValue::from_str(&trace_id) {
        Ok(value) => {
            response.headers_mut().insert(TRACE_HEADER, value);
        }
        Err(_) => {
            warn!(trace_id = %trace_id, "Trace id is not a valid header value");
        }
    }

    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
    });
    response
}
