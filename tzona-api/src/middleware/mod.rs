//! Request middleware pipeline.
//!
//! - `trace`: trace id propagation and request logging
//! - `availability`: 503 fast-fail while the database is down
//! - `url_input`: path parameter and query value sanitising
//! - `performance`: latency, throughput and SLA sampling
//!
//! # Middleware Order
//!
//! ```ignore
//! Router::new()
//!     .route("/api/sessions/:id", get(handler))
//!     // Route layers run only for matched routes and see path params
//!     .route_layer(middleware::from_fn_with_state(analytics, performance_middleware))
//!     .route_layer(middleware::from_fn(url_input_middleware))
//!     .layer(middleware::from_fn_with_state(gate, availability_gate_middleware))
//!     .layer(TimeoutLayer::new(timeout))
//!     // Outermost
//!     .layer(middleware::from_fn(trace_middleware))
//! ```

pub mod availability;
pub mod performance;
pub mod trace;
pub mod url_input;

pub use availability::{
    availability_gate_middleware, gate_resource, retry_after_secs, AvailabilityGateState,
};
pub use performance::{performance_middleware, RequestSample, CLIENT_CLOSED_REQUEST};
pub use trace::{inbound_trace_id, trace_middleware};
pub use url_input::{
    sanitize_input, sanitize_value, url_input_middleware, validate_value, InputContext,
    InputRejection, InvalidInput, SanitizedInput, MAX_PARAM_LENGTH, MAX_QUERY_VALUE_LENGTH,
};
