//! TZONA Core - Request Context and Lifecycle
//!
//! Ambient trace propagation, ordered startup/shutdown, and the error and
//! health types shared by the storage and API crates.

pub mod error;
pub mod health;
pub mod lifecycle;
pub mod trace;

pub use error::{BoxError, ConfigError, LifecycleError, TraceError, TzonaError, TzonaResult};
pub use health::{DependencyStatus, HealthCheck, HealthStatus};
pub use lifecycle::{
    ApplicationLifecycle, ErrorHandler, LifecyclePhase, LifecycleStep, StepFn, StepFuture,
    StepStage,
};
pub use trace::{
    bind_trace, bind_trace_future, ensure_trace_id, run_with_trace, run_with_trace_sync,
    set_trace_context, trace_context, trace_id, TraceContext, TraceInit, TraceUpdate,
    REQUEST_ID_HEADER, TRACE_HEADER,
};
