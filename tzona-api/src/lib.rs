//! TZONA API - request pipeline, health and metrics surfaces
//!
//! The HTTP side of the training backend's resilience core. Every request
//! passes through the middleware pipeline (trace, availability gate, URL
//! input sanitising, performance sampling) before reaching a handler.
//!
//! - [`config`]: service, SLA and microservice probe configuration
//! - [`db`]: Postgres data store and the tracked database client
//! - [`analytics`]: performance, SLA, slow-query and web-vitals collectors
//! - [`health`]: readiness aggregation
//! - [`routes`]: health, metrics ingestion, dashboard, Prometheus, OpenAPI
//! - [`bootstrap`]: lifecycle steps used by the server binary

pub mod analytics;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod macros;
pub mod middleware;
#[cfg(feature = "openapi")]
pub mod openapi;
pub mod routes;
pub mod state;
pub mod telemetry;

// Re-export commonly used types
pub use analytics::Analytics;
pub use config::{ApiConfig, MicroserviceTarget, SlaTarget, SlaTargets};
pub use db::{DbClient, DbConfig, PgStore};
pub use error::{ApiError, ApiResult, ErrorCategory, ErrorClassification, ErrorCode};
pub use health::{DependencyProbe, HealthService, HealthSnapshot, HttpProbe};
pub use middleware::SanitizedInput;
#[cfg(feature = "openapi")]
pub use openapi::ApiDoc;
pub use routes::{build_router, build_router_with};
pub use state::AppState;
