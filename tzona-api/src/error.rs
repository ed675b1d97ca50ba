//! Error Types for the TZONA API
//!
//! This module defines error handling for the HTTP layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum with status, category and classification
//! - IntoResponse implementation for Axum HTTP responses
//!
//! Every error response is a `{ success: false, error: {...} }` envelope that
//! carries the active trace id.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tzona_core::TRACE_HEADER;
use tzona_storage::{classify, ErrorClass, PersistenceError};

// ============================================================================
// CATEGORIES
// ============================================================================

/// Where an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimit,
    Dependencies,
    Database,
    Internal,
}

/// Coarse grouping used by clients to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    Validation,
    Auth,
    Business,
    Database,
    Internal,
}

impl ErrorCategory {
    pub fn classification(self) -> ErrorClassification {
        match self {
            ErrorCategory::Validation => ErrorClassification::Validation,
            ErrorCategory::Authentication | ErrorCategory::Authorization => {
                ErrorClassification::Auth
            }
            ErrorCategory::NotFound | ErrorCategory::Conflict | ErrorCategory::RateLimit => {
                ErrorClassification::Business
            }
            ErrorCategory::Dependencies | ErrorCategory::Database => ErrorClassification::Database,
            ErrorCategory::Internal => ErrorClassification::Internal,
        }
    }
}

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Path parameter or query value failed sanitising
    InvalidUrlInput,
    /// Request body failed validation
    ValidationFailed,
    /// A dependency is temporarily unavailable
    ServiceUnavailable,
    /// Database operation failed
    DatabaseError,
    /// Operation conflicts with existing data
    Conflict,
    NotFound,
    InternalError,
    Timeout,
    TooManyRequests,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidUrlInput | ErrorCode::ValidationFailed => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidUrlInput | ErrorCode::ValidationFailed => ErrorCategory::Validation,
            ErrorCode::ServiceUnavailable | ErrorCode::Timeout => ErrorCategory::Dependencies,
            ErrorCode::DatabaseError => ErrorCategory::Database,
            ErrorCode::Conflict => ErrorCategory::Conflict,
            ErrorCode::NotFound => ErrorCategory::NotFound,
            ErrorCode::TooManyRequests => ErrorCategory::RateLimit,
            ErrorCode::InternalError => ErrorCategory::Internal,
        }
    }

    pub fn classification(&self) -> ErrorClassification {
        self.category().classification()
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidUrlInput => "Invalid path or query parameters",
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::ServiceUnavailable => {
                "Data is temporarily unavailable. Please try again later."
            }
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::Conflict => "Operation conflicts with existing data",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::Timeout => "Operation timed out",
            ErrorCode::TooManyRequests => "Rate limit exceeded",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidUrlInput => "invalid_url_input",
            ErrorCode::ValidationFailed => "validation_failed",
            ErrorCode::ServiceUnavailable => "service_unavailable",
            ErrorCode::DatabaseError => "database_error",
            ErrorCode::Conflict => "conflict",
            ErrorCode::NotFound => "not_found",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::TooManyRequests => "too_many_requests",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error returned by handlers and middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub details: Option<Value>,

    /// What the request was operating on, e.g. `sessions` or `params.slug`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    /// Rendered as the `Retry-After` header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            resource: None,
            trace_id: None,
            retry_after_secs: None,
        }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs.max(1));
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    /// 422 for a path parameter or query value that failed sanitising.
    pub fn invalid_url_input(path: &str, reason: &str) -> Self {
        Self::from_code(ErrorCode::InvalidUrlInput)
            .with_resource(path)
            .with_details(json!({ "path": path, "code": reason }))
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    /// 503 returned while the database is known to be down.
    pub fn database_unavailable(resource: impl Into<String>) -> Self {
        Self::from_code(ErrorCode::ServiceUnavailable).with_resource(resource)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Operation '{}' timed out", operation),
        )
    }

    /// JSON error envelope. Uses the ambient trace id when none was set.
    pub fn to_body(&self) -> Value {
        let trace_id = self.trace_id.clone().or_else(tzona_core::trace_id);
        let category = self.code.category();

        let mut error = Map::new();
        error.insert("error".into(), json!(self.code.as_str()));
        error.insert("message".into(), json!(self.message));
        error.insert("classification".into(), json!(self.code.classification()));
        if category != ErrorCategory::Internal {
            error.insert("category".into(), json!(category));
        }
        if let Some(trace_id) = &trace_id {
            error.insert("traceId".into(), json!(trace_id));
        }
        if let Some(resource) = &self.resource {
            error.insert("resource".into(), json!(resource));
        }
        if let Some(details) = &self.details {
            error.insert("details".into(), details.clone());
        }

        let mut body = json!({ "success": false, "error": error });
        if trace_id.is_some() || self.resource.is_some() {
            let mut meta = Map::new();
            if let Some(trace_id) = trace_id {
                meta.insert("traceId".into(), json!(trace_id));
            }
            if let Some(resource) = &self.resource {
                meta.insert("resource".into(), json!(resource));
            }
            body["meta"] = Value::Object(meta);
        }
        body
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

/// Implement IntoResponse for ApiError to enable automatic error handling in Axum.
///
/// ```ignore
/// async fn handler() -> Result<Json<Response>, ApiError> {
///     Err(ApiError::not_found("Session not found"))
/// }
/// ```
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.to_body();
        let trace_id = body["error"]["traceId"].as_str().map(str::to_owned);

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if let Some(value) = trace_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
            headers.insert(TRACE_HEADER, value);
        }
        if let Some(secs) = self.retry_after_secs {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

/// Map persistence failures onto client-facing errors.
///
/// Connectivity failures become 503, constraint violations 409. Internal
/// detail is logged, not returned.
impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        if err.is_guard_error() {
            tracing::error!(code = ?err.code, error = %err.message, "Blocked persistence operation");
            return ApiError::internal_error(ErrorCode::InternalError.default_message());
        }
        match classify(&err) {
            ErrorClass::Connectivity => {
                tracing::warn!(code = ?err.code, error = %err.message, "Database unreachable");
                ApiError::from_code(ErrorCode::ServiceUnavailable)
            }
            ErrorClass::Constraint => {
                let error = ApiError::conflict(ErrorCode::Conflict.default_message());
                match err.target {
                    Some(target) => error.with_details(json!({ "target": target })),
                    None => error,
                }
            }
            ErrorClass::Transient | ErrorClass::Other => {
                tracing::error!(code = ?err.code, error = %err.message, "Database error");
                ApiError::database_error(ErrorCode::DatabaseError.default_message())
            }
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::validation_failed(format!("Invalid JSON: {}", err))
    }
}

impl From<tzona_core::LifecycleError> for ApiError {
    fn from(err: tzona_core::LifecycleError) -> Self {
        ApiError::internal_error(err.to_string())
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
