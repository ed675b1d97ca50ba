//! Error types for TZONA core operations

use thiserror::Error;

/// Boxed error used by lifecycle step actions and other pluggable callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle coordinator errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Lifecycle step must have a name")]
    MissingStepName,

    #[error("Cannot register step '{step}' after the lifecycle has started")]
    AlreadyStarted { step: String },

    #[error("Lifecycle step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: BoxError,
    },

    #[error("Shutdown began while step '{step}' was starting")]
    Interrupted { step: String },
}

impl LifecycleError {
    /// Name of the step that produced this error, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            LifecycleError::MissingStepName => None,
            LifecycleError::AlreadyStarted { step }
            | LifecycleError::StepFailed { step, .. }
            | LifecycleError::Interrupted { step } => Some(step),
        }
    }
}

/// Trace context errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraceError {
    #[error("No trace context is active in the current task")]
    NoActiveContext,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for TZONA core errors.
#[derive(Debug, Error)]
pub enum TzonaError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for TZONA core operations.
pub type TzonaResult<T> = Result<T, TzonaError>;

// =============================================================================
// TESTS
// =============================================================================
