//! Database resilience: error classification, availability tracking, retry.

pub mod availability;
pub mod classify;
pub mod retry;

pub use availability::{
    AvailabilityConfig, AvailabilitySnapshot, AvailabilityTracker, LastDbError, ProbeStrategy,
};
pub use classify::{classify, is_connectivity_error, is_constraint_error, is_transient_error, ErrorClass};
pub use retry::{Backoff, RetryPolicy};
