//! Ambient Trace Context
//!
//! Every inbound request (or background task) gets a correlation id that
//! follows it across `.await` points without being threaded through function
//! signatures. The context lives in tokio task-local storage, so concurrent
//! requests never observe each other's id, and nested scopes restore the outer
//! context when they end, even on error or panic.
//!
//! Work that escapes the current task (spawned tasks, timers, queued
//! callbacks) must capture the context explicitly with [`bind_trace`] or
//! [`bind_trace_future`].

use std::cell::RefCell;
use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TraceError;

/// Header carrying the trace id on inbound requests and every response.
pub const TRACE_HEADER: &str = "x-trace-id";

/// Secondary inbound header accepted when `x-trace-id` is absent.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static TRACE: RefCell<TraceContext>;
}

// ============================================================================
// TYPES
// ============================================================================

/// Correlation context for one logical request or task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

/// Initial values for a new trace scope.
///
/// A missing or blank `trace_id` is replaced by a freshly minted one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInit {
    pub trace_id: Option<String>,
    pub resource: Option<String>,
}

impl TraceInit {
    pub fn new(trace_id: Option<impl Into<String>>) -> Self {
        Self {
            trace_id: trace_id.map(Into::into),
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    fn normalize(self) -> TraceContext {
        TraceContext {
            trace_id: ensure_trace_id(self.trace_id.as_deref()),
            resource: self.resource,
        }
    }
}

impl From<&str> for TraceInit {
    fn from(trace_id: &str) -> Self {
        Self::new(Some(trace_id))
    }
}

impl From<String> for TraceInit {
    fn from(trace_id: String) -> Self {
        Self::new(Some(trace_id))
    }
}

impl From<Option<String>> for TraceInit {
    fn from(trace_id: Option<String>) -> Self {
        Self::new(trace_id)
    }
}

impl From<TraceContext> for TraceInit {
    fn from(ctx: TraceContext) -> Self {
        Self {
            trace_id: Some(ctx.trace_id),
            resource: ctx.resource,
        }
    }
}

/// Partial update merged into the active context by [`set_trace_context`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceUpdate {
    pub trace_id: Option<String>,
    pub resource: Option<String>,
}

impl TraceUpdate {
    /// Update that only attaches a resource label.
    pub fn resource(resource: impl Into<String>) -> Self {
        Self {
            trace_id: None,
            resource: Some(resource.into()),
        }
    }
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Return the candidate trimmed if it is non-empty, otherwise mint a new id.
pub fn ensure_trace_id(candidate: Option<&str>) -> String {
    match candidate.map(str::trim) {
        Some(trimmed) if !trimmed.is_empty() => trimmed.to_string(),
        _ => Uuid::now_v7().to_string(),
    }
}

/// Run `fut` with a trace context established for its whole extent.
pub async fn run_with_trace<F>(init: impl Into<TraceInit>, fut: F) -> F::Output
where
    F: Future,
{
    let ctx = init.into().normalize();
    TRACE.scope(RefCell::new(ctx), fut).await
}

/// Synchronous counterpart of [`run_with_trace`].
pub fn run_with_trace_sync<R>(init: impl Into<TraceInit>, f: impl FnOnce() -> R) -> R {
    let ctx = init.into().normalize();
    TRACE.sync_scope(RefCell::new(ctx), f)
}

/// Snapshot of the active context, or `None` outside any trace scope.
pub fn trace_context() -> Option<TraceContext> {
    TRACE.try_with(|cell| cell.borrow().clone()).ok()
}

/// Active trace id, or `None` outside any trace scope.
pub fn trace_id() -> Option<String> {
    TRACE.try_with(|cell| cell.borrow().trace_id.clone()).ok()
}

/// Merge `update` into the active scope for the remainder of that scope.
pub fn set_trace_context(update: TraceUpdate) -> Result<TraceContext, TraceError> {
    TRACE
        .try_with(|cell| {
            let mut current = cell.borrow_mut();
            let trace_id = ensure_trace_id(
                update
                    .trace_id
                    .as_deref()
                    .or(Some(current.trace_id.as_str())),
            );
            current.trace_id = trace_id;
            if update.resource.is_some() {
                current.resource = update.resource;
            }
            current.clone()
        })
        .map_err(|_| TraceError::NoActiveContext)
}

/// Capture the active context and re-establish it on every later call.
///
/// Without an active context the callback runs unchanged.
pub fn bind_trace<F, R>(f: F) -> impl Fn() -> R
where
    F: Fn() -> R,
{
    let captured = trace_context();
    move || match &captured {
        Some(ctx) => TRACE.sync_scope(RefCell::new(ctx.clone()), &f),
        None => f(),
    }
}

/// Capture the active context for a future that will be polled elsewhere,
/// typically through `tokio::spawn`.
pub fn bind_trace_future<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let captured = trace_context();
    async move {
        match captured {
            Some(ctx) => TRACE.scope(RefCell::new(ctx), fut).await,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ensure_trace_id_trims_candidate() {
        assert_eq!(ensure_trace_id(Some("  abc-123  ")), "abc-123");
    }

    #[test]
    fn test_ensure_trace_id_mints_for_blank() {
        let minted = ensure_trace_id(Some("   "));
        assert!(!minted.is_empty());
        assert!(Uuid::parse_str(&minted).is_ok());
        assert!(!ensure_trace_id(None).is_empty());
    }

    #[test]
    fn test_ensure_trace_id_minted_ids_differ() {
        assert_ne!(ensure_trace_id(None), ensure_trace_id(None));
    }

    #[test]
    fn test_no_context_outside_scope() {
        assert!(trace_context().is_none());
        assert!(trace_id().is_none());
        assert_eq!(
            set_trace_context(TraceUpdate::resource("profile")),
            Err(TraceError::NoActiveContext)
        );
    }

    #[tokio::test]
    async fn test_run_with_trace_survives_await() {
        let seen = run_with_trace("trace-1", async {
            tokio::task::yield_now().await;
            trace_id()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("trace-1"));
        assert!(trace_id().is_none());
    }

    #[tokio::test]
    async fn test_nested_scope_restores_outer_on_error() {
        run_with_trace("outer", async {
            let inner: Result<(), &str> = run_with_trace("inner", async {
                assert_eq!(trace_id().as_deref(), Some("inner"));
                Err("boom")
            })
            .await;
            assert!(inner.is_err());
            assert_eq!(trace_id().as_deref(), Some("outer"));
        })
        .await;
    }

    #[test]
    fn test_nested_sync_scope_restores_outer_on_panic() {
        run_with_trace_sync("outer", || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                run_with_trace_sync("inner", || panic!("inner failure"))
            }));
            assert!(result.is_err());
            assert_eq!(trace_id().as_deref(), Some("outer"));
        });
    }

    #[tokio::test]
    async fn test_set_trace_context_merges_resource() {
        run_with_trace("trace-9", async {
            let updated = set_trace_context(TraceUpdate::resource("profile:summary"))
                .map_err(|e| e.to_string())?;
            assert_eq!(updated.trace_id, "trace-9");
            assert_eq!(trace_context().and_then(|c| c.resource).as_deref(), Some("profile:summary"));

            // A blank id keeps a valid id rather than clearing it.
            let updated = set_trace_context(TraceUpdate {
                trace_id: Some("  ".to_string()),
                resource: None,
            })
            .map_err(|e| e.to_string())?;
            assert!(!updated.trace_id.trim().is_empty());
            assert_eq!(updated.resource.as_deref(), Some("profile:summary"));
            Ok::<(), String>(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_set_trace_context_is_scoped() {
        run_with_trace("outer", async {
            run_with_trace("inner", async {
                let _ = set_trace_context(TraceUpdate::resource("inner-only"));
            })
            .await;
            assert_eq!(trace_context().and_then(|c| c.resource), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_bind_trace_reestablishes_captured_context() {
        let bound = run_with_trace("captured", async { bind_trace(trace_id) }).await;
        assert_eq!(bound().as_deref(), Some("captured"));

        let seen = run_with_trace("other", async { bound() }).await;
        assert_eq!(seen.as_deref(), Some("captured"));
    }

    #[tokio::test]
    async fn test_bind_trace_without_context_is_passthrough() {
        let bound = bind_trace(trace_id);
        assert!(bound().is_none());
        let seen = run_with_trace("later", async { bound() }).await;
        assert_eq!(seen.as_deref(), Some("later"));
    }

    #[tokio::test]
    async fn test_bind_trace_future_follows_spawned_task() {
        let handle = run_with_trace("spawner", async {
            tokio::spawn(bind_trace_future(async { trace_id() }))
        })
        .await;
        assert_eq!(handle.await.unwrap().as_deref(), Some("spawner"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_requests_are_isolated() {
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                tokio::spawn(run_with_trace(format!("req-{i}"), async move {
                    for _ in 0..5 {
                        tokio::task::yield_now().await;
                        assert_eq!(trace_id(), Some(format!("req-{i}")));
                    }
                }))
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
    }

    proptest! {
        #[test]
        fn prop_ensure_trace_id_keeps_trimmed_candidate(candidate in "\\PC{0,40}") {
            let result = ensure_trace_id(Some(&candidate));
            if candidate.trim().is_empty() {
                prop_assert!(!result.is_empty());
            } else {
                prop_assert_eq!(result, candidate.trim());
            }
        }
    }
}
