//! Application Lifecycle Coordinator
//!
//! Named steps are registered before startup and run strictly in registration
//! order. Shutdown walks the successfully started steps in reverse and runs
//! their cleanup actions, so resources are released in the opposite order of
//! acquisition. A failed startup step unwinds everything started before it.
//!
//! ```text
//! Idle --start()--> Started --shutdown()--> ShuttingDown --> Shutdown
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{BoxError, LifecycleError};

/// Boxed future returned by a step action.
pub type StepFuture = BoxFuture<'static, Result<(), BoxError>>;

/// Step action. Receives the shared service context.
pub type StepFn<C> = Box<dyn Fn(Arc<C>) -> StepFuture + Send + Sync>;

/// Callback invoked for every step failure, in either stage.
pub type ErrorHandler = Arc<dyn Fn(StepStage, &str, &BoxError) + Send + Sync>;

// ============================================================================
// TYPES
// ============================================================================

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Idle,
    Started,
    ShuttingDown,
    Shutdown,
}

/// Which action of a step produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStage {
    Run,
    Cleanup,
}

impl fmt::Display for StepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStage::Run => write!(f, "run"),
            StepStage::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// A named unit of startup work with an optional cleanup action.
pub struct LifecycleStep<C> {
    name: String,
    run: Option<StepFn<C>>,
    cleanup: Option<StepFn<C>>,
}

impl<C: Send + Sync + 'static> LifecycleStep<C> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: None,
            cleanup: None,
        }
    }

    /// Set the startup action.
    pub fn on_run<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.run = Some(Box::new(move |ctx| Box::pin(action(ctx))));
        self
    }

    /// Set the cleanup action, run during shutdown if startup succeeded.
    pub fn on_cleanup<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.cleanup = Some(Box::new(move |ctx| Box::pin(action(ctx))));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<C> fmt::Debug for LifecycleStep<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleStep")
            .field("name", &self.name)
            .field("run", &self.run.is_some())
            .field("cleanup", &self.cleanup.is_some())
            .finish()
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Ordered startup and reverse-order teardown over a shared context `C`.
pub struct ApplicationLifecycle<C> {
    context: Arc<C>,
    steps: Mutex<Vec<Arc<LifecycleStep<C>>>>,
    executed: Mutex<Vec<Arc<LifecycleStep<C>>>>,
    phase: Mutex<LifecyclePhase>,
    on_error: ErrorHandler,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn log_step_error(stage: StepStage, step: &str, err: &BoxError) {
    error!(step = %step, stage = %stage, error = %err, "Lifecycle step failed");
}

impl<C: Send + Sync + 'static> ApplicationLifecycle<C> {
    pub fn new(context: C) -> Self {
        Self::with_context(Arc::new(context))
    }

    /// Build around an already shared context.
    pub fn with_context(context: Arc<C>) -> Self {
        Self {
            context,
            steps: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            phase: Mutex::new(LifecyclePhase::Idle),
            on_error: Arc::new(log_step_error),
        }
    }

    /// Replace the default logging error handler.
    pub fn with_error_handler<H>(mut self, handler: H) -> Self
    where
        H: Fn(StepStage, &str, &BoxError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }

    pub fn context(&self) -> &Arc<C> {
        &self.context
    }

    pub fn phase(&self) -> LifecyclePhase {
        *lock(&self.phase)
    }

    /// Names of steps whose startup action completed, in start order.
    pub fn executed_steps(&self) -> Vec<String> {
        lock(&self.executed)
            .iter()
            .map(|step| step.name.clone())
            .collect()
    }

    /// Append a step. Only allowed before `start`.
    pub fn register_step(&self, step: LifecycleStep<C>) -> Result<(), LifecycleError> {
        if step.name.trim().is_empty() {
            return Err(LifecycleError::MissingStepName);
        }
        if self.phase() != LifecyclePhase::Idle {
            return Err(LifecycleError::AlreadyStarted { step: step.name });
        }
        lock(&self.steps).push(Arc::new(step));
        Ok(())
    }

    /// Run every registered step in order.
    ///
    /// On failure the already started steps are cleaned up and the original
    /// error is returned. Calling `start` more than once is a no-op.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        {
            let mut phase = lock(&self.phase);
            if *phase != LifecyclePhase::Idle {
                return Ok(());
            }
            *phase = LifecyclePhase::Started;
        }

        let steps: Vec<_> = lock(&self.steps).clone();
        for step in steps {
            info!(step = %step.name, "Starting step");
            if let Some(run) = &step.run {
                if let Err(source) = run(Arc::clone(&self.context)).await {
                    (self.on_error)(StepStage::Run, &step.name, &source);
                    self.shutdown().await;
                    return Err(LifecycleError::StepFailed {
                        step: step.name.clone(),
                        source,
                    });
                }
            }

            // Record under the phase lock so a concurrent shutdown either
            // sees this step or leaves its cleanup to us.
            let interrupted = {
                let phase = lock(&self.phase);
                if *phase == LifecyclePhase::Started {
                    lock(&self.executed).push(Arc::clone(&step));
                    false
                } else {
                    true
                }
            };
            if interrupted {
                warn!(step = %step.name, "Shutdown began during startup; cleaning up step");
                if let Some(cleanup) = &step.cleanup {
                    if let Err(err) = cleanup(Arc::clone(&self.context)).await {
                        (self.on_error)(StepStage::Cleanup, &step.name, &err);
                    }
                }
                return Err(LifecycleError::Interrupted {
                    step: step.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Clean up executed steps in reverse order. Repeated calls return
    /// immediately. Cleanup failures are reported and the unwind continues.
    pub async fn shutdown(&self) {
        {
            let mut phase = lock(&self.phase);
            if matches!(
                *phase,
                LifecyclePhase::ShuttingDown | LifecyclePhase::Shutdown
            ) {
                return;
            }
            *phase = LifecyclePhase::ShuttingDown;
        }

        let executed: Vec<_> = lock(&self.executed).clone();
        for step in executed.iter().rev() {
            let Some(cleanup) = &step.cleanup else {
                continue;
            };
            info!(step = %step.name, "Cleaning up step");
            if let Err(err) = cleanup(Arc::clone(&self.context)).await {
                (self.on_error)(StepStage::Cleanup, &step.name, &err);
            }
        }

        *lock(&self.phase) = LifecyclePhase::Shutdown;
    }
}

impl<C> fmt::Debug for ApplicationLifecycle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationLifecycle")
            .field("phase", &*lock(&self.phase))
            .field("steps", &lock(&self.steps).len())
            .field("executed", &lock(&self.executed).len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    type Log = Mutex<Vec<String>>;

    fn recording_step(name: &str, fail_run: bool, fail_cleanup: bool) -> LifecycleStep<Log> {
        let run_name = name.to_string();
        let cleanup_name = name.to_string();
        LifecycleStep::new(name)
            .on_run(move |log: Arc<Log>| {
                let name = run_name.clone();
                async move {
                    if fail_run {
                        return Err(BoxError::from(format!("{name} failed")));
                    }
                    lock(&log).push(format!("run:{name}"));
                    Ok(())
                }
            })
            .on_cleanup(move |log: Arc<Log>| {
                let name = cleanup_name.clone();
                async move {
                    lock(&log).push(format!("cleanup:{name}"));
                    if fail_cleanup {
                        return Err(BoxError::from(format!("{name} cleanup failed")));
                    }
                    Ok(())
                }
            })
    }

    fn entries(lifecycle: &ApplicationLifecycle<Log>) -> Vec<String> {
        lock(lifecycle.context()).clone()
    }

    #[tokio::test]
    async fn test_start_then_shutdown_reverses_order() {
        let lifecycle = ApplicationLifecycle::new(Log::default());
        lifecycle.register_step(recording_step("a", false, false)).unwrap();
        lifecycle.register_step(recording_step("b", false, false)).unwrap();

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.phase(), LifecyclePhase::Started);
        lifecycle.shutdown().await;

        assert_eq!(entries(&lifecycle), vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_during_start_cleans_up_in_flight_step() {
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = release.clone();
        let slow = LifecycleStep::new("slow")
            .on_run(move |log: Arc<Log>| {
                let gate = gate.clone();
                async move {
                    lock(&log).push("run:slow".to_string());
                    gate.notified().await;
                    Ok(())
                }
            })
            .on_cleanup(|log: Arc<Log>| async move {
                lock(&log).push("cleanup:slow".to_string());
                Ok(())
            });

        let lifecycle = Arc::new(ApplicationLifecycle::new(Log::default()));
        lifecycle.register_step(slow).unwrap();
        lifecycle.register_step(recording_step("after", false, false)).unwrap();

        let starting = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.start().await }
        });
        while !entries(&lifecycle).contains(&"run:slow".to_string()) {
            tokio::task::yield_now().await;
        }

        lifecycle.shutdown().await;
        release.notify_one();
        let err = starting.await.unwrap().unwrap_err();

        assert!(matches!(err, LifecycleError::Interrupted { ref step } if step == "slow"));
        assert_eq!(entries(&lifecycle), vec!["run:slow", "cleanup:slow"]);
        assert!(lifecycle.executed_steps().is_empty());
        assert_eq!(lifecycle.phase(), LifecyclePhase::Shutdown);
    }

    #[tokio::test]
    async fn test_failed_step_unwinds_started_steps() {
        let stages = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&stages);
        let lifecycle = ApplicationLifecycle::new(Log::default()).with_error_handler(
            move |stage, step: &str, _err: &BoxError| lock(&seen).push((stage, step.to_string())),
        );
        lifecycle.register_step(recording_step("first", false, false)).unwrap();
        lifecycle.register_step(recording_step("second", true, false)).unwrap();

        let err = lifecycle.start().await.unwrap_err();
        assert_eq!(err.step(), Some("second"));
        assert!(err.to_string().contains("second failed"));
        assert_eq!(entries(&lifecycle), vec!["run:first", "cleanup:first"]);
        assert_eq!(*lock(&stages), vec![(StepStage::Run, "second".to_string())]);
        assert_eq!(lifecycle.phase(), LifecyclePhase::Shutdown);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let lifecycle = ApplicationLifecycle::new(Log::default());
        lifecycle.register_step(recording_step("only", false, false)).unwrap();
        lifecycle.start().await.unwrap();

        lifecycle.shutdown().await;
        lifecycle.shutdown().await;

        assert_eq!(entries(&lifecycle), vec!["run:only", "cleanup:only"]);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let lifecycle = ApplicationLifecycle::new(Log::default());
        lifecycle.register_step(recording_step("only", false, false)).unwrap();

        lifecycle.start().await.unwrap();
        lifecycle.start().await.unwrap();

        assert_eq!(entries(&lifecycle), vec!["run:only"]);
        assert_eq!(lifecycle.executed_steps(), vec!["only"]);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_stop_unwind() {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&failures);
        let lifecycle = ApplicationLifecycle::new(Log::default()).with_error_handler(
            move |stage, step: &str, _err: &BoxError| lock(&seen).push((stage, step.to_string())),
        );
        lifecycle.register_step(recording_step("a", false, false)).unwrap();
        lifecycle.register_step(recording_step("b", false, true)).unwrap();
        lifecycle.start().await.unwrap();

        lifecycle.shutdown().await;

        assert_eq!(entries(&lifecycle), vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]);
        assert_eq!(*lock(&failures), vec![(StepStage::Cleanup, "b".to_string())]);
    }

    #[tokio::test]
    async fn test_register_after_start_is_rejected() {
        let lifecycle = ApplicationLifecycle::new(Log::default());
        lifecycle.start().await.unwrap();

        let err = lifecycle
            .register_step(recording_step("late", false, false))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyStarted { ref step } if step == "late"));
    }

    #[test]
    fn test_register_requires_name() {
        let lifecycle = ApplicationLifecycle::new(Log::default());
        let err = lifecycle
            .register_step(LifecycleStep::new("   "))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::MissingStepName));
    }

    #[tokio::test]
    async fn test_steps_without_actions_are_tracked() {
        let lifecycle = ApplicationLifecycle::new(Log::default());
        lifecycle.register_step(LifecycleStep::new("marker")).unwrap();
        lifecycle.register_step(recording_step("real", false, false)).unwrap();

        lifecycle.start().await.unwrap();
        lifecycle.shutdown().await;

        assert_eq!(lifecycle.executed_steps(), vec!["marker", "real"]);
        assert_eq!(entries(&lifecycle), vec!["run:real", "cleanup:real"]);
    }

    proptest! {
        #[test]
        fn prop_cleanup_mirrors_started_prefix(count in 1usize..8, fail_at in proptest::option::of(0usize..8)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let lifecycle = ApplicationLifecycle::new(Log::default());
            for i in 0..count {
                let fail = fail_at == Some(i);
                lifecycle.register_step(recording_step(&format!("s{i}"), fail, false)).unwrap();
            }

            let result = runtime.block_on(async {
                let result = lifecycle.start().await;
                lifecycle.shutdown().await;
                result
            });

            let started = match fail_at {
                Some(idx) if idx < count => {
                    prop_assert!(result.is_err());
                    idx
                }
                _ => {
                    prop_assert!(result.is_ok());
                    count
                }
            };
            let mut expected: Vec<String> = (0..started).map(|i| format!("run:s{i}")).collect();
            expected.extend((0..started).rev().map(|i| format!("cleanup:s{i}")));
            prop_assert_eq!(entries(&lifecycle), expected);
        }
    }
}
