//! Compensating transactions across non-transactional resources.
//!
//! A [`Saga`] runs registered steps strictly in order. When a step fails,
//! the steps that already succeeded are compensated in reverse order,
//! best-effort: a failing compensation is logged and the unwind continues.
//!
//! [`Rollback`] is the single-step variant for pairing one irreversible
//! action with its undo without building a whole saga.

use crate::error::{ProvisionError, Result};
use crate::observability::metrics;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, error, info, warn};

/// Boxed future returned by closure-based steps.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

type StepFn = Box<dyn Fn() -> StepFuture + Send + Sync>;

/// One (action, undo) pair of a saga.
///
/// `compensate` is invoked at most once, and only after `execute` returned `Ok`.
/// Implementations should make it idempotent all the same.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self) -> Result<()>;

    async fn compensate(&self) -> Result<()>;
}

/// A step built from two closures.
pub struct FnStep {
    name: String,
    action: StepFn,
    undo: StepFn,
}

impl FnStep {
    pub fn new<A, AF, U, UF>(name: impl Into<String>, action: A, undo: U) -> Self
    where
        A: Fn() -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
        U: Fn() -> UF + Send + Sync + 'static,
        UF: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move || Box::pin(action())),
            undo: Box::new(move || Box::pin(undo())),
        }
    }
}

#[async_trait]
impl SagaStep for FnStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self) -> Result<()> {
        (self.action)().await
    }

    async fn compensate(&self) -> Result<()> {
        (self.undo)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Pending,
    Completed,
    Failed,
    Compensated,
}

/// Ordered list of steps executed as one logical unit.
pub struct Saga {
    name: String,
    steps: Vec<Box<dyn SagaStep>>,
    /// Number of leading steps whose action succeeded and has not been undone.
    completed: usize,
    state: SagaState,
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), steps: Vec::new(), completed: 0, state: SagaState::Pending }
    }

    /// Register a step. Steps run in registration order.
    pub fn add_step(&mut self, step: impl SagaStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Register a closure-based step.
    pub fn step<A, AF, U, UF>(&mut self, name: impl Into<String>, action: A, undo: U) -> &mut Self
    where
        A: Fn() -> AF + Send + Sync + 'static,
        AF: Future<Output = Result<()>> + Send + 'static,
        U: Fn() -> UF + Send + Sync + 'static,
        UF: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_step(FnStep::new(name, action, undo))
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Names of the steps whose action has succeeded and not been compensated.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps[..self.completed].iter().map(|s| s.name()).collect()
    }

    /// Run every step in order.
    ///
    /// On the first failure, completed steps are compensated in reverse and
    /// the failure is returned wrapped as [`ProvisionError::StepFailed`].
    pub async fn execute(&mut self) -> Result<()> {
        if self.state != SagaState::Pending {
            return Err(ProvisionError::Internal(format!(
                "saga '{}' already ran ({:?})",
                self.name, self.state
            )));
        }

        info!(saga = %self.name, steps = self.steps.len(), "Executing saga");

        for idx in 0..self.steps.len() {
            let step = &self.steps[idx];
            debug!(saga = %self.name, step = step.name(), "Executing step");

            let outcome = step.execute().await;
            let step_name = step.name().to_string();
            match outcome {
                Ok(()) => self.completed = idx + 1,
                Err(e) => {
                    warn!(saga = %self.name, step = %step_name, error = %e, "Step failed, compensating");
                    self.state = SagaState::Failed;
                    self.unwind().await;
                    return Err(ProvisionError::step(step_name, e));
                }
            }
        }

        self.state = SagaState::Completed;
        info!(saga = %self.name, "Saga completed");
        Ok(())
    }

    /// Undo every completed step in reverse order.
    ///
    /// Used when work after a successful saga fails (e.g. the DB commit).
    /// Returns the number of compensations that failed.
    pub async fn compensate(&mut self) -> usize {
        let failed = self.unwind().await;
        self.state = SagaState::Compensated;
        failed
    }

    async fn unwind(&mut self) -> usize {
        let mut failed = 0;
        while self.completed > 0 {
            self.completed -= 1;
            let step = &self.steps[self.completed];
            match step.compensate().await {
                Ok(()) => {
                    debug!(saga = %self.name, step = step.name(), "Step compensated");
                    metrics::record_compensation(step.name(), true);
                }
                Err(e) => {
                    failed += 1;
                    error!(
                        saga = %self.name,
                        step = step.name(),
                        error = %e,
                        "Compensation failed, continuing unwind"
                    );
                    metrics::record_compensation(step.name(), false);
                }
            }
        }
        if self.state == SagaState::Failed {
            self.state = SagaState::Compensated;
        }
        failed
    }
}

impl std::fmt::Debug for Saga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("completed", &self.completed)
            .field("state", &self.state)
            .finish()
    }
}

/// Undo guard for one action that has already succeeded.
///
/// [`commit`](Rollback::commit) discards the undo; [`rollback`](Rollback::rollback)
/// runs it once, and later calls are no-ops.
pub struct Rollback {
    name: String,
    undo: Option<Box<dyn FnOnce() -> StepFuture + Send>>,
}

impl Rollback {
    /// Arm a guard for an action that just succeeded.
    pub fn new<U, UF>(name: impl Into<String>, undo: U) -> Self
    where
        U: FnOnce() -> UF + Send + 'static,
        UF: Future<Output = Result<()>> + Send + 'static,
    {
        Self { name: name.into(), undo: Some(Box::new(move || Box::pin(undo()))) }
    }

    /// Run `action` and, if it succeeds, return a guard holding `undo`.
    pub async fn run<T, AF, U, UF>(name: impl Into<String>, action: AF, undo: U) -> Result<(T, Self)>
    where
        AF: Future<Output = Result<T>>,
        U: FnOnce() -> UF + Send + 'static,
        UF: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        match action.await {
            Ok(value) => Ok((value, Self::new(name, undo))),
            Err(e) => Err(ProvisionError::step(name, e)),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.undo.is_some()
    }

    /// Keep the action's effect.
    pub fn commit(mut self) {
        self.undo = None;
        debug!(step = %self.name, "Rollback guard committed");
    }

    /// Undo the action. Safe to call more than once.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(undo) = self.undo.take() else {
            return Ok(());
        };
        let result = undo().await;
        metrics::record_compensation(&self.name, result.is_ok());
        if let Err(e) = &result {
            error!(step = %self.name, error = %e, "Rollback failed");
        }
        result
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.undo.is_some() {
            warn!(step = %self.name, "Rollback guard dropped without commit or rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorded(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn step(saga: &mut Saga, log: &Log, name: &'static str, fail: bool, fail_undo: bool) {
        let run_log = log.clone();
        let undo_log = log.clone();
        saga.step(
            name,
            move || {
                let log = run_log.clone();
                async move {
                    log.lock().unwrap().push(format!("do {}", name));
                    if fail {
                        return Err(ProvisionError::Internal(format!("{} broke", name)));
                    }
                    Ok(())
                }
            },
            move || {
                let log = undo_log.clone();
                async move {
                    log.lock().unwrap().push(format!("undo {}", name));
                    if fail_undo {
                        return Err(ProvisionError::Internal(format!("undo {} broke", name)));
                    }
                    Ok(())
                }
            },
        );
    }

    #[tokio::test]
    async fn test_all_steps_succeed_without_compensation() {
        let log = Log::default();
        let mut saga = Saga::new("ok");
        step(&mut saga, &log, "a", false, false);
        step(&mut saga, &log, "b", false, false);

        saga.execute().await.unwrap();

        assert_eq!(recorded(&log), vec!["do a", "do b"]);
        assert_eq!(saga.state(), SagaState::Completed);
        assert_eq!(saga.completed_steps(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse_order() {
        let log = Log::default();
        let mut saga = Saga::new("abc");
        step(&mut saga, &log, "a", false, false);
        step(&mut saga, &log, "b", false, false);
        step(&mut saga, &log, "c", true, false);

        let err = saga.execute().await.unwrap_err();

        assert_eq!(err.failed_step(), Some("c"));
        assert_eq!(recorded(&log), vec!["do a", "do b", "do c", "undo b", "undo a"]);
        assert_eq!(saga.state(), SagaState::Compensated);
        assert!(saga.completed_steps().is_empty());
    }

    #[tokio::test]
    async fn test_failed_compensation_does_not_stop_unwind() {
        let log = Log::default();
        let mut saga = Saga::new("abc");
        step(&mut saga, &log, "a", false, false);
        step(&mut saga, &log, "b", false, true);
        step(&mut saga, &log, "c", true, false);

        assert!(saga.execute().await.is_err());
        assert_eq!(recorded(&log), vec!["do a", "do b", "do c", "undo b", "undo a"]);
    }

    #[tokio::test]
    async fn test_first_step_failure_compensates_nothing() {
        let log = Log::default();
        let mut saga = Saga::new("first");
        step(&mut saga, &log, "a", true, false);
        step(&mut saga, &log, "b", false, false);

        assert!(saga.execute().await.is_err());
        assert_eq!(recorded(&log), vec!["do a"]);
    }

    #[tokio::test]
    async fn test_explicit_compensate_after_success_runs_once() {
        let log = Log::default();
        let mut saga = Saga::new("late");
        step(&mut saga, &log, "a", false, false);
        step(&mut saga, &log, "b", false, true);

        saga.execute().await.unwrap();
        assert_eq!(saga.compensate().await, 1);
        assert_eq!(saga.compensate().await, 0);

        assert_eq!(recorded(&log), vec!["do a", "do b", "undo b", "undo a"]);
        assert!(saga.execute().await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_runs_undo_once() {
        let counter = Arc::new(Mutex::new(0));
        let c = counter.clone();
        let mut guard = Rollback::new("clone-disk", move || async move {
            *c.lock().unwrap() += 1;
            Ok(())
        });

        guard.rollback().await.unwrap();
        guard.rollback().await.unwrap();

        assert_eq!(*counter.lock().unwrap(), 1);
        assert!(!guard.is_armed());
    }

    #[tokio::test]
    async fn test_rollback_commit_discards_undo() {
        let counter = Arc::new(Mutex::new(0));
        let c = counter.clone();
        let (value, guard) = Rollback::run("define", async { Ok(7) }, move || async move {
            *c.lock().unwrap() += 1;
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        guard.commit();
        assert_eq!(*counter.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_run_failure_wraps_step_name() {
        let result = Rollback::run(
            "define",
            async { Err::<(), _>(ProvisionError::invalid_input("bad")) },
            || async { Ok(()) },
        )
        .await;

        let err = result.err().unwrap();
        assert_eq!(err.failed_step(), Some("define"));
    }
}
