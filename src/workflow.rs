//! Dependency-ordered workflows with saga-style rollback.
//!
//! A [`Workflow`] owns named [`WorkflowStep`]s that declare the steps they
//! depend on. Steps run one at a time in a dependency-respecting order and
//! share a [`WorkflowState`] key/value map. When a step fails for good, the
//! compensations of the steps that already completed run in reverse
//! completion order.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::context::lock;
use crate::control::catch_faults;
use crate::{Error, ExecutionContext, Result, WorkflowEvent};

/// Shared key/value state of a workflow.
///
/// Cloning the handle shares the underlying map. Values are stored as JSON
/// and decoded on read; a value that does not decode into the requested type
/// is an [`Error::Parse`], never a silent coercion.
///
/// ```rust
/// use llm_orchestrate::WorkflowState;
///
/// let state = WorkflowState::new();
/// state.set("count", &3).unwrap();
/// assert_eq!(state.get::<u32>("count").unwrap(), Some(3));
/// assert!(state.get::<String>("count").is_err());
/// assert_eq!(state.get::<u32>("missing").unwrap(), None);
/// ```
#[derive(Debug, Clone, Default)]
pub struct WorkflowState {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl WorkflowState {
    /// An empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the value under `key`. `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(value) = self.get_value(key) else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| Error::Parse(format!("state key '{key}': {e}")))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        lock(&self.values).insert(key.into(), value);
        Ok(())
    }

    /// The raw JSON value under `key`.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    /// Remove and return the value under `key`.
    pub fn remove(&self, key: &str) -> Option<Value> {
        lock(&self.values).remove(key)
    }

    /// Whether `key` holds a value.
    pub fn contains(&self, key: &str) -> bool {
        lock(&self.values).contains_key(key)
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.values).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// A copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        lock(&self.values).clone()
    }
}

type Action = Box<dyn Fn(ExecutionContext, WorkflowState) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn action<F, Fut>(f: F) -> Action
where
    F: Fn(ExecutionContext, WorkflowState) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |ctx, state| Box::pin(f(ctx, state)))
}

/// A named unit of workflow work.
pub struct WorkflowStep {
    name: String,
    dependencies: Vec<String>,
    execute: Action,
    compensate: Option<Action>,
    can_retry: bool,
    max_retries: u32,
}

impl WorkflowStep {
    /// A step running `execute` against the context and shared state.
    pub fn new<F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        F: Fn(ExecutionContext, WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            execute: action(execute),
            compensate: None,
            can_retry: false,
            max_retries: 0,
        }
    }

    /// Run only after `step` has completed.
    #[must_use]
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.dependencies.push(step.into());
        self
    }

    /// Undo this step's effects if a later step fails.
    #[must_use]
    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(ExecutionContext, WorkflowState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(action(compensate));
        self
    }

    /// Allow up to `max_retries` attempts.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.can_retry = true;
        self.max_retries = max_retries;
        self
    }

    /// The step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the steps this one waits for.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn attempts(&self) -> u32 {
        if self.can_retry {
            self.max_retries.max(1)
        } else {
            1
        }
    }
}

/// Workflow configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Base of the linear retry backoff: attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
    /// Whole-run deadline, combined with the context's.
    pub timeout: Option<Duration>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// A set of dependent steps sharing one [`WorkflowState`].
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{ExecutionContext, Workflow, WorkflowStep};
///
/// # tokio_test::block_on(async {
/// let workflow = Workflow::new("publish")
///     .step(WorkflowStep::new("render", |_ctx, state| async move {
///         let draft: String = state.get("draft")?.unwrap_or_default();
///         state.set("html", &format!("<p>{draft}</p>"))
///     }).depends_on("draft"))
///     .step(WorkflowStep::new("draft", |_ctx, state| async move {
///         state.set("draft", "hello")
///     }));
///
/// workflow.execute(&ExecutionContext::new()).await.unwrap();
/// assert_eq!(workflow.state().get::<String>("html").unwrap().as_deref(), Some("<p>hello</p>"));
/// # });
/// ```
pub struct Workflow {
    name: String,
    steps: Vec<WorkflowStep>,
    state: WorkflowState,
    config: WorkflowConfig,
}

impl Workflow {
    /// An empty workflow with fresh state.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            state: WorkflowState::new(),
            config: WorkflowConfig::default(),
        }
    }

    /// Register a step.
    #[must_use]
    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Use `state` as the shared state, e.g. to seed inputs.
    #[must_use]
    pub fn with_state(mut self, state: WorkflowState) -> Self {
        self.state = state;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Base delay of the linear retry backoff.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    /// Whole-run deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// The workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle to the shared state.
    pub fn state(&self) -> WorkflowState {
        self.state.clone()
    }

    /// Step names in the order [`Self::execute`] would run them.
    ///
    /// Fails on duplicate names, unregistered dependencies or cycles.
    /// Registration order breaks ties between ready steps.
    pub fn execution_order(&self) -> Result<Vec<&str>> {
        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(Error::DuplicateStep(step.name.clone()));
            }
        }
        for step in &self.steps {
            if let Some(missing) = step.dependencies.iter().find(|d| !names.contains(d.as_str())) {
                return Err(Error::MissingDependency {
                    step: step.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut done: HashSet<&str> = HashSet::new();
        let mut order = Vec::with_capacity(self.steps.len());
        while order.len() < self.steps.len() {
            let ready = self.steps.iter().find(|s| {
                !done.contains(s.name.as_str())
                    && s.dependencies.iter().all(|d| done.contains(d.as_str()))
            });
            let Some(step) = ready else {
                let stuck = self
                    .steps
                    .iter()
                    .filter(|s| !done.contains(s.name.as_str()))
                    .map(|s| s.name.clone())
                    .collect();
                return Err(Error::DependencyCycle(stuck));
            };
            done.insert(step.name.as_str());
            order.push(step.name.as_str());
        }
        Ok(order)
    }

    /// Run every step once, in dependency order.
    ///
    /// Validation happens before any step runs. The deadline is checked
    /// before each step starts. If a step fails after its last attempt, or
    /// the deadline passes, every completed step's compensation runs once in
    /// reverse completion order and the step's error is returned. Compensation
    /// failures are logged and never replace that error.
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        let order = self.execution_order()?;
        let by_name: HashMap<&str, &WorkflowStep> =
            self.steps.iter().map(|s| (s.name.as_str(), s)).collect();
        let deadline = ctx.effective_deadline(self.config.timeout);
        let mut completed: Vec<&WorkflowStep> = Vec::with_capacity(order.len());

        tracing::info!(workflow = %self.name, steps = order.len(), "starting workflow");

        for name in order {
            let Some(step) = by_name.get(name).copied() else {
                continue;
            };

            let outcome = if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(workflow = %self.name, step = %name, "workflow deadline exceeded");
                Err(Error::Timeout(format!(
                    "workflow '{}' deadline exceeded before step '{name}'",
                    self.name
                )))
            } else {
                self.run_step(ctx, step, deadline).await
            };

            if let Err(err) = outcome {
                let err = err.in_step(name);
                ctx.record_failure(err.to_string());
                ctx.emit(WorkflowEvent::Error {
                    step_name: name.to_string(),
                    message: err.to_string(),
                });
                self.compensate(ctx, &completed).await;
                return Err(err);
            }
            completed.push(step);
        }

        tracing::info!(workflow = %self.name, "workflow finished");
        Ok(())
    }

    async fn run_step(
        &self,
        ctx: &ExecutionContext,
        step: &WorkflowStep,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let attempts = step.attempts();
        ctx.emit(WorkflowEvent::StepStart {
            step_name: step.name.clone(),
            input_type: "WorkflowState".to_string(),
        });
        let started = Instant::now();

        let mut attempt = 1;
        loop {
            match catch_faults((step.execute)(ctx.clone(), self.state.clone())).await {
                Ok(()) => {
                    ctx.record_step();
                    ctx.emit(WorkflowEvent::StepEnd {
                        step_name: step.name.clone(),
                        duration_ms: started.elapsed().as_millis(),
                    });
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    let wait = self.config.retry_delay * attempt;
                    if deadline.is_some_and(|d| Instant::now() + wait >= d) {
                        tracing::warn!(step = %step.name, attempt, error = %err, "no time left to retry");
                        return Err(Error::Timeout(format!(
                            "deadline reached while retrying after {attempt} attempts: {err}"
                        )));
                    }
                    tracing::warn!(
                        step = %step.name,
                        attempt,
                        retry_in_ms = wait.as_millis() as u64,
                        error = %err,
                        "workflow step failed, retrying"
                    );
                    ctx.record_retry();
                    ctx.emit(WorkflowEvent::StepRetry {
                        step_name: step.name.clone(),
                        attempt,
                        message: err.to_string(),
                    });
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) if attempts > 1 => {
                    return Err(Error::RetriesExhausted {
                        attempts,
                        source: Box::new(err),
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn compensate(&self, ctx: &ExecutionContext, completed: &[&WorkflowStep]) {
        for step in completed.iter().rev() {
            let Some(compensate) = &step.compensate else {
                continue;
            };
            tracing::info!(workflow = %self.name, step = %step.name, "compensating");
            ctx.record_compensation();
            let success = match catch_faults(compensate(ctx.clone(), self.state.clone())).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(step = %step.name, error = %err, "compensation failed");
                    false
                }
            };
            ctx.emit(WorkflowEvent::Compensation {
                step_name: step.name.clone(),
                success,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_step(log: &Log, name: &'static str) -> WorkflowStep {
        let log = Arc::clone(log);
        WorkflowStep::new(name, move |_ctx, _state| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(name.to_string());
                Ok(())
            }
        })
    }

    fn failing_step(name: &'static str) -> WorkflowStep {
        WorkflowStep::new(name, |_ctx, _state| async { Err(Error::Message("broken".into())) })
    }

    fn counting_compensation(step: WorkflowStep, counter: &Arc<AtomicUsize>) -> WorkflowStep {
        let counter = Arc::clone(counter);
        step.with_compensation(move |_ctx, _state| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn dependencies_run_first() {
        let log = Log::default();
        let workflow = Workflow::new("ordered")
            .step(logging_step(&log, "b").depends_on("a"))
            .step(logging_step(&log, "a"))
            .step(logging_step(&log, "c"));

        assert_eq!(workflow.execution_order().unwrap(), vec!["a", "b", "c"]);
        let ctx = ExecutionContext::new();
        workflow.execute(&ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(ctx.snapshot().steps_completed, 3);
    }

    #[tokio::test]
    async fn failed_dependency_blocks_dependents() {
        let log = Log::default();
        let workflow = Workflow::new("blocked")
            .step(failing_step("a"))
            .step(logging_step(&log, "b").depends_on("a"));

        let err = workflow.execute(&ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(&err, Error::Step { step, .. } if step == "a"));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn later_failure_compensates_completed_steps_once() {
        let log = Log::default();
        let undone_a = Arc::new(AtomicUsize::new(0));
        let undone_b = Arc::new(AtomicUsize::new(0));
        let workflow = Workflow::new("saga")
            .step(counting_compensation(logging_step(&log, "a"), &undone_a))
            .step(counting_compensation(failing_step("b").depends_on("a"), &undone_b));

        let ctx = ExecutionContext::new();
        let err = workflow.execute(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("'b'"));
        assert_eq!(undone_a.load(Ordering::SeqCst), 1);
        assert_eq!(undone_b.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.snapshot().compensations, 1);
    }

    #[tokio::test]
    async fn compensations_run_in_reverse_completion_order() {
        let log = Log::default();
        let undo = |step: WorkflowStep, label: &'static str| {
            let log = Arc::clone(&log);
            step.with_compensation(move |_ctx, _state| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push(format!("undo {label}"));
                    Ok(())
                }
            })
        };
        let workflow = Workflow::new("saga")
            .step(undo(logging_step(&log, "first"), "first"))
            .step(undo(logging_step(&log, "second"), "second").depends_on("first"))
            .step(failing_step("third").depends_on("second"));

        assert!(workflow.execute(&ExecutionContext::new()).await.is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "undo second", "undo first"]
        );
    }

    #[tokio::test]
    async fn compensation_failure_keeps_original_error() {
        let workflow = Workflow::new("saga")
            .step(
                WorkflowStep::new("a", |_ctx, _state| async { Ok(()) })
                    .with_compensation(|_ctx, _state| async { Err(Error::Message("undo failed".into())) }),
            )
            .step(failing_step("b"));

        let ctx = ExecutionContext::new();
        let err = workflow.execute(&ctx).await.unwrap_err();
        assert!(matches!(&err, Error::Step { step, .. } if step == "b"));
        assert!(ctx.trace_snapshot().iter().any(|t| t.event
            == WorkflowEvent::Compensation {
                step_name: "a".to_string(),
                success: false
            }));
    }

    #[tokio::test]
    async fn invalid_graphs_fail_before_running() {
        let log = Log::default();
        let missing = Workflow::new("missing")
            .step(logging_step(&log, "a"))
            .step(logging_step(&log, "b").depends_on("ghost"));
        let err = missing.execute(&ExecutionContext::new()).await.unwrap_err();
        assert!(matches!(err, Error::MissingDependency { ref dependency, .. } if dependency == "ghost"));
        assert!(log.lock().unwrap().is_empty());

        let cyclic = Workflow::new("cyclic")
            .step(logging_step(&log, "a").depends_on("b"))
            .step(logging_step(&log, "b").depends_on("a"));
        assert!(matches!(cyclic.execution_order(), Err(Error::DependencyCycle(_))));

        let duplicate = Workflow::new("duplicate")
            .step(logging_step(&log, "a"))
            .step(logging_step(&log, "a"));
        assert!(matches!(duplicate.execution_order(), Err(Error::DuplicateStep(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrying_step_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let workflow = Workflow::new("retry")
            .with_retry_delay(Duration::from_millis(1))
            .step(
                WorkflowStep::new("flaky", move |_ctx, state| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(Error::Reasoning("busy".into()))
                        } else {
                            state.set("done", &true)
                        }
                    }
                })
                .with_retries(3),
            );

        let ctx = ExecutionContext::new();
        workflow.execute(&ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.snapshot().retries, 2);
        assert_eq!(workflow.state().get::<bool>("done").unwrap(), Some(true));
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let workflow = Workflow::new("retry")
            .with_retry_delay(Duration::from_millis(1))
            .step(failing_step("never").with_retries(2));

        let err = workflow.execute(&ExecutionContext::new()).await.unwrap_err();
        assert!(err.to_string().contains("Failed after 2 attempts"), "{err}");
    }

    #[tokio::test]
    async fn expired_deadline_compensates() {
        let undone = Arc::new(AtomicUsize::new(0));
        let log = Log::default();
        let workflow = Workflow::new("late")
            .step(counting_compensation(
                WorkflowStep::new("slow", |_ctx, _state| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                }),
                &undone,
            ))
            .step(logging_step(&log, "next").depends_on("slow"));

        let ctx = ExecutionContext::new().with_timeout(Duration::from_millis(10));
        let err = workflow.execute(&ctx).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(undone.load(Ordering::SeqCst), 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_backoff_stops_at_the_deadline() {
        let undone = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let workflow = Workflow::new("bounded")
            .with_retry_delay(Duration::from_millis(100))
            .with_timeout(Duration::from_millis(20))
            .step(counting_compensation(
                WorkflowStep::new("reserve", |_ctx, _state| async { Ok(()) }),
                &undone,
            ))
            .step(
                WorkflowStep::new("charge", move |_ctx, _state| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::Reasoning("unavailable".into())) }
                })
                .depends_on("reserve")
                .with_retries(4),
            );

        let ctx = ExecutionContext::new();
        let started = Instant::now();
        let err = workflow.execute(&ctx).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(err.is_timeout(), "{err}");
        assert!(!err.to_string().contains("Failed after"), "{err}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(undone.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.snapshot().retries, 0);
    }

    #[test]
    fn state_rejects_mismatched_types() {
        let state = WorkflowState::new();
        state.set("name", "Ada").unwrap();
        assert!(matches!(state.get::<u64>("name"), Err(Error::Parse(_))));
        assert!(state.contains("name"));
        assert_eq!(state.keys(), vec!["name"]);
        assert_eq!(state.remove("name"), Some(Value::from("Ada")));
        assert!(state.snapshot().is_empty());
    }
}
