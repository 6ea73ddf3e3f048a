//! Sequential pipelines over an evolving value.
//!
//! A [`Pipeline`] runs named steps in registration order, feeding each one
//! the value produced by the last successful step. Failures are collected in
//! the [`PipelineResult`] rather than returned directly, so a caller can see
//! how far a run got.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::step::Step;
use crate::{Error, ExecutionContext, Result, WorkflowEvent};

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stop at the first failed required step.
    pub fail_fast: bool,
    /// Retry failed steps up to `max_retries` attempts.
    pub retry_failed: bool,
    /// Attempts per step when `retry_failed` is set.
    pub max_retries: u32,
    /// Base of the linear backoff: attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
    /// Whole-run deadline, combined with the context's.
    pub timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fail_fast: true,
            retry_failed: false,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: None,
        }
    }
}

type BoxedOp<T> = Box<dyn Step<Input = T, Output = T> + Send + Sync>;

/// One named stage of a pipeline.
pub struct PipelineStep<T> {
    name: String,
    op: BoxedOp<T>,
    optional: bool,
}

impl<T> PipelineStep<T> {
    /// The step name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a failure of this step is tolerated.
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult<T> {
    /// The value after the last successful step.
    pub output: T,
    /// Steps that were started.
    pub steps_executed: usize,
    /// Steps that failed after all attempts.
    pub steps_failed: usize,
    /// Wall-clock duration.
    pub duration: Duration,
    /// One error per failed step, in execution order.
    pub errors: Vec<Error>,
}

impl<T> PipelineResult<T> {
    /// Whether no step failed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// The output, or the first recorded error.
    pub fn into_result(self) -> Result<T> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.output),
        }
    }
}

/// An ordered list of steps applied to a value.
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{ExecutionContext, LambdaStep, Pipeline};
///
/// # tokio_test::block_on(async {
/// let pipeline = Pipeline::new("normalize")
///     .add_step("trim", LambdaStep::new(|s: String| async move {
///         Ok::<String, llm_orchestrate::Error>(s.trim().to_string())
///     }))
///     .add_step("lower", LambdaStep::new(|s: String| async move {
///         Ok::<String, llm_orchestrate::Error>(s.to_lowercase())
///     }));
///
/// let result = pipeline.execute(&ExecutionContext::new(), "  Hello ".to_string()).await;
/// assert!(result.is_success());
/// assert_eq!(result.steps_executed, 2);
/// assert_eq!(result.output, "hello");
/// # });
/// ```
pub struct Pipeline<T> {
    name: String,
    steps: Vec<PipelineStep<T>>,
    config: PipelineConfig,
}

impl<T> Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// An empty pipeline with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            config: PipelineConfig::default(),
        }
    }

    /// Append a required step.
    #[must_use]
    pub fn add_step<S>(self, name: impl Into<String>, op: S) -> Self
    where
        S: Step<Input = T, Output = T> + 'static,
    {
        self.push(name.into(), Box::new(op), false)
    }

    /// Append a step whose failure is skipped over.
    #[must_use]
    pub fn add_optional_step<S>(self, name: impl Into<String>, op: S) -> Self
    where
        S: Step<Input = T, Output = T> + 'static,
    {
        self.push(name.into(), Box::new(op), true)
    }

    fn push(mut self, name: String, op: BoxedOp<T>, optional: bool) -> Self {
        self.steps.push(PipelineStep { name, op, optional });
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether a failed required step stops the run.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// Retry failed steps, up to `max_retries` attempts each.
    #[must_use]
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.config.retry_failed = true;
        self.config.max_retries = max_retries;
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

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The registered steps, in order.
    pub fn steps(&self) -> &[PipelineStep<T>] {
        &self.steps
    }

    /// The configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every step in order starting from `initial`.
    ///
    /// The deadline is checked before each step; once it has passed the run
    /// stops with a timeout error for that step. A failed optional step is
    /// skipped and the previous value carries on. A failed required step
    /// stops the run under `fail_fast` and is otherwise skipped the same way.
    pub async fn execute(&self, ctx: &ExecutionContext, initial: T) -> PipelineResult<T> {
        let started = Instant::now();
        let deadline = ctx.effective_deadline(self.config.timeout);
        let mut current = initial;
        let mut executed = 0;
        let mut failed = 0;
        let mut errors = Vec::new();

        tracing::info!(pipeline = %self.name, steps = self.steps.len(), "starting pipeline");

        for (index, step) in self.steps.iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::warn!(pipeline = %self.name, step = %step.name, index, "pipeline deadline exceeded");
                let err = Error::Timeout(format!(
                    "pipeline '{}' deadline exceeded before step {index} ('{}')",
                    self.name, step.name
                ));
                ctx.record_error(err.to_string());
                errors.push(err);
                break;
            }

            executed += 1;
            ctx.emit(WorkflowEvent::StepStart {
                step_name: step.name.clone(),
                input_type: std::any::type_name::<T>().to_string(),
            });
            let step_started = Instant::now();

            match self.run_step(ctx, step, &current, deadline).await {
                Ok(value) => {
                    current = value;
                    ctx.record_step();
                    ctx.emit(WorkflowEvent::StepEnd {
                        step_name: step.name.clone(),
                        duration_ms: step_started.elapsed().as_millis(),
                    });
                }
                Err(err) => {
                    failed += 1;
                    let err = err.in_step(step.name.clone());
                    ctx.record_failure(err.to_string());
                    ctx.emit(WorkflowEvent::Error {
                        step_name: step.name.clone(),
                        message: err.to_string(),
                    });
                    errors.push(err);

                    if step.optional {
                        tracing::debug!(step = %step.name, "skipping failed optional step");
                        ctx.emit(WorkflowEvent::StepSkipped {
                            step_name: step.name.clone(),
                            reason: "optional step failed".to_string(),
                        });
                    } else if self.config.fail_fast {
                        tracing::warn!(pipeline = %self.name, step = %step.name, "required step failed, stopping");
                        break;
                    } else {
                        tracing::warn!(pipeline = %self.name, step = %step.name, "required step failed, continuing");
                    }
                }
            }
        }

        let result = PipelineResult {
            output: current,
            steps_executed: executed,
            steps_failed: failed,
            duration: started.elapsed(),
            errors,
        };
        tracing::info!(
            pipeline = %self.name,
            executed = result.steps_executed,
            failed = result.steps_failed,
            "pipeline finished"
        );
        result
    }

    /// Retries stop early with a timeout when the next backoff would end
    /// past `deadline`.
    async fn run_step(
        &self,
        ctx: &ExecutionContext,
        step: &PipelineStep<T>,
        input: &T,
        deadline: Option<Instant>,
    ) -> Result<T> {
        let attempts = if self.config.retry_failed {
            self.config.max_retries.max(1)
        } else {
            1
        };

        let mut attempt = 1;
        loop {
            match step.op.run(ctx, input.clone()).await {
                Ok(value) => return Ok(value),
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
                        "pipeline step failed, retrying"
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
                Err(err) => return Err(err),
            }
        }
    }
}

/// A pipeline is a step over its value type, failing with the first
/// recorded error.
#[async_trait]
impl<T> Step for Pipeline<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Input = T;
    type Output = T;

    async fn run(&self, ctx: &ExecutionContext, input: T) -> Result<T> {
        self.execute(ctx, input).await.into_result()
    }

    fn name(&self) -> &str {
        &self.name
    }
}
