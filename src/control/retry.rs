//! Exponential-backoff retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::step::Step;
use crate::{Error, ExecutionContext, Result, WorkflowEvent};

/// An exponential backoff schedule capped at `max_delay`.
///
/// The delay after failed attempt `n` (0-based) is
/// `min(initial_delay * multiplier^n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Default schedule with `max_attempts` attempts.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Set the first delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Delay to wait after failed attempt `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

async fn retry_loop<T, F, Fut, H>(strategy: &RetryStrategy, mut op: F, mut on_retry: H) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    H: FnMut(u32, &Error, Duration),
{
    let attempts = strategy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            Err(err) => {
                let delay = strategy.delay_for(attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying"
                );
                on_retry(attempt, &err, delay);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Run `op` until it succeeds or `strategy.max_attempts` is used up.
///
/// On exhaustion the last error is wrapped in [`Error::RetriesExhausted`],
/// whose message reports the attempt count.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::time::Duration;
/// use llm_orchestrate::{with_retry, Error, RetryStrategy};
///
/// # tokio_test::block_on(async {
/// let calls = AtomicU32::new(0);
/// let strategy = RetryStrategy::new(3).with_initial_delay(Duration::ZERO);
/// let value = with_retry(&strategy, || async {
///     if calls.fetch_add(1, Ordering::SeqCst) < 2 {
///         Err(Error::Reasoning("busy".into()))
///     } else {
///         Ok(7)
///     }
/// })
/// .await
/// .unwrap();
/// assert_eq!(value, 7);
/// assert_eq!(calls.load(Ordering::SeqCst), 3);
/// # });
/// ```
pub async fn with_retry<T, F, Fut>(strategy: &RetryStrategy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_loop(strategy, op, |_, _, _| {}).await
}

/// A step retried according to a [`RetryStrategy`].
///
/// Each attempt receives a clone of the input. Retries are recorded in the
/// context metrics and trace log.
pub struct RetryStep<S> {
    inner: S,
    strategy: RetryStrategy,
}

impl<S: Step> RetryStep<S> {
    /// Wrap `inner` with `strategy`.
    pub fn new(inner: S, strategy: RetryStrategy) -> Self {
        Self { inner, strategy }
    }

    /// The retry schedule.
    pub fn strategy(&self) -> &RetryStrategy {
        &self.strategy
    }
}

#[async_trait]
impl<S> Step for RetryStep<S>
where
    S: Step,
    S::Input: Clone + Sync + 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        let name = self.inner.name();
        retry_loop(
            &self.strategy,
            || self.inner.run(ctx, input.clone()),
            |attempt, err, _| {
                ctx.record_retry();
                ctx.emit(WorkflowEvent::StepRetry {
                    step_name: name.to_string(),
                    attempt,
                    message: err.to_string(),
                });
            },
        )
        .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LambdaStep;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryStrategy {
        RetryStrategy::new(max_attempts).with_initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let strategy = RetryStrategy::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350));
        assert_eq!(strategy.delay_for(0), Duration::from_millis(100));
        assert_eq!(strategy.delay_for(1), Duration::from_millis(200));
        assert_eq!(strategy.delay_for(2), Duration::from_millis(350));
        assert_eq!(strategy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(5), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Reasoning("flaky".into()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn always_failing_reports_attempt_count() {
        let calls = AtomicU32::new(0);
        let err = with_retry(&fast(3), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Reasoning("down".into()))
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("3 attempts"), "{err}");
        match err {
            Error::RetriesExhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Reasoning(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = with_retry(&fast(0), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Message("no".into()))
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_step_records_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let step = RetryStep::new(
            LambdaStep::new(move |x: i32| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::Reasoning("once".into()))
                    } else {
                        Ok(x + 1)
                    }
                }
            }),
            fast(3),
        );

        let ctx = ExecutionContext::new();
        assert_eq!(step.run(&ctx, 1).await.unwrap(), 2);
        assert_eq!(ctx.snapshot().retries, 1);
        assert!(matches!(
            ctx.trace_snapshot()[0].event,
            WorkflowEvent::StepRetry { attempt: 1, .. }
        ));
    }
}
