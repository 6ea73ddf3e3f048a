//! Execution context shared by every orchestrated run.
//!
//! The context carries metrics, a structured trace log and an optional
//! deadline. Deadline expiry is the only cancellation signal: components
//! consult [`ExecutionContext::is_expired`] before starting new work and never
//! pre-empt work already in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::events::{TraceEntry, WorkflowEvent};
use crate::metrics::WorkflowMetrics;

/// Context passed to every step, batch and reasoning call.
///
/// This context is cloneable and thread-safe; clones share the same metrics
/// and trace log. The deadline is copied by value.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use llm_orchestrate::{ExecutionContext, WorkflowEvent};
///
/// let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(30));
/// ctx.emit(WorkflowEvent::StepStart {
///     step_name: "Summarize".to_string(),
///     input_type: "String".to_string(),
/// });
///
/// assert!(!ctx.is_expired());
/// assert_eq!(ctx.trace_snapshot().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Shared metrics accumulator.
    pub metrics: Arc<Mutex<WorkflowMetrics>>,
    /// Shared trace log for structured events.
    pub traces: Arc<Mutex<Vec<TraceEntry>>>,
    deadline: Option<Instant>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutionContext {
    /// Create a new execution context with empty metrics and traces and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(Mutex::new(WorkflowMetrics::default())),
            traces: Arc::new(Mutex::new(Vec::new())),
            deadline: None,
        }
    }

    /// Set an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The earlier of this context's deadline and `now + timeout`.
    ///
    /// Components with their own timeout use this to combine it with the
    /// caller's deadline.
    #[must_use]
    pub fn effective_deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        let own = timeout.map(|t| Instant::now() + t);
        match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Returns `true` once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline. `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Record token usage.
    pub fn record_tokens(&self, prompt: usize, completion: usize) {
        lock(&self.metrics).add_tokens(prompt, completion);
    }

    /// Record one call to the reasoning service.
    pub fn record_reasoning_call(&self) {
        lock(&self.metrics).reasoning_calls += 1;
    }

    /// Record a retry attempt.
    pub fn record_retry(&self) {
        lock(&self.metrics).retries += 1;
    }

    /// Record a compensating action.
    pub fn record_compensation(&self) {
        lock(&self.metrics).compensations += 1;
    }

    /// Increment the steps completed counter.
    pub fn record_step(&self) {
        lock(&self.metrics).record_step();
    }

    /// Record a step failure message.
    pub fn record_failure(&self, error: impl Into<String>) {
        lock(&self.metrics).record_failure(error.into());
    }

    /// Record a failure message without counting a failed step.
    pub fn record_error(&self, error: impl Into<String>) {
        lock(&self.metrics).record_error(error.into());
    }

    /// Get a snapshot of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> WorkflowMetrics {
        lock(&self.metrics).clone()
    }

    /// Emit a structured event to the trace log.
    ///
    /// Events are timestamped when emitted and mirrored to `tracing` at
    /// debug level.
    pub fn emit(&self, event: WorkflowEvent) {
        tracing::debug!(?event, "orchestration event");
        lock(&self.traces).push(TraceEntry::new(event));
    }

    /// Get a snapshot of the current trace log.
    #[must_use]
    pub fn trace_snapshot(&self) -> Vec<TraceEntry> {
        lock(&self.traces).clone()
    }

    /// Clear all trace entries.
    pub fn clear_traces(&self) {
        lock(&self.traces).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_metrics() {
        let ctx = ExecutionContext::new();
        let clone = ctx.clone();
        clone.record_reasoning_call();
        clone.record_reasoning_call();
        assert_eq!(ctx.snapshot().reasoning_calls, 2);
    }

    #[test]
    fn effective_deadline_takes_the_earlier() {
        let ctx = ExecutionContext::new().with_timeout(Duration::from_secs(60));
        let effective = ctx
            .effective_deadline(Some(Duration::from_millis(10)))
            .unwrap();
        assert!(effective < ctx.deadline().unwrap());
        assert_eq!(ExecutionContext::new().effective_deadline(None), None);
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let ctx = ExecutionContext::new().with_timeout(Duration::ZERO);
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
