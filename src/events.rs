//! Structured execution events for tracing and observability.
//!
//! Every event recorded through [`ExecutionContext::emit`](crate::ExecutionContext::emit)
//! is both appended to the context's trace log and forwarded to `tracing`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Events that can be emitted during orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkflowEvent {
    /// A step has started execution.
    StepStart {
        /// Name of the step being executed.
        step_name: String,
        /// The Rust type name of the input.
        input_type: String,
    },
    /// A step has finished successfully.
    StepEnd {
        /// Name of the step that completed.
        step_name: String,
        /// Duration of execution in milliseconds.
        duration_ms: u128,
    },
    /// A failed attempt is about to be retried.
    StepRetry {
        /// Name of the step being retried.
        step_name: String,
        /// 1-based number of the attempt that failed.
        attempt: u32,
        /// Error message of the failed attempt.
        message: String,
    },
    /// A failed optional step was skipped.
    StepSkipped {
        /// Name of the skipped step.
        step_name: String,
        /// Why it was skipped.
        reason: String,
    },
    /// A compensating action ran for a completed workflow step.
    Compensation {
        /// Name of the step being rolled back.
        step_name: String,
        /// Whether the compensation succeeded.
        success: bool,
    },
    /// A state machine moved between states.
    StateTransition {
        /// Debug rendering of the previous state.
        from: String,
        /// Tag of the triggering event.
        event: String,
        /// Debug rendering of the new state.
        to: String,
    },
    /// A batch run was dispatched.
    BatchDispatch {
        /// `"parallel"` or `"merged"`.
        mode: String,
        /// Number of input items.
        items: usize,
        /// Number of reasoning-call units planned (items or chunks).
        units: usize,
    },
    /// A decision was selected.
    DecisionMade {
        /// Index of the selected candidate.
        selected_index: usize,
        /// Whether a deterministic condition selected it.
        deterministic: bool,
    },
    /// An error occurred during step execution.
    Error {
        /// Name of the step where the error occurred.
        step_name: String,
        /// Error message describing what went wrong.
        message: String,
    },
}

/// A timestamped trace entry containing a workflow event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Unix epoch timestamp in milliseconds when this event occurred.
    pub timestamp: u128,
    /// The recorded event.
    #[serde(flatten)]
    pub event: WorkflowEvent,
}

impl TraceEntry {
    /// Create a new trace entry with the current timestamp.
    #[must_use]
    pub fn new(event: WorkflowEvent) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        Self { timestamp, event }
    }
}
