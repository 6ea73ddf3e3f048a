//! Metrics collection for orchestrated runs.
//!
//! This module provides `WorkflowMetrics` for tracking token usage,
//! reasoning calls, retries, compensations and failures.

use serde::{Deserialize, Serialize};

/// Aggregated metrics for one or more orchestrated runs.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    /// Total prompt tokens consumed.
    pub prompt_token_count: usize,
    /// Total completion tokens generated.
    pub completion_token_count: usize,
    /// Total tokens (prompt + completion).
    pub total_token_count: usize,
    /// Number of calls made to the reasoning service.
    pub reasoning_calls: usize,
    /// Number of steps completed successfully.
    pub steps_completed: usize,
    /// Number of steps that failed after exhausting their attempts.
    pub steps_failed: usize,
    /// Number of retry attempts beyond each unit's first attempt.
    pub retries: usize,
    /// Number of compensating actions invoked.
    pub compensations: usize,
    /// Collected failure messages.
    pub failures: Vec<String>,
}

impl WorkflowMetrics {
    /// Record both prompt and completion tokens.
    pub fn add_tokens(&mut self, prompt: usize, completion: usize) {
        self.prompt_token_count += prompt;
        self.completion_token_count += completion;
        self.total_token_count += prompt + completion;
    }

    /// Record a failure message.
    pub fn record_failure(&mut self, error: String) {
        self.steps_failed += 1;
        self.failures.push(error);
    }

    /// Record a failure message that is not attributed to a step.
    pub fn record_error(&mut self, error: String) {
        self.failures.push(error);
    }

    /// Increment the steps completed counter.
    pub fn record_step(&mut self) {
        self.steps_completed += 1;
    }

    /// Check if there were any failures.
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Get the total number of tokens used.
    pub fn total_tokens(&self) -> usize {
        self.total_token_count
    }
}
