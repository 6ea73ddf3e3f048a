//! Batch execution of homogeneous work items.
//!
//! A [`BatchProcessor`] dispatches many independent inputs either as one
//! reasoning call per item ([`BatchMode::Parallel`]) or as one call per chunk
//! of items ([`BatchMode::Merged`]). [`BatchMode::Auto`] picks between them
//! with a tunable heuristic. Whatever the mode, every input gets its own
//! result-or-error slot: one item's failure never aborts the batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::reasoning::ReasoningStep;
use crate::step::Step;
use crate::{Error, ExecutionContext, Result};

mod merged;
mod parallel;

pub use merged::chunk_ranges;

/// How a batch is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    /// One concurrent call per item.
    Parallel,
    /// One call per chunk of items.
    Merged,
    /// Decide per run with [`BatchProcessor::choose_mode`].
    #[default]
    Auto,
}

impl BatchMode {
    fn label(self) -> &'static str {
        match self {
            BatchMode::Parallel => "parallel",
            BatchMode::Merged => "merged",
            BatchMode::Auto => "auto",
        }
    }
}

/// Batch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Dispatch mode.
    pub mode: BatchMode,
    /// Concurrent calls in flight at once.
    pub max_concurrent: usize,
    /// Items per merged call.
    pub chunk_size: usize,
    /// Auto mode merges when there are more items than this.
    pub merge_threshold: usize,
    /// Auto mode merges same-shaped inputs from this many items up.
    pub similarity_min_items: usize,
    /// Batch-wide deadline, combined with the context's.
    pub timeout: Option<Duration>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            mode: BatchMode::Auto,
            max_concurrent: 5,
            chunk_size: 10,
            merge_threshold: 20,
            similarity_min_items: 3,
            timeout: None,
        }
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    /// The mode actually used (never `Auto`).
    pub mode: BatchMode,
    /// Number of inputs.
    pub total_items: usize,
    /// Items with a result.
    pub succeeded: usize,
    /// Items with an error.
    pub failed: usize,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Reasoning-call units started (items or chunks).
    pub api_calls: usize,
    /// Rough prompt tokens avoided by merging.
    pub estimated_tokens_saved: usize,
}

/// Index-aligned outcome of a batch run.
///
/// `results[i]` is `Some` exactly when `errors[i]` is `None`.
#[derive(Debug, Clone)]
pub struct BatchResult<T> {
    /// Per-item results.
    pub results: Vec<Option<T>>,
    /// Per-item errors.
    pub errors: Vec<Option<Error>>,
    /// Run summary.
    pub metadata: BatchMetadata,
}

impl<T> BatchResult<T> {
    fn assemble(
        mode: BatchMode,
        outcomes: Vec<Result<T>>,
        started: Instant,
        api_calls: usize,
        estimated_tokens_saved: usize,
    ) -> Self {
        let total_items = outcomes.len();
        let mut results = Vec::with_capacity(total_items);
        let mut errors = Vec::with_capacity(total_items);
        for outcome in outcomes {
            match outcome {
                Ok(value) => {
                    results.push(Some(value));
                    errors.push(None);
                }
                Err(err) => {
                    results.push(None);
                    errors.push(Some(err));
                }
            }
        }
        let failed = errors.iter().filter(|e| e.is_some()).count();

        Self {
            results,
            errors,
            metadata: BatchMetadata {
                mode,
                total_items,
                succeeded: total_items - failed,
                failed,
                duration: started.elapsed(),
                api_calls,
                estimated_tokens_saved,
            },
        }
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether the batch had no items.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Whether every item succeeded.
    pub fn is_complete_success(&self) -> bool {
        self.metadata.failed == 0
    }

    /// Successful items with their input index.
    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|v| (i, v)))
    }

    /// Failed items with their input index.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &Error)> {
        self.errors
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|err| (i, err)))
    }

    /// The lowest-index error, if any.
    pub fn first_error(&self) -> Option<&Error> {
        self.errors.iter().flatten().next()
    }

    /// All results in input order, or the lowest-index error.
    pub fn into_results(self) -> Result<Vec<T>> {
        self.results
            .into_iter()
            .zip(self.errors)
            .map(|(result, error)| match (result, error) {
                (Some(value), _) => Ok(value),
                (None, Some(err)) => Err(err),
                (None, None) => Err(Error::Internal("batch slot without result or error".into())),
            })
            .collect()
    }
}

/// Dispatches batches according to a [`BatchConfig`].
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{BatchMode, BatchProcessor, ExecutionContext, LambdaStep};
///
/// # tokio_test::block_on(async {
/// let square = LambdaStep::new(|x: u64| async move { Ok::<u64, llm_orchestrate::Error>(x * x) });
/// let batch = BatchProcessor::new().with_max_concurrent(2);
///
/// let result = batch.run_parallel(&ExecutionContext::new(), vec![1, 2, 3], &square).await;
/// assert_eq!(result.metadata.mode, BatchMode::Parallel);
/// assert_eq!(result.metadata.api_calls, 3);
/// assert_eq!(result.into_results().unwrap(), vec![1, 4, 9]);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    /// A processor with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A processor with `config`.
    #[must_use]
    pub fn with_config(config: BatchConfig) -> Self {
        Self { config }
    }

    /// Force a dispatch mode.
    #[must_use]
    pub fn with_mode(mut self, mode: BatchMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Limit concurrent calls. Zero is treated as one.
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    /// Items per merged call. Zero is treated as one.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    /// Item count above which auto mode merges.
    #[must_use]
    pub fn with_merge_threshold(mut self, threshold: usize) -> Self {
        self.config.merge_threshold = threshold;
        self
    }

    /// Minimum count of same-shaped items for auto mode to merge.
    #[must_use]
    pub fn with_similarity_min_items(mut self, min_items: usize) -> Self {
        self.config.similarity_min_items = min_items;
        self
    }

    /// Batch-wide deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// The configuration.
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// The mode a run over `inputs` would use.
    ///
    /// In auto mode: merged when there are more than `merge_threshold`
    /// items, or at least `similarity_min_items` items that all serialize to
    /// the same JSON shape; parallel otherwise.
    pub fn choose_mode<I: Serialize>(&self, inputs: &[I]) -> BatchMode {
        match self.config.mode {
            BatchMode::Auto => {}
            forced => return forced,
        }
        if inputs.len() > self.config.merge_threshold {
            return BatchMode::Merged;
        }
        if inputs.len() >= self.config.similarity_min_items.max(1) && same_shape(inputs) {
            return BatchMode::Merged;
        }
        BatchMode::Parallel
    }

    /// Run `op` over `inputs` in the mode chosen by [`Self::choose_mode`].
    pub async fn run<I, O>(
        &self,
        ctx: &ExecutionContext,
        inputs: Vec<I>,
        op: &ReasoningStep<I, O>,
    ) -> BatchResult<O>
    where
        I: Serialize + Send + Sync + 'static,
        O: DeserializeOwned + Send + 'static,
    {
        let mode = self.choose_mode(&inputs);
        tracing::info!(items = inputs.len(), mode = mode.label(), "running batch");
        match mode {
            BatchMode::Merged => self.run_merged(ctx, inputs, op).await,
            _ => self.run_parallel(ctx, inputs, op).await,
        }
    }

    /// One concurrent invocation of `op` per input, at most `max_concurrent`
    /// at a time.
    pub async fn run_parallel<S>(
        &self,
        ctx: &ExecutionContext,
        inputs: Vec<S::Input>,
        op: &S,
    ) -> BatchResult<S::Output>
    where
        S: Step,
        S::Input: 'static,
        S::Output: 'static,
    {
        parallel::run(&self.config, ctx, inputs, op).await
    }

    /// One reasoning call per chunk of `chunk_size` inputs.
    pub async fn run_merged<I, O>(
        &self,
        ctx: &ExecutionContext,
        inputs: Vec<I>,
        op: &ReasoningStep<I, O>,
    ) -> BatchResult<O>
    where
        I: Serialize + Send + Sync,
        O: DeserializeOwned + Send,
    {
        merged::run(&self.config, ctx, inputs, op).await
    }
}

fn shape(value: &serde_json::Value) -> String {
    use crate::control::Tagged;

    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            format!("object{{{}}}", keys.join(","))
        }
        other => other.tag(),
    }
}

fn same_shape<I: Serialize>(inputs: &[I]) -> bool {
    let mut shapes = inputs.iter().map(|input| serde_json::to_value(input).ok().map(|v| shape(&v)));
    let Some(Some(first)) = shapes.next() else {
        return false;
    };
    shapes.all(|s| s.as_deref() == Some(first.as_str()))
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forced_modes_are_respected() {
        let items = vec![1, 2, 3, 4];
        let parallel = BatchProcessor::new().with_mode(BatchMode::Parallel);
        assert_eq!(parallel.choose_mode(&items), BatchMode::Parallel);
        let merged = BatchProcessor::new().with_mode(BatchMode::Merged);
        assert_eq!(merged.choose_mode(&[1]), BatchMode::Merged);
    }

    #[test]
    fn auto_mode_merges_large_batches() {
        let mixed: Vec<serde_json::Value> = (0..21)
            .map(|i| if i % 2 == 0 { json!(i) } else { json!({"i": i}) })
            .collect();
        assert_eq!(BatchProcessor::new().choose_mode(&mixed), BatchMode::Merged);
    }

    #[test]
    fn auto_mode_merges_same_shaped_inputs() {
        let batch = BatchProcessor::new();
        let same = vec![json!({"a": 1, "b": 2}), json!({"b": 0, "a": 9}), json!({"a": 3, "b": 4})];
        assert_eq!(batch.choose_mode(&same), BatchMode::Merged);

        let mixed = vec![json!({"a": 1}), json!("text"), json!({"a": 3})];
        assert_eq!(batch.choose_mode(&mixed), BatchMode::Parallel);

        let few = vec![json!({"a": 1}), json!({"a": 2})];
        assert_eq!(batch.choose_mode(&few), BatchMode::Parallel);
    }

    #[test]
    fn result_accessors() {
        let result = BatchResult::assemble(
            BatchMode::Parallel,
            vec![Ok(1), Err(Error::Reasoning("x".into())), Ok(3)],
            Instant::now(),
            3,
            0,
        );
        assert_eq!(result.len(), 3);
        assert_eq!(result.metadata.succeeded + result.metadata.failed, result.metadata.total_items);
        assert_eq!(result.successes().map(|(i, _)| i).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(result.failures().map(|(i, _)| i).collect::<Vec<_>>(), vec![1]);
        assert!(!result.is_complete_success());
        assert!(matches!(result.first_error(), Some(Error::Reasoning(_))));
        assert!(result.into_results().is_err());
    }
}
