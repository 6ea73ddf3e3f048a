//! Parallel dispatch: one invocation per item.

use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;

use super::{deadline_passed, BatchConfig, BatchMode, BatchResult};
use crate::control::catch_faults;
use crate::step::Step;
use crate::{Error, ExecutionContext, WorkflowEvent};

/// Runs every item through `op`, gated by a counting semaphore.
///
/// The deadline is checked once a permit is held: items that have not
/// started by then fail with a timeout, and items that finish after it have
/// their result discarded.
pub(super) async fn run<S>(
    config: &BatchConfig,
    ctx: &ExecutionContext,
    inputs: Vec<S::Input>,
    op: &S,
) -> BatchResult<S::Output>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    let started = Instant::now();
    let total = inputs.len();
    let deadline = ctx.effective_deadline(config.timeout);
    let semaphore = Semaphore::new(config.max_concurrent.max(1));
    let calls = AtomicUsize::new(0);

    ctx.emit(WorkflowEvent::BatchDispatch {
        mode: "parallel".to_string(),
        items: total,
        units: total,
    });

    let (semaphore, calls) = (&semaphore, &calls);
    let items = inputs.into_iter().enumerate().map(|(index, input)| async move {
        let Ok(_permit) = semaphore.acquire().await else {
            return Err(Error::Internal("batch semaphore closed".to_string()));
        };
        if deadline_passed(deadline) {
            return Err(Error::Timeout(format!(
                "batch deadline exceeded before item {index} started"
            )));
        }

        calls.fetch_add(1, Ordering::SeqCst);
        let outcome = catch_faults(op.run(ctx, input)).await;
        match outcome {
            Ok(_) if deadline_passed(deadline) => Err(Error::Timeout(format!(
                "item {index} finished after the batch deadline"
            ))),
            other => {
                if let Err(err) = &other {
                    tracing::debug!(index, error = %err, "batch item failed");
                }
                other
            }
        }
    });

    let outcomes = join_all(items).await;
    let api_calls = calls.load(Ordering::SeqCst);
    let result = BatchResult::assemble(BatchMode::Parallel, outcomes, started, api_calls, 0);
    tracing::info!(
        items = total,
        succeeded = result.metadata.succeeded,
        failed = result.metadata.failed,
        api_calls,
        "parallel batch finished"
    );
    result
}
