//! Merged dispatch: one reasoning call per chunk of items.

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::Semaphore;

use super::{deadline_passed, BatchConfig, BatchMode, BatchResult};
use crate::control::catch_faults;
use crate::reasoning::{self, parse_json, ReasoningRequest, ReasoningStep};
use crate::{Error, ExecutionContext, Result, WorkflowEvent};

/// Split `total` items into contiguous chunks of `chunk_size`.
///
/// Every chunk holds exactly `chunk_size` items except possibly the last,
/// which holds the remainder. A zero `chunk_size` is treated as one.
///
/// ```rust
/// use llm_orchestrate::batch::chunk_ranges;
///
/// let sizes: Vec<usize> = chunk_ranges(10, 3).iter().map(|r| r.len()).collect();
/// assert_eq!(sizes, vec![3, 3, 3, 1]);
/// ```
pub fn chunk_ranges(total: usize, chunk_size: usize) -> Vec<Range<usize>> {
    let size = chunk_size.max(1);
    (0..total)
        .step_by(size)
        .map(|start| start..(start + size).min(total))
        .collect()
}

#[derive(Serialize)]
struct TaggedInput<'a, I> {
    index: usize,
    input: &'a I,
}

fn chunk_instruction(instruction: &str, items: usize) -> String {
    format!(
        "{instruction}\n\n\
         You will receive {items} items, each tagged with an index. Process every item \
         independently and respond with a JSON array only, one entry per item: \
         [{{\"index\": <item index>, \"data\": <result for that item>}}]. \
         Include every index exactly once."
    )
}

/// Entries of a merged response: a bare array, or an object wrapping one.
fn response_entries(response: &str) -> Result<Vec<Value>> {
    match parse_json::<Value>(response)? {
        Value::Array(entries) => Ok(entries),
        Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("items")) {
            Some(Value::Array(entries)) => Ok(entries),
            _ => Err(Error::Parse("merged response object has no result array".into())),
        },
        other => Err(Error::Parse(format!("merged response is not an array: {other}"))),
    }
}

/// Map response entries back to chunk slots. `offset` is the global index of
/// the chunk's first item.
fn distribute<O: DeserializeOwned>(entries: Vec<Value>, offset: usize, len: usize) -> Vec<Result<O>> {
    let mut slots: Vec<Option<Result<O>>> = (0..len).map(|_| None).collect();

    for mut entry in entries {
        let Some(local) = entry.get("index").and_then(Value::as_u64).map(|i| i as usize) else {
            tracing::warn!(offset, "merged entry without index ignored");
            continue;
        };
        let Some(slot) = slots.get_mut(local) else {
            tracing::warn!(offset, index = local, "merged entry index out of range ignored");
            continue;
        };
        if slot.is_some() {
            continue;
        }
        let data = entry.get_mut("data").map(Value::take).unwrap_or(Value::Null);
        *slot = Some(
            serde_json::from_value(data)
                .map_err(|e| Error::Parse(format!("result for index {}: {e}", offset + local))),
        );
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(local, slot)| {
            slot.unwrap_or_else(|| Err(Error::Parse(format!("no result for index {}", offset + local))))
        })
        .collect()
}

async fn process_chunk<I, O>(
    ctx: &ExecutionContext,
    op: &ReasoningStep<I, O>,
    offset: usize,
    items: &[I],
) -> Result<Vec<Result<O>>>
where
    I: Serialize,
    O: DeserializeOwned,
{
    let tagged: Vec<TaggedInput<'_, I>> = items
        .iter()
        .enumerate()
        .map(|(index, input)| TaggedInput { index, input })
        .collect();
    let request = ReasoningRequest::new(
        chunk_instruction(op.instruction(), items.len()),
        serde_json::to_string_pretty(&tagged)?,
    )
    .with_options(op.options().clone());

    let response = reasoning::invoke(op.reasoner(), ctx, request).await?;
    let entries = response_entries(&response)?;
    Ok(distribute(entries, offset, items.len()))
}

/// Runs every chunk as one call, at most `max_concurrent` chunks at a time.
///
/// A failed call fails every item of its chunk with the same error; a
/// successful call that omits an index fails only that item.
pub(super) async fn run<I, O>(
    config: &BatchConfig,
    ctx: &ExecutionContext,
    inputs: Vec<I>,
    op: &ReasoningStep<I, O>,
) -> BatchResult<O>
where
    I: Serialize + Send + Sync,
    O: DeserializeOwned + Send,
{
    let started = Instant::now();
    let total = inputs.len();
    let ranges = chunk_ranges(total, config.chunk_size);
    let deadline = ctx.effective_deadline(config.timeout);
    let semaphore = Semaphore::new(config.max_concurrent.max(1));
    let calls = AtomicUsize::new(0);

    ctx.emit(WorkflowEvent::BatchDispatch {
        mode: "merged".to_string(),
        items: total,
        units: ranges.len(),
    });

    let (semaphore, calls, inputs) = (&semaphore, &calls, &inputs);
    let chunks = ranges.iter().cloned().enumerate().map(|(chunk, range)| async move {
        let Ok(_permit) = semaphore.acquire().await else {
            return (range, Err(Error::Internal("batch semaphore closed".to_string())));
        };
        if deadline_passed(deadline) {
            let err = Error::Timeout(format!("batch deadline exceeded before chunk {chunk} started"));
            return (range, Err(err));
        }

        calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(chunk, start = range.start, len = range.len(), "dispatching merged chunk");
        let outcome = catch_faults(process_chunk(ctx, op, range.start, &inputs[range.clone()])).await;
        let outcome = match outcome {
            Ok(_) if deadline_passed(deadline) => Err(Error::Timeout(format!(
                "chunk {chunk} finished after the batch deadline"
            ))),
            other => other,
        };
        (range, outcome)
    });

    let mut slots: Vec<Option<Result<O>>> = (0..total).map(|_| None).collect();
    for (range, outcome) in join_all(chunks).await {
        match outcome {
            Ok(items) => {
                for (offset, item) in items.into_iter().enumerate() {
                    slots[range.start + offset] = Some(item);
                }
            }
            Err(err) => {
                tracing::warn!(start = range.start, len = range.len(), error = %err, "merged chunk failed");
                for index in range {
                    slots[index] = Some(Err(err.clone()));
                }
            }
        }
    }

    let outcomes: Vec<Result<O>> = slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| Err(Error::Internal(format!("index {index} was never dispatched"))))
        })
        .collect();

    let api_calls = calls.load(Ordering::SeqCst);
    let prompt_tokens = op.instruction().chars().count().div_ceil(4);
    let tokens_saved = total.saturating_sub(api_calls) * prompt_tokens;
    let result = BatchResult::assemble(BatchMode::Merged, outcomes, started, api_calls, tokens_saved);
    tracing::info!(
        items = total,
        chunks = ranges.len(),
        succeeded = result.metadata.succeeded,
        failed = result.metadata.failed,
        api_calls,
        "merged batch finished"
    );
    result
}
