//! Bounded loops.

use std::future::Future;

use crate::{Error, Result};

/// Replace `state` with `body(state)` while `predicate(&state)` holds.
///
/// Fails with [`Error::Iteration`] (1-based) as soon as the body fails, and
/// with [`Error::MaxIterations`] if `max_iterations` bodies have run and the
/// predicate still holds.
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::loop_while;
///
/// # tokio_test::block_on(async {
/// let done = loop_while(0, |n: &i32| *n < 5, |n| async move { Ok(n + 1) }, 10)
///     .await
///     .unwrap();
/// assert_eq!(done, 5);
/// # });
/// ```
pub async fn loop_while<S, P, B, Fut>(
    initial: S,
    mut predicate: P,
    mut body: B,
    max_iterations: usize,
) -> Result<S>
where
    P: FnMut(&S) -> bool,
    B: FnMut(S) -> Fut,
    Fut: Future<Output = Result<S>>,
{
    let mut state = initial;
    let mut iterations = 0;

    while predicate(&state) {
        if iterations >= max_iterations {
            tracing::warn!(max_iterations, "loop predicate still true at iteration limit");
            return Err(Error::MaxIterations(max_iterations));
        }
        iterations += 1;
        state = body(state).await.map_err(|err| Error::Iteration {
            iteration: iterations,
            source: Box::new(err),
        })?;
    }

    tracing::debug!(iterations, "loop finished");
    Ok(state)
}
