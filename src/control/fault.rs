//! Capturing unexpected runtime faults as errors.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::step::Step;
use crate::{Error, ExecutionContext, Result};

/// Await `future`, converting a panic into [`Error::Internal`].
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{catch_faults, Error};
///
/// # tokio_test::block_on(async {
/// let err = catch_faults(async {
///     let items: Vec<u32> = Vec::new();
///     Ok::<u32, Error>(items[3])
/// })
/// .await
/// .unwrap_err();
/// assert!(matches!(err, Error::Internal(_)));
/// # });
/// ```
pub async fn catch_faults<T, F>(future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(%message, "captured fault");
            Err(Error::Internal(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A step whose panics surface as [`Error::Internal`].
pub struct FaultBarrier<S> {
    inner: S,
}

impl<S: Step> FaultBarrier<S> {
    /// Wrap `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Step for FaultBarrier<S>
where
    S: Step,
    S::Input: 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        catch_faults(self.inner.run(ctx, input)).await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxedStepExt, LambdaStep};

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let step = LambdaStep::new(|x: i32| async move {
            if x < 0 {
                panic!("negative input");
            }
            Ok::<i32, Error>(x)
        })
        .catch_faults();

        let ctx = ExecutionContext::new();
        assert_eq!(step.run(&ctx, 3).await.unwrap(), 3);
        match step.run(&ctx, -1).await {
            Err(Error::Internal(message)) => assert_eq!(message, "negative input"),
            other => panic!("expected internal fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ordinary_errors_pass_through() {
        let err = catch_faults(async { Err::<(), _>(Error::Parse("bad".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
