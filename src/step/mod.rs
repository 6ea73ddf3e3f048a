//! Core step trait and fundamental step types.
//!
//! This module defines the [`Step`] trait, the typed async unit every
//! pipeline stage, batch item and match arm is built from, along with
//! [`LambdaStep`] for closure-based steps and [`BoxedStepExt`] for wrapping
//! steps in retry and fault barriers.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::control::fault::FaultBarrier;
use crate::control::retry::{RetryStep, RetryStrategy};
use crate::{ExecutionContext, Result};

/// The fundamental trait for composable, async units of work.
///
/// Each step receives the shared execution context (for metrics, tracing and
/// the deadline) and a typed input, and produces a typed output or an error.
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{Step, ExecutionContext, LambdaStep};
///
/// # tokio_test::block_on(async {
/// let double = LambdaStep::new(|x: i32| async move {
///     Ok::<i32, llm_orchestrate::Error>(x * 2)
/// });
/// assert_eq!(double.run(&ExecutionContext::new(), 21).await.unwrap(), 42);
/// # });
/// ```
#[async_trait]
pub trait Step: Send + Sync {
    /// The input type for this step.
    type Input: Send;
    /// The output type produced by this step.
    type Output: Send;

    /// Execute this step with the provided context and input.
    async fn run(&self, ctx: &ExecutionContext, input: Self::Input) -> Result<Self::Output>;

    /// Returns a human-readable name for this step. Defaults to the type name.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A step constructed from a closure.
///
/// The type parameters `I` and `O` encode the input and output types,
/// while `F` is the concrete closure type.
pub struct LambdaStep<I, O, F> {
    /// The underlying closure.
    pub f: F,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O, F, Fut> LambdaStep<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    /// Create a new `LambdaStep` from the given closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, I, O, Fut> Step for LambdaStep<I, O, F>
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    I: Send + 'static,
    O: Send + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, _ctx: &ExecutionContext, input: I) -> Result<O> {
        (self.f)(input).await
    }
}

/// Extension trait providing wrapping combinators for all [`Step`] implementors.
///
/// - [`BoxedStepExt::with_retry`]: re-run failed attempts with exponential backoff
/// - [`BoxedStepExt::catch_faults`]: turn panics into [`Error::Internal`](crate::Error::Internal)
/// - [`BoxedStepExt::boxed`]: erase the concrete type behind a `Box<dyn Step<...>>`
pub trait BoxedStepExt: Step + Sized {
    /// Retry this step according to `strategy`.
    ///
    /// # Example
    ///
    /// ```rust
    /// use llm_orchestrate::{LambdaStep, BoxedStepExt, RetryStrategy};
    ///
    /// let step = LambdaStep::new(|x: i32| async move { Ok::<i32, llm_orchestrate::Error>(x) })
    ///     .with_retry(RetryStrategy::new(5));
    /// ```
    fn with_retry(self, strategy: RetryStrategy) -> RetryStep<Self>
    where
        Self::Input: Clone + Sync,
    {
        RetryStep::new(self, strategy)
    }

    /// Capture panics raised while this step runs.
    fn catch_faults(self) -> FaultBarrier<Self> {
        FaultBarrier::new(self)
    }

    /// Erase the concrete step type, returning a trait object.
    fn boxed(self) -> Box<dyn Step<Input = Self::Input, Output = Self::Output> + Send + Sync>
    where
        Self: 'static,
    {
        Box::new(self)
    }
}

impl<T: Step + Sized> BoxedStepExt for T {}

// Boxed steps are steps, so pipelines and match arms can store them.
#[async_trait]
impl<I, O> Step for Box<dyn Step<Input = I, Output = O> + Send + Sync>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, ctx: &ExecutionContext, input: I) -> Result<O> {
        (**self).run(ctx, input).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<S> Step for Arc<S>
where
    S: Step + ?Sized,
    S::Input: 'static,
    S::Output: 'static,
{
    type Input = S::Input;
    type Output = S::Output;

    async fn run(&self, ctx: &ExecutionContext, input: S::Input) -> Result<S::Output> {
        (**self).run(ctx, input).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
