//! Pattern matching over step inputs.
//!
//! A [`MatchStep`] is a small interpreter over an ordered list of arms. Each
//! arm belongs to a closed set of kinds ([`MatchKind`]) and routes matching
//! inputs to its own step. Arms are tried in registration order and the first
//! match wins.

use async_trait::async_trait;

use crate::step::{BoxedStepExt, Step};
use crate::{Error, ExecutionContext, Result};

/// A type tag for values routed by tag rather than by value.
///
/// Used by [`MatchStep::when_tag`] and by the
/// [`StateMachine`](crate::StateMachine) to key transitions on events.
pub trait Tagged {
    /// The tag identifying this value's variant.
    fn tag(&self) -> String;
}

impl Tagged for String {
    fn tag(&self) -> String {
        self.clone()
    }
}

impl Tagged for &str {
    fn tag(&self) -> String {
        (*self).to_string()
    }
}

impl Tagged for serde_json::Value {
    fn tag(&self) -> String {
        match self {
            serde_json::Value::Null => "null",
            serde_json::Value::Bool(_) => "bool",
            serde_json::Value::Number(_) => "number",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Array(_) => "array",
            serde_json::Value::Object(_) => "object",
        }
        .to_string()
    }
}

/// The kinds of arm a [`MatchStep`] understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Input equals a given value.
    Exact,
    /// Input's [`Tagged::tag`] equals a given tag.
    Tag,
    /// A predicate accepts the input.
    Predicate,
    /// Always matches.
    Otherwise,
}

type Test<I> = Box<dyn Fn(&I) -> bool + Send + Sync>;
type Handler<I, O> = Box<dyn Step<Input = I, Output = O> + Send + Sync>;

struct Arm<I, O> {
    kind: MatchKind,
    test: Test<I>,
    handler: Handler<I, O>,
}

/// Routes each input to the first arm that accepts it.
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{ExecutionContext, LambdaStep, MatchStep, Step};
///
/// # tokio_test::block_on(async {
/// let router = MatchStep::new()
///     .when_eq(0, LambdaStep::new(|_: i32| async move { Ok::<_, llm_orchestrate::Error>("zero".to_string()) }))
///     .when(|x: &i32| *x < 0, LambdaStep::new(|_: i32| async move { Ok::<_, llm_orchestrate::Error>("negative".to_string()) }))
///     .otherwise(LambdaStep::new(|x: i32| async move { Ok::<_, llm_orchestrate::Error>(format!("positive {x}")) }));
///
/// let ctx = ExecutionContext::new();
/// assert_eq!(router.run(&ctx, 0).await.unwrap(), "zero");
/// assert_eq!(router.run(&ctx, -4).await.unwrap(), "negative");
/// assert_eq!(router.run(&ctx, 9).await.unwrap(), "positive 9");
/// # });
/// ```
pub struct MatchStep<I, O> {
    arms: Vec<Arm<I, O>>,
    name: String,
}

impl<I, O> Default for MatchStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O> MatchStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// A match with no arms. Every input fails with [`Error::NoMatch`].
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            name: "match".to_string(),
        }
    }

    /// Set a human-readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn arm<S>(mut self, kind: MatchKind, test: Test<I>, handler: S) -> Self
    where
        S: Step<Input = I, Output = O> + 'static,
    {
        self.arms.push(Arm {
            kind,
            test,
            handler: handler.boxed(),
        });
        self
    }

    /// Match inputs equal to `value`.
    #[must_use]
    pub fn when_eq<S>(self, value: I, handler: S) -> Self
    where
        I: PartialEq + Sync,
        S: Step<Input = I, Output = O> + 'static,
    {
        self.arm(MatchKind::Exact, Box::new(move |input: &I| *input == value), handler)
    }

    /// Match inputs whose tag equals `tag`.
    #[must_use]
    pub fn when_tag<S>(self, tag: impl Into<String>, handler: S) -> Self
    where
        I: Tagged,
        S: Step<Input = I, Output = O> + 'static,
    {
        let tag = tag.into();
        self.arm(MatchKind::Tag, Box::new(move |input: &I| input.tag() == tag), handler)
    }

    /// Match inputs accepted by `predicate`.
    #[must_use]
    pub fn when<P, S>(self, predicate: P, handler: S) -> Self
    where
        P: Fn(&I) -> bool + Send + Sync + 'static,
        S: Step<Input = I, Output = O> + 'static,
    {
        self.arm(MatchKind::Predicate, Box::new(predicate), handler)
    }

    /// Match everything not matched by an earlier arm.
    #[must_use]
    pub fn otherwise<S>(self, handler: S) -> Self
    where
        S: Step<Input = I, Output = O> + 'static,
    {
        self.arm(MatchKind::Otherwise, Box::new(|_: &I| true), handler)
    }

    /// Index and kind of the arm that would handle `input`.
    pub fn select(&self, input: &I) -> Option<(usize, MatchKind)> {
        self.arms
            .iter()
            .position(|arm| (arm.test)(input))
            .map(|index| (index, self.arms[index].kind))
    }
}

#[async_trait]
impl<I, O> Step for MatchStep<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, ctx: &ExecutionContext, input: I) -> Result<O> {
        let (index, kind) = self.select(&input).ok_or(Error::NoMatch)?;
        tracing::debug!(matcher = %self.name, arm = index, ?kind, "match arm selected");
        self.arms[index].handler.run(ctx, input).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoxedStepExt, LambdaStep};
    use serde_json::{json, Value};

    fn label(text: &'static str) -> Handler<Value, String> {
        LambdaStep::new(move |_: Value| async move { Ok::<_, Error>(text.to_string()) }).boxed()
    }

    #[tokio::test]
    async fn arms_are_tried_in_registration_order() {
        let router = MatchStep::new()
            .when(|v: &Value| v.is_number(), label("predicate"))
            .when_tag("number", label("tag"))
            .otherwise(label("default"));

        let ctx = ExecutionContext::new();
        assert_eq!(router.run(&ctx, json!(3)).await.unwrap(), "predicate");
        assert_eq!(router.select(&json!(3)), Some((0, MatchKind::Predicate)));
        assert_eq!(router.run(&ctx, json!("x")).await.unwrap(), "default");
    }

    #[tokio::test]
    async fn tag_and_exact_arms() {
        let router = MatchStep::new()
            .when_eq(json!({"cmd": "stop"}), label("exact"))
            .when_tag("object", label("object"))
            .when_tag("array", label("array"));

        let ctx = ExecutionContext::new();
        assert_eq!(router.run(&ctx, json!({"cmd": "stop"})).await.unwrap(), "exact");
        assert_eq!(router.run(&ctx, json!({"cmd": "go"})).await.unwrap(), "object");
        assert_eq!(router.run(&ctx, json!([1])).await.unwrap(), "array");
    }

    #[tokio::test]
    async fn unmatched_input_fails() {
        let router = MatchStep::new().when_tag("string", label("string"));
        let err = router.run(&ExecutionContext::new(), json!(null)).await.unwrap_err();
        assert!(matches!(err, Error::NoMatch));
    }
}
