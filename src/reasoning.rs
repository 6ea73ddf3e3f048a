//! The reasoning collaborator boundary.
//!
//! Everything in this crate ultimately reduces to one primitive: submit a
//! system instruction and a user payload to a reasoning service and get text
//! back. Callers supply that primitive as a [`Reasoner`]; configuration
//! travels with every [`ReasoningRequest`] rather than living in shared
//! process state, so concurrent calls never observe each other's settings.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::step::Step;
use crate::{Error, ExecutionContext, Result};

/// Capability tier requested from the reasoning service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntelligenceTier {
    /// Cheapest, lowest-latency model.
    Fast,
    /// Balanced default.
    #[default]
    Smart,
    /// Most capable model.
    Genius,
}

/// Per-call options for a reasoning request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningOptions {
    /// Free-form guidance appended to the system instruction.
    pub steering: Option<String>,
    /// Requested capability tier.
    pub tier: IntelligenceTier,
    /// Upper bound on a single call.
    pub timeout: Option<Duration>,
}

impl ReasoningOptions {
    /// Options with default tier, no steering and no timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append steering text to the system instruction.
    #[must_use]
    pub fn with_steering(mut self, steering: impl Into<String>) -> Self {
        self.steering = Some(steering.into());
        self
    }

    /// Request a capability tier.
    #[must_use]
    pub fn with_tier(mut self, tier: IntelligenceTier) -> Self {
        self.tier = tier;
        self
    }

    /// Bound each call by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One request to the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    /// System instruction.
    pub system: String,
    /// User payload.
    pub user: String,
    /// Call options.
    pub options: ReasoningOptions,
}

impl ReasoningRequest {
    /// Create a request with default options.
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            options: ReasoningOptions::default(),
        }
    }

    /// Replace the request options.
    #[must_use]
    pub fn with_options(mut self, options: ReasoningOptions) -> Self {
        self.options = options;
        self
    }

    /// The system instruction with any steering text appended.
    #[must_use]
    pub fn system_prompt(&self) -> String {
        match self.options.steering.as_deref() {
            Some(steering) if !steering.trim().is_empty() => {
                format!("{}\n\nAdditional guidance: {}", self.system, steering.trim())
            }
            _ => self.system.clone(),
        }
    }
}

/// Token usage reported by the reasoning service for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt: usize,
    /// Tokens in the completion.
    pub completion: usize,
}

/// Response text plus whatever usage the service reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningResponse {
    /// Raw response text.
    pub text: String,
    /// Token usage, when the service reports it.
    pub usage: Option<TokenUsage>,
}

impl ReasoningResponse {
    /// A response without usage information.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
        }
    }

    /// Attach token usage.
    #[must_use]
    pub fn with_usage(mut self, prompt: usize, completion: usize) -> Self {
        self.usage = Some(TokenUsage { prompt, completion });
        self
    }
}

impl From<String> for ReasoningResponse {
    fn from(text: String) -> Self {
        Self::new(text)
    }
}

impl From<&str> for ReasoningResponse {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// The external reasoning service.
///
/// Implementations send the request wherever they like and return the
/// response text, with token usage when known. `request.system` already
/// carries any steering text by the time [`invoke`] hands the request over.
/// Failures should be reported as [`Error::Reasoning`]; any other error is
/// converted to one by [`invoke`].
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Submit `request` and return the response.
    async fn invoke(&self, request: ReasoningRequest) -> Result<ReasoningResponse>;
}

#[async_trait]
impl<R: Reasoner + ?Sized> Reasoner for Arc<R> {
    async fn invoke(&self, request: ReasoningRequest) -> Result<ReasoningResponse> {
        (**self).invoke(request).await
    }
}

/// A [`Reasoner`] backed by a closure.
///
/// The closure may return plain text or a full [`ReasoningResponse`].
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{LambdaReasoner, Reasoner, ReasoningRequest};
///
/// # tokio_test::block_on(async {
/// let echo = LambdaReasoner::new(|req: ReasoningRequest| async move {
///     Ok::<String, llm_orchestrate::Error>(req.user.to_uppercase())
/// });
/// let reply = echo.invoke(ReasoningRequest::new("shout", "hi")).await.unwrap();
/// assert_eq!(reply.text, "HI");
/// assert!(reply.usage.is_none());
/// # });
/// ```
pub struct LambdaReasoner<F> {
    f: F,
}

impl<F, Fut, R> LambdaReasoner<F>
where
    F: Fn(ReasoningRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
    R: Into<ReasoningResponse>,
{
    /// Wrap `f` as a reasoner.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut, R> Reasoner for LambdaReasoner<F>
where
    F: Fn(ReasoningRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R>> + Send,
    R: Into<ReasoningResponse>,
{
    async fn invoke(&self, request: ReasoningRequest) -> Result<ReasoningResponse> {
        (self.f)(request).await.map(Into::into)
    }
}

/// Send `request` through `reasoner`, applying its timeout and recording the
/// call and any reported token usage in `ctx`.
///
/// Steering text is folded into the system instruction before dispatch. The
/// context deadline does not interrupt a call that has already started;
/// only `request.options.timeout` bounds it.
pub async fn invoke(
    reasoner: &dyn Reasoner,
    ctx: &ExecutionContext,
    mut request: ReasoningRequest,
) -> Result<String> {
    request.system = request.system_prompt();
    request.options.steering = None;
    let limit = request.options.timeout;
    let tier = request.options.tier;
    ctx.record_reasoning_call();
    tracing::debug!(?tier, timeout = ?limit, "invoking reasoner");

    let call = reasoner.invoke(request);
    let result = match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| Error::Timeout(format!("reasoning call exceeded {}ms", limit.as_millis())))?,
        None => call.await,
    };

    let response = result.map_err(|err| match err {
        Error::Reasoning(_) | Error::Timeout(_) => err,
        other => Error::Reasoning(other.to_string()),
    })?;
    if let Some(usage) = response.usage {
        ctx.record_tokens(usage.prompt, usage.completion);
    }
    Ok(response.text)
}

/// Decode a JSON value out of a free-text response.
///
/// Accepts bare JSON, JSON wrapped in markdown code fences, or JSON embedded
/// in surrounding prose. Plain text decodes into `String` targets as-is.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = strip_fences(text.trim());

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    if let Some(body) = embedded_json(trimmed) {
        return serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()));
    }
    serde_json::from_value(serde_json::Value::String(trimmed.to_string())).map_err(|_| {
        Error::Parse(format!("no JSON found in response: {}", preview(trimmed)))
    })
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn embedded_json(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c == '{' || c == '[')?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let head: String = text.chars().take(MAX).collect();
        format!("{head}...")
    }
}

/// Render a serializable value as a prompt payload. Strings pass through
/// verbatim; everything else becomes pretty-printed JSON.
pub(crate) fn render_payload<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(serde_json::to_string_pretty(&other)?),
    }
}

/// A typed structured operation backed by the reasoning service.
///
/// Sends the JSON-rendered input together with an instruction and decodes the
/// response as `O`. This is the per-item unit of the
/// [`BatchProcessor`](crate::BatchProcessor); its instruction is reused for
/// merged chunk prompts.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use llm_orchestrate::{ExecutionContext, LambdaReasoner, ReasoningRequest, ReasoningStep, Step};
///
/// # tokio_test::block_on(async {
/// let reasoner = Arc::new(LambdaReasoner::new(|_req: ReasoningRequest| async move {
///     Ok::<String, llm_orchestrate::Error>("```json\n{\"n\": 4}\n```".to_string())
/// }));
/// let step = ReasoningStep::<String, serde_json::Value>::new(reasoner, "Count the words.");
///
/// let ctx = ExecutionContext::new();
/// let out = step.run(&ctx, "one two three four".to_string()).await.unwrap();
/// assert_eq!(out["n"], 4);
/// assert_eq!(ctx.snapshot().reasoning_calls, 1);
/// # });
/// ```
pub struct ReasoningStep<I, O> {
    reasoner: Arc<dyn Reasoner>,
    instruction: String,
    options: ReasoningOptions,
    name: String,
    _phantom: PhantomData<fn(I) -> O>,
}

impl<I, O> ReasoningStep<I, O> {
    /// Create an operation that applies `instruction` to each input.
    pub fn new(reasoner: Arc<dyn Reasoner>, instruction: impl Into<String>) -> Self {
        Self {
            reasoner,
            instruction: instruction.into(),
            options: ReasoningOptions::default(),
            name: "reasoning_step".to_string(),
            _phantom: PhantomData,
        }
    }

    /// Set call options.
    #[must_use]
    pub fn with_options(mut self, options: ReasoningOptions) -> Self {
        self.options = options;
        self
    }

    /// Set a human-readable name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The instruction applied to every input.
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// The call options.
    pub fn options(&self) -> &ReasoningOptions {
        &self.options
    }

    /// The underlying reasoner.
    pub fn reasoner(&self) -> &dyn Reasoner {
        self.reasoner.as_ref()
    }
}

#[async_trait]
impl<I, O> Step for ReasoningStep<I, O>
where
    I: Serialize + Send + 'static,
    O: DeserializeOwned + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, ctx: &ExecutionContext, input: I) -> Result<O> {
        let system = format!(
            "{}\n\nRespond with JSON only, no commentary.",
            self.instruction
        );
        let request =
            ReasoningRequest::new(system, render_payload(&input)?).with_options(self.options.clone());
        let response = invoke(self.reasoner.as_ref(), ctx, request).await?;
        parse_json(&response)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn parses_fenced_and_embedded_json() {
        let fenced: Value = parse_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(fenced, json!({"a": 1}));

        let embedded: Vec<u32> = parse_json("Sure! Here you go: [1, 2, 3]. Anything else?").unwrap();
        assert_eq!(embedded, vec![1, 2, 3]);

        let text: String = parse_json("plain answer").unwrap();
        assert_eq!(text, "plain answer");
    }

    #[test]
    fn unparseable_response_is_a_parse_error() {
        let err = parse_json::<Vec<u32>>("I cannot help with that").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn steering_is_appended_to_system_prompt() {
        let req = ReasoningRequest::new("Classify.", "x")
            .with_options(ReasoningOptions::new().with_steering("be terse"));
        assert_eq!(req.system_prompt(), "Classify.\n\nAdditional guidance: be terse");
        assert_eq!(ReasoningRequest::new("Classify.", "x").system_prompt(), "Classify.");
    }

    #[tokio::test]
    async fn slow_reasoner_times_out() {
        let slow = LambdaReasoner::new(|_req: ReasoningRequest| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<String, Error>("late".to_string())
        });
        let ctx = ExecutionContext::new();
        let request = ReasoningRequest::new("s", "u")
            .with_options(ReasoningOptions::new().with_timeout(Duration::from_millis(10)));

        let err = invoke(&slow, &ctx, request).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(ctx.snapshot().reasoning_calls, 1);
    }

    #[tokio::test]
    async fn steering_reaches_the_reasoner() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reasoner = Arc::new(LambdaReasoner::new(move |req: ReasoningRequest| {
            sink.lock().unwrap().push((req.system.clone(), req.system_prompt()));
            async move { Ok::<_, Error>("\"bonjour\"") }
        }));
        let step = ReasoningStep::<String, String>::new(reasoner, "Summarize.")
            .with_options(ReasoningOptions::new().with_steering("answer in French"));

        let out = step.run(&ExecutionContext::new(), "hello".to_string()).await.unwrap();
        assert_eq!(out, "bonjour");

        let seen = seen.lock().unwrap();
        let (system, composed) = &seen[0];
        assert!(system.starts_with("Summarize."));
        assert!(system.ends_with("Additional guidance: answer in French"), "{system}");
        assert_eq!(system, composed);
    }

    #[tokio::test]
    async fn reported_usage_is_recorded() {
        let counted = LambdaReasoner::new(|_req: ReasoningRequest| async move {
            Ok::<_, Error>(ReasoningResponse::new("{}").with_usage(120, 30))
        });
        let ctx = ExecutionContext::new();
        invoke(&counted, &ctx, ReasoningRequest::new("s", "u")).await.unwrap();
        invoke(&counted, &ctx, ReasoningRequest::new("s", "u")).await.unwrap();

        let metrics = ctx.snapshot();
        assert_eq!(metrics.prompt_token_count, 240);
        assert_eq!(metrics.completion_token_count, 60);
        assert_eq!(metrics.total_tokens(), 300);
        assert_eq!(metrics.reasoning_calls, 2);
    }

    #[tokio::test]
    async fn foreign_errors_become_reasoning_errors() {
        let failing = LambdaReasoner::new(|_req: ReasoningRequest| async move {
            Err::<String, Error>(Error::Message("503".into()))
        });
        let err = invoke(&failing, &ExecutionContext::new(), ReasoningRequest::new("s", "u"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reasoning(_)));
    }
}
