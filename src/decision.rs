//! Guarded decisions backed by the reasoning service.
//!
//! [`DecisionEngine::decide`] tries each candidate's deterministic condition
//! first and only asks the reasoning service when none holds.
//! [`DecisionEngine::guard`] evaluates boolean preconditions and, when some
//! fail, asks for remediation suggestions.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::reasoning::{self, parse_json, render_payload, Reasoner, ReasoningOptions, ReasoningRequest};
use crate::{Error, ExecutionContext, Result, WorkflowEvent};

const DECIDE_INSTRUCTION: &str = "You are a decision engine. Choose the single best option for the given context.\n\
Respond with JSON only: {\"selected_index\": <option number>, \"explanation\": <why>, \
\"confidence\": <0.0-1.0>, \"alternatives\": [<other acceptable option numbers>]}";

const REMEDIATION_INSTRUCTION: &str = "A value failed validation checks. Suggest concrete changes that would make every check pass.\n\
Respond with JSON only: {\"suggestions\": [<one suggestion per string>]}";

const DEFAULT_CONFIDENCE: f64 = 0.5;

type Condition<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;

/// One candidate outcome of a decision.
pub struct Decision<C, T> {
    /// The value returned when this candidate is selected.
    pub value: T,
    /// Shown to the reasoning service.
    pub description: String,
    /// Ordering hint presented to the reasoning service. Not enforced.
    pub priority: i32,
    condition: Option<Condition<C>>,
}

impl<C, T> Decision<C, T> {
    /// A candidate without a deterministic condition.
    pub fn new(value: T, description: impl Into<String>) -> Self {
        Self {
            value,
            description: description.into(),
            priority: 0,
            condition: None,
        }
    }

    /// Select this candidate without consulting the reasoning service
    /// whenever `condition` holds.
    #[must_use]
    pub fn when<F>(mut self, condition: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Box::new(condition));
        self
    }

    /// Set the priority hint.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether a deterministic condition is attached.
    pub fn has_condition(&self) -> bool {
        self.condition.is_some()
    }

    fn matches(&self, context: &C) -> bool {
        self.condition.as_ref().is_some_and(|condition| condition(context))
    }
}

/// The selected candidate and how it was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome<T> {
    /// Value of the selected candidate.
    pub value: T,
    /// Position of the selected candidate.
    pub selected_index: usize,
    /// Why it was selected.
    pub explanation: String,
    /// 1.0 for deterministic selections.
    pub confidence: f64,
    /// Other acceptable candidates suggested by the reasoning service.
    pub alternatives: Vec<usize>,
    /// Whether a condition (rather than the reasoning service) selected it.
    pub deterministic: bool,
}

#[derive(Debug, Deserialize)]
struct DecisionResponse {
    #[serde(alias = "index")]
    selected_index: usize,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    alternatives: Vec<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SuggestionResponse {
    Wrapped { suggestions: Vec<String> },
    List(Vec<String>),
}

/// A boolean precondition returning `(passed, message)`.
pub type Check<V> = Box<dyn Fn(&V) -> (bool, String) + Send + Sync>;

/// Box a closure as a [`Check`].
pub fn check<V, F>(f: F) -> Check<V>
where
    F: Fn(&V) -> (bool, String) + Send + Sync + 'static,
{
    Box::new(f)
}

/// Outcome of a guard evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResult {
    /// `true` iff every check passed.
    pub can_proceed: bool,
    /// Messages of the failed checks, in check order.
    pub failed_checks: Vec<String>,
    /// Remediation suggestions. Possibly empty.
    pub suggestions: Vec<String>,
}

impl GuardResult {
    /// Evaluate `checks` against `value` without asking for suggestions.
    pub fn evaluate<V>(value: &V, checks: &[Check<V>]) -> Self {
        let failed_checks: Vec<String> = checks
            .iter()
            .filter_map(|check| {
                let (passed, message) = check(value);
                (!passed).then_some(message)
            })
            .collect();
        Self {
            can_proceed: failed_checks.is_empty(),
            failed_checks,
            suggestions: Vec::new(),
        }
    }
}

/// Makes decisions and evaluates guards, falling back to the reasoning service.
pub struct DecisionEngine {
    reasoner: Arc<dyn Reasoner>,
    options: ReasoningOptions,
    suggest_remediation: bool,
}

impl DecisionEngine {
    /// An engine backed by `reasoner`. Guard remediation is enabled.
    pub fn new(reasoner: Arc<dyn Reasoner>) -> Self {
        Self {
            reasoner,
            options: ReasoningOptions::default(),
            suggest_remediation: true,
        }
    }

    /// Options for every reasoning call this engine makes.
    #[must_use]
    pub fn with_options(mut self, options: ReasoningOptions) -> Self {
        self.options = options;
        self
    }

    /// Enable or disable remediation suggestions for failed guards.
    #[must_use]
    pub fn with_remediation(mut self, enabled: bool) -> Self {
        self.suggest_remediation = enabled;
        self
    }

    /// Select one of `decisions` for `context`.
    ///
    /// The first candidate whose condition holds wins with confidence 1.0 and
    /// no reasoning call. Otherwise the reasoning service picks by index; an
    /// out-of-range or missing index is an [`Error::Parse`].
    pub async fn decide<C, T>(
        &self,
        ctx: &ExecutionContext,
        context: &C,
        decisions: &[Decision<C, T>],
    ) -> Result<DecisionOutcome<T>>
    where
        C: Serialize,
        T: Clone,
    {
        if decisions.is_empty() {
            return Err(Error::NoDecisions);
        }

        if let Some(index) = decisions.iter().position(|d| d.matches(context)) {
            tracing::debug!(selected_index = index, "decision selected by condition");
            ctx.emit(WorkflowEvent::DecisionMade {
                selected_index: index,
                deterministic: true,
            });
            return Ok(DecisionOutcome {
                value: decisions[index].value.clone(),
                selected_index: index,
                explanation: format!("condition matched: {}", decisions[index].description),
                confidence: 1.0,
                alternatives: Vec::new(),
                deterministic: true,
            });
        }

        let mut user = format!("Context:\n{}\n\nOptions:\n", render_payload(context)?);
        for (index, decision) in decisions.iter().enumerate() {
            let _ = writeln!(
                user,
                "[{index}] {} (priority {})",
                decision.description, decision.priority
            );
        }

        let request = ReasoningRequest::new(DECIDE_INSTRUCTION, user).with_options(self.options.clone());
        let response = reasoning::invoke(self.reasoner.as_ref(), ctx, request).await?;
        let parsed: DecisionResponse = parse_json(&response)?;

        let index = parsed.selected_index;
        let Some(selected) = decisions.get(index) else {
            return Err(Error::Parse(format!(
                "selected index {index} out of range for {} decisions",
                decisions.len()
            )));
        };

        tracing::debug!(selected_index = index, "decision selected by reasoning");
        ctx.emit(WorkflowEvent::DecisionMade {
            selected_index: index,
            deterministic: false,
        });
        Ok(DecisionOutcome {
            value: selected.value.clone(),
            selected_index: index,
            explanation: parsed.explanation,
            confidence: parsed.confidence.unwrap_or(DEFAULT_CONFIDENCE).clamp(0.0, 1.0),
            alternatives: parsed
                .alternatives
                .into_iter()
                .filter(|&alt| alt < decisions.len() && alt != index)
                .collect(),
            deterministic: false,
        })
    }

    /// Evaluate `checks` against `value` with no reasoning call.
    pub fn evaluate_checks<V>(&self, value: &V, checks: &[Check<V>]) -> GuardResult {
        GuardResult::evaluate(value, checks)
    }

    /// Evaluate `checks` against `value`, asking for remediation when any fail.
    ///
    /// Suggestions are advisory: if the suggestion call fails the result is
    /// returned with no suggestions.
    pub async fn guard<V>(
        &self,
        ctx: &ExecutionContext,
        value: &V,
        checks: &[Check<V>],
    ) -> Result<GuardResult>
    where
        V: Serialize,
    {
        let mut result = GuardResult::evaluate(value, checks);
        if result.can_proceed || !self.suggest_remediation {
            return Ok(result);
        }

        let mut user = format!("Value:\n{}\n\nFailed checks:\n", render_payload(value)?);
        for message in &result.failed_checks {
            let _ = writeln!(user, "- {message}");
        }
        let request =
            ReasoningRequest::new(REMEDIATION_INSTRUCTION, user).with_options(self.options.clone());

        let suggestions = match reasoning::invoke(self.reasoner.as_ref(), ctx, request).await {
            Ok(response) => parse_json::<SuggestionResponse>(&response),
            Err(err) => Err(err),
        };
        match suggestions {
            Ok(SuggestionResponse::Wrapped { suggestions } | SuggestionResponse::List(suggestions)) => {
                result.suggestions = suggestions;
            }
            Err(err) => {
                tracing::warn!(error = %err, "remediation suggestions unavailable");
            }
        }
        Ok(result)
    }
}
