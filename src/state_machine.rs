//! A generic labelled-transition state machine.
//!
//! States and transitions are data: [`StateMachine::add_state`] registers
//! enter/exit hooks and [`StateMachine::add_transition`] registers one legal
//! edge keyed by `(from, event tag)`. There is no terminal-state concept; a
//! state without outgoing edges is simply a dead end.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::control::Tagged;
use crate::{Error, ExecutionContext, Result, WorkflowEvent};

type Hook<S, E> = Box<dyn Fn(&S, &E) + Send + Sync>;

/// Hooks attached to one state.
pub struct StateDefinition<S, E> {
    state: S,
    on_enter: Option<Hook<S, E>>,
    on_exit: Option<Hook<S, E>>,
}

impl<S, E> StateDefinition<S, E> {
    /// A state with no hooks.
    pub fn new(state: S) -> Self {
        Self {
            state,
            on_enter: None,
            on_exit: None,
        }
    }

    /// Called with the new state and the triggering event after entry.
    #[must_use]
    pub fn on_enter<F>(mut self, hook: F) -> Self
    where
        F: Fn(&S, &E) + Send + Sync + 'static,
    {
        self.on_enter = Some(Box::new(hook));
        self
    }

    /// Called with the old state and the triggering event before leaving.
    #[must_use]
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn(&S, &E) + Send + Sync + 'static,
    {
        self.on_exit = Some(Box::new(hook));
        self
    }

    /// The state this definition describes.
    pub fn state(&self) -> &S {
        &self.state
    }
}

/// A state machine over states `S` driven by events `E`.
///
/// # Example
///
/// ```rust
/// use llm_orchestrate::{StateDefinition, StateMachine};
///
/// #[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// enum Doc { Draft, Review, Published }
///
/// let mut machine: StateMachine<Doc, &str> = StateMachine::new(Doc::Draft);
/// machine
///     .add_state(StateDefinition::new(Doc::Review).on_enter(|_, _| println!("reviewing")))
///     .add_transition(Doc::Draft, "submit", Doc::Review)
///     .add_transition(Doc::Review, "approve", Doc::Published);
///
/// assert!(machine.transition("approve").is_err());
/// assert_eq!(machine.transition("submit").unwrap(), &Doc::Review);
/// assert_eq!(machine.history(), &[Doc::Draft, Doc::Review]);
/// ```
pub struct StateMachine<S, E> {
    current: S,
    states: HashMap<S, StateDefinition<S, E>>,
    transitions: HashMap<(S, String), S>,
    history: Vec<S>,
    ctx: Option<ExecutionContext>,
}

impl<S, E> StateMachine<S, E>
where
    S: Clone + Eq + Hash + Debug,
    E: Tagged,
{
    /// A machine in `initial`, which becomes the first history entry.
    pub fn new(initial: S) -> Self {
        Self {
            history: vec![initial.clone()],
            current: initial,
            states: HashMap::new(),
            transitions: HashMap::new(),
            ctx: None,
        }
    }

    /// Record every transition in `ctx`'s trace log.
    #[must_use]
    pub fn with_context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Register hooks for a state, replacing any earlier definition.
    pub fn add_state(&mut self, definition: StateDefinition<S, E>) -> &mut Self {
        self.states.insert(definition.state.clone(), definition);
        self
    }

    /// Register the edge `from --event_tag--> to`.
    pub fn add_transition(&mut self, from: S, event_tag: impl Into<String>, to: S) -> &mut Self {
        self.transitions.insert((from, event_tag.into()), to);
        self
    }

    /// The current state.
    pub fn current(&self) -> &S {
        &self.current
    }

    /// Every state entered so far, starting with the initial one.
    pub fn history(&self) -> &[S] {
        &self.history
    }

    /// Whether `event` is legal in the current state.
    pub fn can_transition(&self, event: &E) -> bool {
        self.transitions
            .contains_key(&(self.current.clone(), event.tag()))
    }

    /// Tags of the events legal in the current state, sorted.
    pub fn available_events(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .transitions
            .keys()
            .filter(|(from, _)| *from == self.current)
            .map(|(_, tag)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    /// Apply `event`.
    ///
    /// Fails with [`Error::NoTransition`] and leaves the machine untouched if
    /// no edge exists. Otherwise runs the current state's exit hook, moves,
    /// runs the new state's enter hook and appends to the history.
    pub fn transition(&mut self, event: E) -> Result<&S> {
        let tag = event.tag();
        let Some(next) = self
            .transitions
            .get(&(self.current.clone(), tag.clone()))
            .cloned()
        else {
            tracing::debug!(state = ?self.current, event = %tag, "rejected transition");
            return Err(Error::NoTransition {
                state: format!("{:?}", self.current),
                event: tag,
            });
        };

        if let Some(hook) = self.states.get(&self.current).and_then(|d| d.on_exit.as_ref()) {
            hook(&self.current, &event);
        }
        let previous = std::mem::replace(&mut self.current, next);
        if let Some(hook) = self.states.get(&self.current).and_then(|d| d.on_enter.as_ref()) {
            hook(&self.current, &event);
        }
        self.history.push(self.current.clone());

        tracing::debug!(from = ?previous, event = %tag, to = ?self.current, "state transition");
        if let Some(ctx) = &self.ctx {
            ctx.emit(WorkflowEvent::StateTransition {
                from: format!("{previous:?}"),
                event: tag,
                to: format!("{:?}", self.current),
            });
        }
        Ok(&self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        Idle,
        Running,
        Done,
    }

    enum Signal {
        Start,
        Finish,
        Abort { reason: String },
    }

    impl Tagged for Signal {
        fn tag(&self) -> String {
            match self {
                Signal::Start => "start",
                Signal::Finish => "finish",
                Signal::Abort { .. } => "abort",
            }
            .to_string()
        }
    }

    #[test]
    fn missing_transition_leaves_state_unchanged() {
        let mut machine: StateMachine<Phase, Signal> = StateMachine::new(Phase::Idle);
        machine.add_transition(Phase::Running, "finish", Phase::Done);

        let err = machine.transition(Signal::Finish).unwrap_err();
        assert!(matches!(err, Error::NoTransition { .. }));
        assert!(err.to_string().contains("No transition"));
        assert_eq!(machine.current(), &Phase::Idle);
        assert_eq!(machine.history(), &[Phase::Idle]);
    }

    #[test]
    fn hooks_fire_once_per_transition() {
        let exits = Arc::new(AtomicUsize::new(0));
        let enters = Arc::new(AtomicUsize::new(0));
        let (exit_count, enter_count) = (Arc::clone(&exits), Arc::clone(&enters));

        let mut machine = StateMachine::new(Phase::Idle);
        machine
            .add_state(StateDefinition::new(Phase::Idle).on_exit(move |state, _: &Signal| {
                assert_eq!(*state, Phase::Idle);
                exit_count.fetch_add(1, Ordering::SeqCst);
            }))
            .add_state(StateDefinition::new(Phase::Running).on_enter(move |state, _| {
                assert_eq!(*state, Phase::Running);
                enter_count.fetch_add(1, Ordering::SeqCst);
            }))
            .add_transition(Phase::Idle, "start", Phase::Running);

        assert_eq!(machine.transition(Signal::Start).unwrap(), &Phase::Running);
        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(enters.load(Ordering::SeqCst), 1);
        assert_eq!(machine.history(), &[Phase::Idle, Phase::Running]);
    }

    #[test]
    fn hooks_see_event_payload() {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&seen);

        let mut machine = StateMachine::new(Phase::Running);
        machine
            .add_state(StateDefinition::new(Phase::Idle).on_enter(move |_, event: &Signal| {
                if let Signal::Abort { reason } = event {
                    *sink.lock().unwrap() = reason.clone();
                }
            }))
            .add_transition(Phase::Running, "abort", Phase::Idle);

        machine
            .transition(Signal::Abort { reason: "budget".to_string() })
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), "budget");
    }

    #[test]
    fn dead_end_state_has_no_events() {
        let ctx = ExecutionContext::new();
        let mut machine: StateMachine<Phase, Signal> =
            StateMachine::new(Phase::Running).with_context(ctx.clone());
        machine
            .add_transition(Phase::Running, "finish", Phase::Done)
            .add_transition(Phase::Running, "abort", Phase::Idle);

        assert_eq!(machine.available_events(), vec!["abort", "finish"]);
        assert!(machine.can_transition(&Signal::Finish));
        machine.transition(Signal::Finish).unwrap();

        assert!(machine.available_events().is_empty());
        assert!(!machine.can_transition(&Signal::Start));
        assert_eq!(ctx.trace_snapshot().len(), 1);
    }
}
