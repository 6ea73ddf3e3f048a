//! Error types for orchestration.
//!
//! Errors fall into the categories reported by [`Error::kind`]: failures of
//! the reasoning collaborator, undecodable responses, violations of the
//! orchestration rules themselves, deadline expiry and captured internal
//! faults. Per-item partial failures are not errors of their own; they live
//! inside [`BatchResult`](crate::BatchResult) and
//! [`PipelineResult`](crate::PipelineResult).

use thiserror::Error;

/// Broad category of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The reasoning service failed.
    Reasoning,
    /// A response could not be decoded into the expected shape.
    Parse,
    /// A structural rule of this crate was violated.
    Policy,
    /// A deadline expired.
    Timeout,
    /// An unexpected runtime fault was captured.
    Internal,
    /// Anything else (caller-supplied step failures, validation).
    Other,
}

/// The main error type for orchestration.
///
/// `Error` is `Clone` so that a single failure can be attributed to several
/// units of work, as when one merged batch call fails for a whole chunk.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The reasoning collaborator failed.
    #[error("Reasoning error: {0}")]
    Reasoning(String),

    /// A reasoning response could not be decoded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// `decide` was called with an empty candidate list.
    #[error("No decisions provided")]
    NoDecisions,

    /// A workflow step names a dependency that was never registered.
    #[error("Step '{step}' depends on unregistered step '{dependency}'")]
    MissingDependency {
        /// The step declaring the dependency.
        step: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Two workflow steps share a name.
    #[error("Duplicate step '{0}'")]
    DuplicateStep(String),

    /// Workflow dependencies form a cycle.
    #[error("Dependency cycle among steps: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// The state machine has no edge for this state and event.
    #[error("No transition from state '{state}' on event '{event}'")]
    NoTransition {
        /// Debug rendering of the current state.
        state: String,
        /// Tag of the rejected event.
        event: String,
    },

    /// No arm of a match step accepted the input.
    #[error("No matching arm for input")]
    NoMatch,

    /// A bounded loop hit its iteration limit while its predicate still held.
    #[error("Max iterations ({0}) exceeded")]
    MaxIterations(usize),

    /// An operation kept failing until its attempt budget ran out.
    #[error("Failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last error observed.
        #[source]
        source: Box<Error>,
    },

    /// A loop body failed.
    #[error("Iteration {iteration} failed: {source}")]
    Iteration {
        /// 1-based iteration number.
        iteration: usize,
        /// The body's error.
        #[source]
        source: Box<Error>,
    },

    /// A named pipeline or workflow step failed.
    #[error("Step '{step}' failed: {source}")]
    Step {
        /// The step name.
        step: String,
        /// The step's final error.
        #[source]
        source: Box<Error>,
    },

    /// A deadline expired before or during the unit of work.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A panic or other unexpected fault captured at a boundary.
    #[error("Internal fault: {0}")]
    Internal(String),

    /// A JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(String),

    /// A generic error with a message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Category of this error. Wrapping variants report their source's kind,
    /// except exhausted retries which are a policy outcome in their own right.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Reasoning(_) => ErrorKind::Reasoning,
            Error::Parse(_) | Error::Json(_) => ErrorKind::Parse,
            Error::NoDecisions
            | Error::MissingDependency { .. }
            | Error::DuplicateStep(_)
            | Error::DependencyCycle(_)
            | Error::NoTransition { .. }
            | Error::NoMatch
            | Error::MaxIterations(_)
            | Error::RetriesExhausted { .. } => ErrorKind::Policy,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Iteration { source, .. } | Error::Step { source, .. } => source.kind(),
            Error::Message(_) => ErrorKind::Other,
        }
    }

    /// Wrap this error with the name of the step that produced it.
    #[must_use]
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Error::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Returns `true` if this error (or the error it wraps) is a timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Message(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Message(msg.to_string())
    }
}

/// A specialized `Result` type for orchestration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_report_source_kind() {
        let err = Error::Timeout("late".into()).in_step("fetch");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Step 'fetch' failed: Timeout: late");
    }

    #[test]
    fn exhausted_retries_are_policy_errors() {
        let err = Error::RetriesExhausted {
            attempts: 3,
            source: Box::new(Error::Reasoning("rate limited".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Policy);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn json_errors_are_parse_errors() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = json_err.into();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
