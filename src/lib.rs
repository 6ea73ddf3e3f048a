//! # llm-orchestrate
//!
//! Reliable program structure around calls to an external reasoning service.
//!
//! Callers supply one primitive, a [`Reasoner`] that turns a system
//! instruction and a user payload into text. This crate builds everything
//! needed to run many such calls safely, in order, with failure recovery.
//!
//! ## Core Concepts
//!
//! - **Step**: the typed async unit every stage is built from
//! - **ReasoningStep**: a step that asks the reasoner and decodes JSON
//! - **BatchProcessor**: runs many inputs in parallel or merged into chunks
//! - **Pipeline**: ordered steps over an evolving value, with retries
//! - **Workflow**: dependency-ordered steps over shared state, with rollback
//! - **StateMachine**: labelled transitions with enter/exit hooks
//! - **DecisionEngine**: deterministic-first decisions and guards
//! - **with_retry / loop_while / catch_faults / MatchStep**: control flow
//! - **ExecutionContext**: metrics, trace log and the shared deadline
//!
//! ## Example: Pipeline with Retries
//!
//! ```rust
//! use std::time::Duration;
//! use llm_orchestrate::{ExecutionContext, LambdaStep, Pipeline};
//!
//! # tokio_test::block_on(async {
//! let pipeline = Pipeline::new("score")
//!     .with_retries(2)
//!     .with_retry_delay(Duration::from_millis(1))
//!     .add_step("double", LambdaStep::new(|x: i32| async move { Ok::<i32, llm_orchestrate::Error>(x * 2) }))
//!     .add_step("add", LambdaStep::new(|x: i32| async move { Ok::<i32, llm_orchestrate::Error>(x + 10) }));
//!
//! let ctx = ExecutionContext::new();
//! let result = pipeline.execute(&ctx, 5).await;
//!
//! assert_eq!(result.output, 20);
//! assert_eq!(ctx.snapshot().steps_completed, 2);
//! # });
//! ```

pub mod batch;
pub mod context;
pub mod control;
pub mod decision;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod reasoning;
pub mod state_machine;
pub mod step;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
pub use context::ExecutionContext;
pub use metrics::WorkflowMetrics;
pub use events::{TraceEntry, WorkflowEvent};

pub use reasoning::{
    parse_json, IntelligenceTier, LambdaReasoner, Reasoner, ReasoningOptions, ReasoningRequest,
    ReasoningResponse, ReasoningStep, TokenUsage,
};
pub use step::{BoxedStepExt, LambdaStep, Step};
pub use control::{
    catch_faults, loop_while, with_retry, FaultBarrier, MatchKind, MatchStep, RetryStep,
    RetryStrategy, Tagged,
};

pub use batch::{chunk_ranges, BatchConfig, BatchMetadata, BatchMode, BatchProcessor, BatchResult};
pub use pipeline::{Pipeline, PipelineConfig, PipelineResult, PipelineStep};
pub use workflow::{Workflow, WorkflowConfig, WorkflowState, WorkflowStep};
pub use state_machine::{StateDefinition, StateMachine};
pub use decision::{check, Check, Decision, DecisionEngine, DecisionOutcome, GuardResult};
