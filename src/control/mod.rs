//! Control-flow combinators.
//!
//! Low-level building blocks usable anywhere, inside or outside a pipeline:
//! exponential-backoff retry, bounded loops, panic capture and pattern
//! matching over inputs. All of them are sequential; ordering guarantees of
//! the components that use them depend on that.

pub mod fault;
pub mod looping;
pub mod matcher;
pub mod retry;

pub use fault::{catch_faults, FaultBarrier};
pub use looping::loop_while;
pub use matcher::{MatchKind, MatchStep, Tagged};
pub use retry::{with_retry, RetryStep, RetryStrategy};
