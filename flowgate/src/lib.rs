//! Bounded-concurrency streaming transform stages.
//!
//! - [`ConcurrencyGate`]: admits at most N task units at once, FIFO.
//! - [`ParallelStage`]: runs a [`TaskUnit`] over a stream under a gate and
//!   forwards results in completion order or in upstream order.
//! - [`StageHandle`]: completion signal and metrics for a running stage.

pub mod gate;
mod logging;
pub mod stage;

pub use flowgate_shared::errors::{BoxError, FlowgateError, FlowgateResult};
pub use gate::{ConcurrencyGate, GatePermit};
pub use logging::{LoggingOptions, init_logging};
pub use stage::{
    Delivery, FnTask, ParallelStage, SpawnedStage, StageConfig, StageHandle, StageMetrics,
    StageOutcome, StageStream, TaskOutcome, TaskUnit,
};
