//! # Sluice
//!
//! A bounded, in-process task-processing engine for absorbing bursty
//! inbound work without letting concurrency run away.
//!
//! ## Features
//!
//! - **Bounded queues**: Fixed capacity per stage with block, reject or drop-oldest overflow
//! - **Fixed worker pools**: Exactly N workers per stage, panics recovered per task
//! - **Multi-stage pipelines**: Handlers emit zero or more tasks into the next stage
//! - **Cooperative cancellation**: Per-task deadlines intersected with the shutdown deadline
//! - **Graceful shutdown**: Stage-by-stage drain; leftovers reported, never dropped
//! - **Object pooling**: Reuse scratch buffers in hot handlers
//!
//! ## Architecture
//!
//! ```text
//!  producers ──submit()──▶ ┌─────────────────────────┐
//!                          │ Stage 0 queue (bounded) │
//!                          └────────────┬────────────┘
//!                                       ▼
//!                          ┌─────────────────────────┐     failures
//!                          │ Stage 0 workers (N₀)    │ ─────────────┐
//!                          └────────────┬────────────┘              │
//!                            emitted    ▼  (stage 1 policy)         │
//!                          ┌─────────────────────────┐              │
//!                          │ Stage 1 queue (bounded) │              │
//!                          └────────────┬────────────┘              ▼
//!                                       ▼                     ┌───────────┐
//!                          ┌─────────────────────────┐        │ ErrorSink │
//!                          │ Stage 1 workers (N₁)    │ ─────▶ └───────────┘
//!                          └────────────┬────────────┘
//!                                       ▼
//!                                ┌────────────┐
//!                                │ ResultSink │
//!                                └────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sluice::prelude::*;
//!
//! let pipeline = Pipeline::builder()
//!     .add_stage(
//!         StageConfig::new("validate", |ctx, task: Task<Record>| async move {
//!             ctx.run(check(task.payload())).await??;
//!             Ok(vec![task])
//!         })
//!         .with_policy(OverflowPolicy::RejectImmediately),
//!     )
//!     .add_stage(StageConfig::new("store", store_record).with_workers(2))
//!     .build()?;
//!
//! match pipeline.submit(&Context::background(), Task::new(record)).await {
//!     Err(PipelineError::QueueFull) => shed_load(),
//!     other => other?,
//! }
//!
//! pipeline.shutdown_timeout(Duration::from_secs(10)).await?;
//! ```

pub mod context;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::context::{CancelHandle, Context, ContextError};
    pub use crate::error::{HandlerError, PipelineError, TaskError};
    pub use crate::pipeline::{
        Pipeline, PipelineBuilder, PipelineEvent, PipelineState, StageConfig, StageState,
    };
    pub use crate::pool::Pool;
    pub use crate::queue::OverflowPolicy;
    pub use crate::retry::RetryPolicy;
    pub use crate::sink::{ErrorSink, ResultSink, TaskFailure};
    pub use crate::task::{Task, TaskId};
    pub use crate::worker::HandlerResult;
}

// Re-export key types at crate root
pub use context::{CancelHandle, Context, ContextError};
pub use error::{HandlerError, PipelineError, TaskError};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineEvent, PipelineState, Stage, StageConfig, StageState,
    ABANDON_REPORT_GRACE,
};
pub use pool::{Pool, PoolStats};
pub use queue::{BoundedQueue, OverflowPolicy};
pub use retry::RetryPolicy;
pub use sink::{DiscardSink, ErrorSink, LogSink, ResultSink, TaskFailure};
pub use task::{Task, TaskId};
pub use worker::{Handler, HandlerResult, StageMetrics, StageSnapshot, WorkerPool};
