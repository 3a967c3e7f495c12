//! Multi-stage pipelines
//!
//! This module provides:
//! - [`StageConfig`] - Per-stage handler, worker count, capacity and policy
//! - [`Pipeline`] - Ordered chain of stages with submission and shutdown
//! - [`PipelineEvent`] - Lifecycle events for observers
//!
//! # Lifecycle
//!
//! ```text
//! Running ──shutdown()──▶ ShuttingDown ──last stage stopped──▶ Drained ──▶ Stopped
//! ```
//!
//! Stages go `Running -> Draining -> Stopped` one after another, entry first.

mod events;
mod orchestrator;
mod shutdown;
mod stage;

pub use events::PipelineEvent;
pub use orchestrator::{Pipeline, PipelineBuilder, DEFAULT_EVENT_CAPACITY};
pub use shutdown::{PipelineState, ABANDON_REPORT_GRACE};
pub use stage::{Stage, StageConfig, StageState, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKER_COUNT};

pub(crate) use shutdown::ShutdownScope;
