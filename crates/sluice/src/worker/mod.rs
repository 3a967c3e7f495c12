//! Worker pools
//!
//! This module provides:
//! - [`WorkerPool`] - Fixed set of workers draining one stage queue
//! - [`StageMetrics`] - Lock-free per-stage counters
//! - [`StageSnapshot`] - Serializable view of those counters

mod metrics;
mod pool;

pub use metrics::{StageMetrics, StageSnapshot};
pub use pool::{Handler, HandlerResult, WorkerPool};

pub(crate) use pool::{Outlet, WorkerShared};
