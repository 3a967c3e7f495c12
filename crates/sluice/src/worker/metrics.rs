//! Per-stage counters
//!
//! All counters are atomics updated by workers without locks. They are for
//! observability only; no control decision reads them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Live counters for one stage
#[derive(Debug, Default)]
pub struct StageMetrics {
    active: AtomicUsize,
    processed: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
    abandoned: AtomicU64,
    rejected: AtomicU64,
    evicted: AtomicU64,
    wait_count: AtomicU64,
    wait_sum_micros: AtomicU64,
    wait_max_micros: AtomicU64,
}

impl StageMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a worker started running a handler
    pub fn task_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that a handler returned (successfully or not)
    pub fn task_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a handler that completed without error
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a task failure in the counter matching its error
    pub fn record_failure(&self, error: &TaskError) {
        let counter = match error {
            TaskError::Handler(_) | TaskError::Panicked(_) | TaskError::FanOutExceeded { .. } => {
                &self.failed
            }
            TaskError::DeadlineExceeded => &self.expired,
            TaskError::Cancelled => &self.cancelled,
            TaskError::AbandonedOnShutdown => &self.abandoned,
            TaskError::QueueFull { .. } | TaskError::DownstreamClosed { .. } => &self.rejected,
            TaskError::Evicted { .. } => &self.evicted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a task sat in the queue before a worker took it
    pub fn record_queue_wait(&self, wait: Duration) {
        let micros = wait.as_micros().min(u64::MAX as u128) as u64;
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        self.wait_sum_micros.fetch_add(micros, Ordering::Relaxed);

        // Update max (compare-and-swap loop)
        let mut current = self.wait_max_micros.load(Ordering::Relaxed);
        while micros > current {
            match self.wait_max_micros.compare_exchange_weak(
                current,
                micros,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Workers currently inside a handler
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Tasks processed successfully
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Tasks abandoned on shutdown
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Mean queue wait across all recorded tasks
    pub fn mean_queue_wait(&self) -> Duration {
        let count = self.wait_count.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.wait_sum_micros.load(Ordering::Relaxed) / count)
    }

    /// Longest queue wait recorded
    pub fn max_queue_wait(&self) -> Duration {
        Duration::from_micros(self.wait_max_micros.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, stage: &str, queue_depth: usize, queue_capacity: usize) -> StageSnapshot {
        StageSnapshot {
            stage: stage.to_string(),
            queue_depth,
            queue_capacity,
            active_workers: self.active(),
            processed: self.processed(),
            failed: self.failed.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            abandoned: self.abandoned(),
            rejected: self.rejected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            mean_queue_wait_micros: self.mean_queue_wait().as_micros() as u64,
            max_queue_wait_micros: self.max_queue_wait().as_micros() as u64,
        }
    }
}

/// Serializable view of a stage's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: String,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_workers: usize,
    pub processed: u64,
    pub failed: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub abandoned: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub mean_queue_wait_micros: u64,
    pub max_queue_wait_micros: u64,
}
