//! Stage configuration and runtime state

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::debug;

use crate::context::Context;
use crate::error::PipelineError;
use crate::queue::{BoundedQueue, OverflowPolicy};
use crate::task::Task;
use crate::worker::{Handler, HandlerResult, StageMetrics, StageSnapshot, WorkerPool, WorkerShared};

/// Default workers per stage
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default queue capacity per stage
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Configuration for one pipeline stage
///
/// # Example
///
/// ```ignore
/// let stage = StageConfig::new("intake", |_ctx, task: Task<Payload>| async move {
///     Ok(vec![task])
/// })
/// .with_workers(8)
/// .with_capacity(256)
/// .with_policy(OverflowPolicy::RejectImmediately);
/// ```
pub struct StageConfig<P> {
    /// Stage name, unique within a pipeline
    pub name: String,

    /// Number of workers (fixed for the stage's lifetime)
    pub worker_count: usize,

    /// Maximum tasks resident in the stage queue
    pub queue_capacity: usize,

    /// What a push into this stage does when its queue is full
    pub overflow_policy: OverflowPolicy,

    /// Maximum tasks one handler invocation may emit (`None` = unbounded)
    pub max_fan_out: Option<usize>,

    handler: Handler<P>,
}

impl<P: Send + 'static> StageConfig<P> {
    /// Create a stage running `handler` for every task
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Task<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<P>> + Send + 'static,
    {
        Self::from_handler(name, Arc::new(move |ctx, task| Box::pin(handler(ctx, task))))
    }

    /// Create a stage from an already boxed handler
    pub fn from_handler(name: impl Into<String>, handler: Handler<P>) -> Self {
        Self {
            name: name.into(),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            max_fan_out: None,
            handler,
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = policy;
        self
    }

    /// Cap how many tasks a single handler call may emit downstream
    pub fn with_max_fan_out(mut self, limit: usize) -> Self {
        self.max_fan_out = Some(limit);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "stage name must not be empty".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "stage '{}': worker_count must be at least 1",
                self.name
            )));
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "stage '{}': queue_capacity must be at least 1",
                self.name
            )));
        }
        if self.max_fan_out == Some(0) {
            return Err(PipelineError::InvalidConfig(format!(
                "stage '{}': max_fan_out must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn handler(&self) -> Handler<P> {
        Arc::clone(&self.handler)
    }
}

impl<P> fmt::Debug for StageConfig<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageConfig")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("overflow_policy", &self.overflow_policy)
            .field("max_fan_out", &self.max_fan_out)
            .finish_non_exhaustive()
    }
}

/// Stage lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Accepting and processing tasks
    Running,
    /// Queue closed; workers finishing queued and in-flight tasks
    Draining,
    /// All workers exited
    Stopped,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A running stage: queue, workers and counters
pub struct Stage<P: Send + 'static> {
    name: String,
    queue: Arc<BoundedQueue<Task<P>>>,
    policy: OverflowPolicy,
    metrics: Arc<StageMetrics>,
    workers: WorkerPool,
    state: RwLock<StageState>,
}

impl<P: Send + 'static> Stage<P> {
    /// Spawn the stage's workers over `shared`
    pub(crate) fn start(
        runtime: &Handle,
        policy: OverflowPolicy,
        worker_count: usize,
        shared: WorkerShared<P>,
    ) -> Self {
        let name = shared.stage.clone();
        let queue = Arc::clone(&shared.queue);
        let metrics = Arc::clone(&shared.metrics);
        let workers = WorkerPool::spawn(runtime, worker_count, Arc::new(shared));

        debug!(stage = %name, worker_count, capacity = queue.capacity(), %policy, "Stage started");

        Self {
            name,
            queue,
            policy,
            metrics,
            workers,
            state: RwLock::new(StageState::Running),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StageState {
        *self.state.read()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn worker_count(&self) -> usize {
        self.workers.worker_count()
    }

    /// Tasks currently resident in the queue
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Workers currently inside the handler
    pub fn active_workers(&self) -> usize {
        self.metrics.active()
    }

    pub fn metrics(&self) -> &StageMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> StageSnapshot {
        self.metrics
            .snapshot(&self.name, self.queue.len(), self.queue.capacity())
    }

    pub(crate) fn queue(&self) -> &Arc<BoundedQueue<Task<P>>> {
        &self.queue
    }

    /// Close the queue and enter `Draining`
    ///
    /// Returns `false` when the queue was already closed.
    pub(crate) fn close(&self) -> bool {
        let closed = self.queue.close().is_ok();
        let mut state = self.state.write();
        if *state == StageState::Running {
            *state = StageState::Draining;
        }
        closed
    }

    /// Wait for all workers to exit, then enter `Stopped`
    pub(crate) async fn join(&self) {
        self.workers.join().await;
        *self.state.write() = StageState::Stopped;
    }
}

impl<P: Send + 'static> fmt::Debug for Stage<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough(name: &str) -> StageConfig<u32> {
        StageConfig::new(name, |_ctx, task: Task<u32>| async move { Ok(vec![task]) })
    }

    #[test]
    fn test_defaults() {
        let config = passthrough("intake");
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert!(config.max_fan_out.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = passthrough("expand")
            .with_workers(2)
            .with_capacity(8)
            .with_policy(OverflowPolicy::DropOldest)
            .with_max_fan_out(16);

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.max_fan_out, Some(16));
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        assert!(matches!(
            passthrough("a").with_workers(0).validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            passthrough("a").with_capacity(0).validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            passthrough("a").with_max_fan_out(0).validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(matches!(
            passthrough("  ").validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_stage_state_display() {
        assert_eq!(StageState::Running.to_string(), "running");
        assert_eq!(StageState::Draining.to_string(), "draining");
        assert_eq!(StageState::Stopped.to_string(), "stopped");
    }
}
