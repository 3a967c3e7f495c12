//! Pipeline construction, submission and observability

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::{PipelineEvent, PipelineState, ShutdownScope, Stage, StageConfig, StageState};
use crate::context::Context;
use crate::error::{PipelineError, TaskError};
use crate::queue::{BoundedQueue, PushError, Pushed};
use crate::retry::RetryPolicy;
use crate::sink::{ErrorSink, LogSink, ResultSink, TaskFailure};
use crate::task::Task;
use crate::worker::{Outlet, StageMetrics, StageSnapshot, WorkerShared};

/// Default capacity of the lifecycle event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An ordered chain of stages
///
/// Stage `i`'s handler output is pushed into stage `i + 1`'s queue using
/// that stage's overflow policy; the last stage's output goes to the
/// result sink. Failures from every stage go to the error sink.
///
/// `Pipeline` is not `Clone`; share it behind an `Arc` to submit from
/// several producers. Dropping a pipeline that was not shut down closes
/// every queue and abandons whatever is left.
///
/// # Example
///
/// ```ignore
/// let pipeline = Pipeline::builder()
///     .add_stage(StageConfig::new("parse", parse).with_policy(OverflowPolicy::RejectImmediately))
///     .add_stage(StageConfig::new("store", store).with_workers(2))
///     .error_sink(failures_tx)
///     .build()?;
///
/// pipeline.submit(&Context::background(), Task::new(raw)).await?;
/// pipeline.shutdown_timeout(Duration::from_secs(5)).await?;
/// ```
pub struct Pipeline<P: Send + 'static> {
    pub(super) inner: Arc<PipelineInner<P>>,
}

/// State shared between the pipeline handle and its shutdown cascade
pub(crate) struct PipelineInner<P: Send + 'static> {
    pub(super) stages: Vec<Stage<P>>,
    pub(super) scope: Arc<ShutdownScope>,
    pub(super) errors: Arc<dyn ErrorSink<P>>,
    pub(super) state_tx: watch::Sender<PipelineState>,
    pub(super) events: broadcast::Sender<PipelineEvent>,
    pub(super) runtime: Handle,
}

impl<P: Send + 'static> PipelineInner<P> {
    pub(super) fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl<P: Send + 'static> Pipeline<P> {
    /// Build a pipeline from `stages` with logging sinks
    pub fn new(stages: Vec<StageConfig<P>>) -> Result<Self, PipelineError> {
        stages
            .into_iter()
            .fold(Self::builder(), PipelineBuilder::add_stage)
            .build()
    }

    pub fn builder() -> PipelineBuilder<P> {
        PipelineBuilder::new()
    }

    /// Submit a task to the entry stage
    ///
    /// Applies the entry stage's overflow policy. Under `Block`, `ctx`
    /// bounds the wait. A task evicted by `DropOldest` is reported to the
    /// error sink; the submission itself succeeds.
    pub async fn submit(&self, ctx: &Context, task: Task<P>) -> Result<(), PipelineError> {
        self.enqueue(ctx, task).await.map_err(|(err, _)| err)
    }

    /// Submit, retrying with backoff while the entry queue is full
    ///
    /// Only `QueueFull` is retried. The wait between attempts is bounded
    /// by `ctx`.
    pub async fn submit_with_retry(
        &self,
        ctx: &Context,
        task: Task<P>,
        policy: &RetryPolicy,
    ) -> Result<(), PipelineError> {
        let mut task = task;
        let mut attempt = 1;

        loop {
            match self.enqueue(ctx, task).await {
                Ok(()) => return Ok(()),
                Err((PipelineError::QueueFull, rejected))
                    if policy.has_attempts_remaining(attempt) =>
                {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Entry queue full, retrying submission"
                    );
                    ctx.run(tokio::time::sleep(delay)).await?;
                    task = rejected;
                }
                Err((err, _)) => return Err(err),
            }
        }
    }

    async fn enqueue(
        &self,
        ctx: &Context,
        mut task: Task<P>,
    ) -> Result<(), (PipelineError, Task<P>)> {
        if self.state() != PipelineState::Running {
            return Err((PipelineError::ShuttingDown, task));
        }
        let Some(entry) = self.inner.stages.first() else {
            return Err((PipelineError::ShuttingDown, task));
        };

        task.mark_enqueued();
        match entry.queue().push(task, entry.policy(), ctx).await {
            Ok(Pushed::Enqueued) => Ok(()),
            Ok(Pushed::Evicted(old)) => {
                let error = TaskError::Evicted {
                    stage: entry.name().to_string(),
                };
                entry.metrics().record_failure(&error);
                self.inner
                    .errors
                    .report(TaskFailure::returned(entry.name(), old, error))
                    .await;
                Ok(())
            }
            Err(err) => {
                let error = match &err {
                    PushError::Full(_) => {
                        entry.metrics().record_failure(&TaskError::QueueFull {
                            stage: entry.name().to_string(),
                        });
                        PipelineError::QueueFull
                    }
                    PushError::Closed(_) => PipelineError::ShuttingDown,
                    PushError::Cancelled(_) => PipelineError::Cancelled,
                    PushError::DeadlineExceeded(_) => PipelineError::DeadlineExceeded,
                };
                debug!(stage = %entry.name(), %error, "Submission rejected");
                Err((error, err.into_inner()))
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> PipelineState {
        *self.inner.state_tx.borrow()
    }

    /// State of the named stage
    pub fn stage_state(&self, name: &str) -> Option<StageState> {
        self.stage(name).map(Stage::state)
    }

    pub fn stage(&self, name: &str) -> Option<&Stage<P>> {
        self.inner.stages.iter().find(|s| s.name() == name)
    }

    /// Stages in pipeline order
    pub fn stages(&self) -> &[Stage<P>] {
        &self.inner.stages
    }

    /// Counters for every stage, in pipeline order
    pub fn stats(&self) -> Vec<StageSnapshot> {
        self.inner.stages.iter().map(Stage::snapshot).collect()
    }

    /// Receive lifecycle events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }
}

impl<P: Send + 'static> Drop for Pipeline<P> {
    fn drop(&mut self) {
        if self.state() == PipelineState::Stopped {
            return;
        }

        let queued: usize = self.inner.stages.iter().map(Stage::queue_depth).sum();
        if queued > 0 {
            warn!(queued, "Pipeline dropped without shutdown; queued tasks will be abandoned");
        }

        // Workers exit once their queues are closed and empty; the
        // cancelled scope makes them report what is left as abandoned.
        self.inner.scope.abandon();
        for stage in &self.inner.stages {
            stage.close();
        }
    }
}

impl<P: Send + 'static> fmt::Debug for Pipeline<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("stages", &self.inner.stages)
            .finish()
    }
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder<P: Send + 'static> {
    stages: Vec<StageConfig<P>>,
    errors: Option<Arc<dyn ErrorSink<P>>>,
    results: Option<Arc<dyn ResultSink<P>>>,
    event_capacity: usize,
}

impl<P: Send + 'static> Default for PipelineBuilder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Send + 'static> PipelineBuilder<P> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            errors: None,
            results: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Append a stage after the ones already added
    pub fn add_stage(mut self, stage: StageConfig<P>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Where failed tasks are reported (default: [`LogSink`])
    pub fn error_sink(mut self, sink: impl ErrorSink<P> + 'static) -> Self {
        self.errors = Some(Arc::new(sink));
        self
    }

    /// Where the terminal stage's output goes (default: [`LogSink`])
    pub fn result_sink(mut self, sink: impl ResultSink<P> + 'static) -> Self {
        self.results = Some(Arc::new(sink));
        self
    }

    /// Buffer size of the [`PipelineEvent`] channel
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Validate the stages and spawn every worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Pipeline<P>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "pipeline needs at least one stage".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for stage in &self.stages {
            stage.validate()?;
            if !names.insert(stage.name.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
        }

        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let errors: Arc<dyn ErrorSink<P>> = self.errors.unwrap_or_else(|| Arc::new(LogSink));
        let results: Arc<dyn ResultSink<P>> = self.results.unwrap_or_else(|| Arc::new(LogSink));
        let scope = Arc::new(ShutdownScope::new());

        // Queues and counters exist before any worker so each stage can
        // hold its successor's
        let queues: Vec<Arc<BoundedQueue<Task<P>>>> = self
            .stages
            .iter()
            .map(|s| Arc::new(BoundedQueue::new(s.queue_capacity)))
            .collect();
        let metrics: Vec<Arc<StageMetrics>> = self
            .stages
            .iter()
            .map(|_| Arc::new(StageMetrics::new()))
            .collect();
        let links: Vec<_> = self
            .stages
            .iter()
            .map(|s| (s.name.clone(), s.overflow_policy))
            .collect();

        let stages = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(index, config)| {
                let outlet = match links.get(index + 1) {
                    Some((name, policy)) => Outlet::Stage {
                        name: name.clone(),
                        queue: Arc::clone(&queues[index + 1]),
                        policy: *policy,
                        metrics: Arc::clone(&metrics[index + 1]),
                    },
                    None => Outlet::Sink(Arc::clone(&results)),
                };
                let shared = WorkerShared {
                    stage: config.name.clone(),
                    queue: Arc::clone(&queues[index]),
                    handler: config.handler(),
                    outlet,
                    max_fan_out: config.max_fan_out,
                    scope: Arc::clone(&scope),
                    metrics: Arc::clone(&metrics[index]),
                    errors: Arc::clone(&errors),
                };
                Stage::start(&runtime, config.overflow_policy, config.worker_count, shared)
            })
            .collect::<Vec<_>>();

        info!(
            stages = stages.len(),
            names = ?stages.iter().map(Stage::name).collect::<Vec<_>>(),
            "Pipeline started"
        );

        let (state_tx, _) = watch::channel(PipelineState::Running);
        let (events, _) = broadcast::channel(self.event_capacity);

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                stages,
                scope,
                errors,
                state_tx,
                events,
                runtime,
            }),
        })
    }
}
