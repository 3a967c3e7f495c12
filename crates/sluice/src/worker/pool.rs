//! Fixed-size worker pool for one stage
//!
//! Each worker pulls tasks from the stage queue, runs the handler with
//! panic isolation, and routes whatever the handler emits to the next
//! stage or the result sink. A worker exits only when its queue is closed
//! and empty.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::StageMetrics;
use crate::context::Context;
use crate::error::{HandlerError, TaskError};
use crate::pipeline::ShutdownScope;
use crate::queue::{BoundedQueue, OverflowPolicy, PushError, Pushed};
use crate::sink::{ErrorSink, ResultSink, TaskFailure};
use crate::task::{Task, TaskId};

/// Handler output: tasks for the next stage (or the result sink)
pub type HandlerResult<P> = Result<Vec<Task<P>>, HandlerError>;

/// Stage handler function type
pub type Handler<P> =
    Arc<dyn Fn(Context, Task<P>) -> BoxFuture<'static, HandlerResult<P>> + Send + Sync>;

/// Where a stage's emitted tasks go
pub(crate) enum Outlet<P: Send + 'static> {
    /// Next stage's queue, pushed with that stage's policy
    Stage {
        name: String,
        queue: Arc<BoundedQueue<Task<P>>>,
        policy: OverflowPolicy,
        metrics: Arc<StageMetrics>,
    },
    /// Terminal stage: results leave the pipeline
    Sink(Arc<dyn ResultSink<P>>),
}

/// State shared by every worker of a stage
pub(crate) struct WorkerShared<P: Send + 'static> {
    pub stage: String,
    pub queue: Arc<BoundedQueue<Task<P>>>,
    pub handler: Handler<P>,
    pub outlet: Outlet<P>,
    pub max_fan_out: Option<usize>,
    pub scope: Arc<ShutdownScope>,
    pub metrics: Arc<StageMetrics>,
    pub errors: Arc<dyn ErrorSink<P>>,
}

/// Worker pool executing one stage's handler
///
/// The worker count is fixed at construction; resource use is bounded by
/// `worker_count` concurrent handler invocations.
pub struct WorkerPool {
    stage: String,
    worker_count: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers on `runtime`
    pub(crate) fn spawn<P: Send + 'static>(
        runtime: &Handle,
        worker_count: usize,
        shared: Arc<WorkerShared<P>>,
    ) -> Self {
        let handles = (0..worker_count)
            .map(|index| runtime.spawn(run_worker(index, Arc::clone(&shared))))
            .collect();

        Self {
            stage: shared.stage.clone(),
            worker_count,
            handles: Mutex::new(handles),
        }
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Wait for every worker to exit
    ///
    /// Workers exit once their queue is closed and drained. Calling this
    /// again after it returned is a no-op.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(stage = %self.stage, error = %e, "Worker task failed");
            }
        }
    }

    /// Check if every worker has exited
    pub fn is_finished(&self) -> bool {
        self.handles.lock().iter().all(|h| h.is_finished())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stage", &self.stage)
            .field("worker_count", &self.worker_count)
            .finish()
    }
}

async fn run_worker<P: Send + 'static>(index: usize, shared: Arc<WorkerShared<P>>) {
    debug!(stage = %shared.stage, worker = index, "Worker started");

    while let Some(task) = shared.queue.pop().await {
        shared.metrics.record_queue_wait(task.queue_wait());
        shared.process(task).await;
    }

    debug!(stage = %shared.stage, worker = index, "Worker exited");
}

impl<P: Send + 'static> WorkerShared<P> {
    async fn process(&self, task: Task<P>) {
        if self.scope.is_abandoned() {
            return self.report_returned(task, TaskError::AbandonedOnShutdown).await;
        }

        // Short-circuit tasks nobody is waiting for any more
        if let Some(err) = task.context().err() {
            return self.report_returned(task, err.into()).await;
        }
        if self.scope.deadline_passed() {
            return self.report_returned(task, TaskError::AbandonedOnShutdown).await;
        }

        let ctx = task.context().scoped(self.scope.link());
        let task_id = task.id();
        let handler = Arc::clone(&self.handler);
        let handler_ctx = ctx.clone();

        self.metrics.task_started();
        let outcome = AssertUnwindSafe(async move { handler(handler_ctx, task).await })
            .catch_unwind()
            .await;
        self.metrics.task_finished();

        match outcome {
            Ok(Ok(emitted)) => {
                self.metrics.record_processed();
                self.route(&ctx, task_id, emitted).await;
            }
            // Interrupted by a forced shutdown rather than failing on its own
            Ok(Err(_)) if self.scope.is_abandoned() || self.scope.deadline_passed() => {
                self.report_consumed(task_id, TaskError::AbandonedOnShutdown)
                    .await;
            }
            Ok(Err(err)) => {
                self.report_consumed(task_id, TaskError::Handler(err)).await;
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    stage = %self.stage,
                    %task_id,
                    panic = %message,
                    "Handler panicked; worker continues"
                );
                self.report_consumed(task_id, TaskError::Panicked(message))
                    .await;
            }
        }
    }

    async fn route(&self, ctx: &Context, parent: TaskId, emitted: Vec<Task<P>>) {
        if emitted.is_empty() {
            return;
        }

        if let Some(limit) = self.max_fan_out {
            if emitted.len() > limit {
                let count = emitted.len();
                warn!(
                    stage = %self.stage,
                    %parent,
                    emitted = count,
                    limit,
                    "Handler exceeded fan-out limit; emission rejected"
                );
                for child in emitted {
                    let error = TaskError::FanOutExceeded {
                        emitted: count,
                        limit,
                    };
                    self.report_returned(child, error).await;
                }
                return;
            }
        }

        match &self.outlet {
            Outlet::Sink(sink) => {
                for child in emitted {
                    sink.accept(child).await;
                }
            }
            Outlet::Stage {
                name,
                queue,
                policy,
                metrics,
            } => {
                for mut child in emitted {
                    if self.scope.is_abandoned() {
                        self.report_returned(child, TaskError::AbandonedOnShutdown)
                            .await;
                        continue;
                    }

                    child.mark_enqueued();
                    match queue.push(child, *policy, ctx).await {
                        Ok(Pushed::Enqueued) => {}
                        Ok(Pushed::Evicted(old)) => {
                            let error = TaskError::Evicted {
                                stage: name.clone(),
                            };
                            metrics.record_failure(&error);
                            self.errors
                                .report(TaskFailure::returned(name, old, error))
                                .await;
                        }
                        Err(err) => {
                            let error = self.emission_error(name, &err);
                            self.report_returned(err.into_inner(), error).await;
                        }
                    }
                }
            }
        }
    }

    fn emission_error(&self, downstream: &str, err: &PushError<Task<P>>) -> TaskError {
        // Abandonment closes queues and cancels contexts; report the cause
        if self.scope.is_abandoned() || self.scope.deadline_passed() {
            return TaskError::AbandonedOnShutdown;
        }
        match err {
            PushError::Full(_) => TaskError::QueueFull {
                stage: downstream.to_string(),
            },
            PushError::Closed(_) => TaskError::DownstreamClosed {
                stage: downstream.to_string(),
            },
            PushError::Cancelled(_) => TaskError::Cancelled,
            PushError::DeadlineExceeded(_) => TaskError::DeadlineExceeded,
        }
    }

    async fn report_returned(&self, task: Task<P>, error: TaskError) {
        self.metrics.record_failure(&error);
        self.errors
            .report(TaskFailure::returned(&self.stage, task, error))
            .await;
    }

    async fn report_consumed(&self, task_id: TaskId, error: TaskError) {
        self.metrics.record_failure(&error);
        self.errors
            .report(TaskFailure::consumed(&self.stage, task_id, error))
            .await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn handler<F, Fut>(f: F) -> Handler<u32>
    where
        F: Fn(Context, Task<u32>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult<u32>> + Send + 'static,
    {
        Arc::new(move |ctx, task| Box::pin(f(ctx, task)))
    }

    struct Harness {
        queue: Arc<BoundedQueue<Task<u32>>>,
        pool: WorkerPool,
        scope: Arc<ShutdownScope>,
        metrics: Arc<StageMetrics>,
        failures: mpsc::UnboundedReceiver<TaskFailure<u32>>,
        results: mpsc::UnboundedReceiver<Task<u32>>,
    }

    fn harness(workers: usize, h: Handler<u32>, max_fan_out: Option<usize>) -> Harness {
        let queue = Arc::new(BoundedQueue::new(16));
        let scope = Arc::new(ShutdownScope::new());
        let metrics = Arc::new(StageMetrics::new());
        let (err_tx, failures) = mpsc::unbounded_channel();
        let (res_tx, results) = mpsc::unbounded_channel();

        let shared = Arc::new(WorkerShared {
            stage: "test".to_string(),
            queue: Arc::clone(&queue),
            handler: h,
            outlet: Outlet::Sink(Arc::new(res_tx)),
            max_fan_out,
            scope: Arc::clone(&scope),
            metrics: Arc::clone(&metrics),
            errors: Arc::new(err_tx),
        });
        let pool = WorkerPool::spawn(&Handle::current(), workers, shared);

        Harness {
            queue,
            pool,
            scope,
            metrics,
            failures,
            results,
        }
    }

    #[tokio::test]
    async fn test_workers_exit_when_queue_closed_and_drained() {
        let mut h = harness(
            3,
            handler(|_ctx, task| async move { Ok(vec![task]) }),
            None,
        );
        assert_eq!(h.pool.worker_count(), 3);

        for i in 0..5 {
            h.queue.try_push(Task::new(i)).unwrap();
        }
        h.queue.close().unwrap();
        h.pool.join().await;

        assert!(h.pool.is_finished());
        let mut seen = Vec::new();
        while let Ok(task) = h.results.try_recv() {
            seen.push(task.into_payload());
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(h.metrics.processed(), 5);
    }

    #[tokio::test]
    async fn test_panic_is_recovered_per_task() {
        let mut h = harness(
            1,
            handler(|_ctx, task| async move {
                if *task.payload() == 1 {
                    panic!("malformed record");
                }
                Ok(vec![task])
            }),
            None,
        );

        for i in 0..3 {
            h.queue.try_push(Task::new(i)).unwrap();
        }
        h.queue.close().unwrap();
        h.pool.join().await;

        let failure = h.failures.try_recv().unwrap();
        assert_eq!(
            failure.error,
            TaskError::Panicked("malformed record".to_string())
        );
        assert!(failure.task.is_none());

        // Same single worker survived to process the task after the panic
        let mut ok = Vec::new();
        while let Ok(task) = h.results.try_recv() {
            ok.push(task.into_payload());
        }
        assert_eq!(ok, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_handler_error_is_reported() {
        let mut h = harness(
            1,
            handler(|_ctx, _task| async move {
                Err(HandlerError::new("out of range").with_kind("VALIDATION"))
            }),
            None,
        );

        let task = Task::new(7);
        let id = task.id();
        h.queue.try_push(task).unwrap();
        h.queue.close().unwrap();
        h.pool.join().await;

        let failure = h.failures.try_recv().unwrap();
        assert_eq!(failure.task_id, id);
        assert_eq!(failure.stage, "test");
        assert!(matches!(failure.error, TaskError::Handler(ref e) if e.message == "out of range"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_task_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut h = harness(
            1,
            handler(move |_ctx, task| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(vec![task]) }
            }),
            None,
        );

        let task = Task::new(1).with_timeout(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.queue.try_push(task).unwrap();
        h.queue.close().unwrap();
        h.pool.join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let failure = h.failures.try_recv().unwrap();
        assert_eq!(failure.error, TaskError::DeadlineExceeded);
        assert_eq!(failure.task.map(Task::into_payload), Some(1));
    }

    #[tokio::test]
    async fn test_cancelled_task_short_circuits() {
        let mut h = harness(
            1,
            handler(|_ctx, task| async move { Ok(vec![task]) }),
            None,
        );

        let task = Task::new(1);
        task.cancel_handle().cancel();
        h.queue.try_push(task).unwrap();
        h.queue.close().unwrap();
        h.pool.join().await;

        assert_eq!(h.failures.try_recv().unwrap().error, TaskError::Cancelled);
        assert!(h.results.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_scope_reports_instead_of_running() {
        let mut h = harness(
            1,
            handler(|_ctx, task| async move { Ok(vec![task]) }),
            None,
        );

        h.scope.abandon();
        h.queue.try_push(Task::new(3)).unwrap();
        h.queue.close().unwrap();
        h.pool.join().await;

        let failure = h.failures.try_recv().unwrap();
        assert_eq!(failure.error, TaskError::AbandonedOnShutdown);
        assert_eq!(h.metrics.abandoned(), 1);
        assert!(h.results.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_interrupted_by_abandon_is_abandoned() {
        let mut h = harness(
            1,
            handler(|ctx: Context, task| async move {
                ctx.run(tokio::time::sleep(Duration::from_secs(10))).await?;
                Ok(vec![task])
            }),
            None,
        );

        let task = Task::new(1);
        let id = task.id();
        h.queue.try_push(task).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        h.scope.abandon();
        h.queue.close().unwrap();
        h.pool.join().await;

        let failure = h.failures.try_recv().unwrap();
        assert_eq!(failure.task_id, id);
        assert_eq!(failure.error, TaskError::AbandonedOnShutdown);
        assert!(failure.task.is_none());
        assert_eq!(h.metrics.abandoned(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_handler_sees_shutdown_deadline() {
        let deadlines = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&deadlines);
        let mut h = harness(
            1,
            handler(move |ctx: Context, task| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().push(ctx.deadline());
                    ctx.run(tokio::time::sleep(Duration::from_secs(60))).await?;
                    seen.lock().push(ctx.deadline());
                    Ok(vec![task])
                }
            }),
            None,
        );

        h.queue.try_push(Task::new(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let started = tokio::time::Instant::now();
        let deadline = started + Duration::from_millis(50);
        h.scope.set_deadline(deadline);
        h.queue.close().unwrap();
        h.pool.join().await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*deadlines.lock(), vec![None]);
        let failure = h.failures.try_recv().unwrap();
        assert_eq!(failure.error, TaskError::AbandonedOnShutdown);
        assert!(h.results.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_limit_rejects_and_reports_children() {
        let mut h = harness(
            1,
            handler(|_ctx, task| async move {
                Ok((0..3).map(|i| task.derive(i)).collect())
            }),
            Some(2),
        );

        h.queue.try_push(Task::new(0)).unwrap();
        h.queue.close().unwrap();
        h.pool.join().await;

        assert!(h.results.try_recv().is_err());
        let mut reported = 0;
        while let Ok(failure) = h.failures.try_recv() {
            assert_eq!(
                failure.error,
                TaskError::FanOutExceeded {
                    emitted: 3,
                    limit: 2
                }
            );
            assert!(failure.task.is_some());
            reported += 1;
        }
        assert_eq!(reported, 3);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
