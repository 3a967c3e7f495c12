//! Where finished and failed tasks go
//!
//! A pipeline reports every task exactly once: to the [`ResultSink`] when
//! the terminal stage's handler emits it, or to the [`ErrorSink`] with a
//! [`TaskError`] explaining why it did not get there.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::task::{Task, TaskId};

/// A task that did not complete normally
#[derive(Debug)]
pub struct TaskFailure<P> {
    /// Stage where the failure happened
    pub stage: String,

    /// Failed task
    pub task_id: TaskId,

    /// What went wrong
    pub error: TaskError,

    /// The task itself, when it never reached a handler
    ///
    /// Present for abandoned, expired, cancelled, rejected and evicted
    /// tasks so the caller can persist or resubmit them. `None` once a
    /// handler has consumed the task.
    pub task: Option<Task<P>>,
}

impl<P> TaskFailure<P> {
    pub(crate) fn consumed(stage: &str, task_id: TaskId, error: TaskError) -> Self {
        Self {
            stage: stage.to_string(),
            task_id,
            error,
            task: None,
        }
    }

    pub(crate) fn returned(stage: &str, task: Task<P>, error: TaskError) -> Self {
        Self {
            stage: stage.to_string(),
            task_id: task.id(),
            error,
            task: Some(task),
        }
    }
}

/// Receives per-task failures
#[async_trait]
pub trait ErrorSink<P: Send + 'static>: Send + Sync {
    /// Report one failure
    async fn report(&self, failure: TaskFailure<P>);
}

/// Receives tasks emitted by the terminal stage
#[async_trait]
pub trait ResultSink<P: Send + 'static>: Send + Sync {
    /// Accept one finished task
    async fn accept(&self, task: Task<P>);
}

#[async_trait]
impl<P: Send + 'static, S: ErrorSink<P> + ?Sized> ErrorSink<P> for Arc<S> {
    async fn report(&self, failure: TaskFailure<P>) {
        (**self).report(failure).await
    }
}

#[async_trait]
impl<P: Send + 'static, S: ResultSink<P> + ?Sized> ResultSink<P> for Arc<S> {
    async fn accept(&self, task: Task<P>) {
        (**self).accept(task).await
    }
}

/// Logs failures and results through `tracing`
///
/// The default for both sinks when none is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl<P: Send + 'static> ErrorSink<P> for LogSink {
    async fn report(&self, failure: TaskFailure<P>) {
        warn!(
            stage = %failure.stage,
            task_id = %failure.task_id,
            kind = failure.error.kind(),
            error = %failure.error,
            "Task failed"
        );
    }
}

#[async_trait]
impl<P: Send + 'static> ResultSink<P> for LogSink {
    async fn accept(&self, task: Task<P>) {
        debug!(task_id = %task.id(), parent = ?task.parent(), "Task completed");
    }
}

/// Drops results silently
///
/// For pipelines whose terminal stage works purely by side effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardSink;

#[async_trait]
impl<P: Send + 'static> ResultSink<P> for DiscardSink {
    async fn accept(&self, _task: Task<P>) {}
}

#[async_trait]
impl<P: Send + 'static> ErrorSink<P> for mpsc::UnboundedSender<TaskFailure<P>> {
    async fn report(&self, failure: TaskFailure<P>) {
        if let Err(mpsc::error::SendError(failure)) = self.send(failure) {
            warn!(
                stage = %failure.stage,
                task_id = %failure.task_id,
                error = %failure.error,
                "Error sink receiver dropped; failure only logged"
            );
        }
    }
}

#[async_trait]
impl<P: Send + 'static> ResultSink<P> for mpsc::UnboundedSender<Task<P>> {
    async fn accept(&self, task: Task<P>) {
        if let Err(mpsc::error::SendError(task)) = self.send(task) {
            warn!(task_id = %task.id(), "Result sink receiver dropped; result discarded");
        }
    }
}

#[async_trait]
impl<P: Send + 'static> ErrorSink<P> for mpsc::Sender<TaskFailure<P>> {
    async fn report(&self, failure: TaskFailure<P>) {
        if let Err(mpsc::error::SendError(failure)) = self.send(failure).await {
            warn!(
                stage = %failure.stage,
                task_id = %failure.task_id,
                error = %failure.error,
                "Error sink receiver dropped; failure only logged"
            );
        }
    }
}

#[async_trait]
impl<P: Send + 'static> ResultSink<P> for mpsc::Sender<Task<P>> {
    async fn accept(&self, task: Task<P>) {
        if let Err(mpsc::error::SendError(task)) = self.send(task).await {
            warn!(task_id = %task.id(), "Result sink receiver dropped; result discarded");
        }
    }
}
