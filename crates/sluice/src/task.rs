//! Task: an owned payload plus its cancellation context

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::context::{CancelHandle, Context};

/// Unique task identifier (UUID v7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work flowing through a pipeline
///
/// A task owns its payload exclusively. Queues move tasks rather than
/// sharing them, and `Task` is deliberately not `Clone`, so at most one
/// worker can ever hold a given task.
#[derive(Debug)]
pub struct Task<P> {
    id: TaskId,
    parent: Option<TaskId>,
    payload: P,
    context: Context,
    created_at: DateTime<Utc>,
    enqueued_at: Option<Instant>,
}

impl<P> Task<P> {
    /// Create a task with a background context (no deadline)
    pub fn new(payload: P) -> Self {
        Self {
            id: TaskId::new(),
            parent: None,
            payload,
            context: Context::background(),
            created_at: Utc::now(),
            enqueued_at: None,
        }
    }

    /// Replace the task's context
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Set an absolute deadline (keeps an earlier existing one)
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.context = self.context.tighten(deadline);
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Create a downstream task that inherits this task's context
    ///
    /// Cancelling the parent's context cancels the child as well.
    pub fn derive<Q>(&self, payload: Q) -> Task<Q> {
        Task {
            id: TaskId::new(),
            parent: Some(self.id),
            payload,
            context: self.context.child(),
            created_at: Utc::now(),
            enqueued_at: None,
        }
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Id of the task this one was derived from
    pub fn parent(&self) -> Option<TaskId> {
        self.parent
    }

    /// Borrow the payload
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Mutably borrow the payload
    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    /// Take the payload, consuming the task
    pub fn into_payload(self) -> P {
        self.payload
    }

    /// The task's own context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Task deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.context.deadline()
    }

    /// Handle the submitter can use to signal it no longer wants the result
    pub fn cancel_handle(&self) -> CancelHandle {
        self.context.cancel_handle()
    }

    /// Wall-clock creation time
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the task last entered a queue
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.enqueued_at
    }

    /// How long the task has been waiting since it was last enqueued
    pub fn queue_wait(&self) -> Duration {
        self.enqueued_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn mark_enqueued(&mut self) {
        self.enqueued_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("payload");
        assert_eq!(*task.payload(), "payload");
        assert!(task.parent().is_none());
        assert!(task.deadline().is_none());
        assert!(task.enqueued_at().is_none());
        assert_eq!(task.queue_wait(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_keeps_earliest() {
        let now = Instant::now();
        let task = Task::new(1)
            .with_deadline(now + Duration::from_secs(1))
            .with_deadline(now + Duration::from_secs(5));

        assert_eq!(task.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_derive_links_parent_and_context() {
        let parent = Task::new("batch");
        let child: Task<u32> = parent.derive(7);

        assert_eq!(child.parent(), Some(parent.id()));
        assert_ne!(child.id(), parent.id());
        assert_eq!(*child.payload(), 7);

        parent.cancel_handle().cancel();
        assert!(child.context().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_wait_measures_since_enqueue() {
        let mut task = Task::new(());
        task.mark_enqueued();

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(task.queue_wait() >= Duration::from_millis(250));
    }

    #[test]
    fn test_task_id_serializes_as_uuid() {
        let id = TaskId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }
}
