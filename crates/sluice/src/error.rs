//! Error types for the engine
//!
//! Three layers of errors exist:
//! - [`PipelineError`] is returned to callers of [`Pipeline`](crate::Pipeline)
//!   operations (submission, construction, shutdown).
//! - [`TaskError`] is what the error sink receives for a single task.
//! - [`HandlerError`] is produced by caller-supplied stage handlers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextError;

/// Errors returned by pipeline operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Entry queue is at capacity and the policy rejects new work
    #[error("queue is full")]
    QueueFull,

    /// Pipeline no longer accepts submissions
    #[error("pipeline is shutting down")]
    ShuttingDown,

    /// Caller's context expired while waiting for queue space
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Caller's context was cancelled while waiting for queue space
    #[error("operation cancelled")]
    Cancelled,

    /// Stages did not reach `Stopped` before the shutdown deadline
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// Pipeline was configured incorrectly
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    /// Workers cannot be spawned outside a tokio runtime
    #[error("no tokio runtime available to spawn workers")]
    NoRuntime,
}

impl From<ContextError> for PipelineError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

/// Why a single task did not complete normally
///
/// Every accepted task ends either processed by its handler or reported
/// to the error sink with one of these.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Handler returned an error
    #[error("handler failed: {0}")]
    Handler(HandlerError),

    /// Handler panicked; the worker recovered and kept running
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Deadline passed before the task could run or finish enqueueing
    #[error("task deadline exceeded")]
    DeadlineExceeded,

    /// Task's context was cancelled before it ran
    #[error("task cancelled")]
    Cancelled,

    /// Task was still queued (or being emitted) when the shutdown deadline expired
    #[error("task abandoned on shutdown")]
    AbandonedOnShutdown,

    /// Downstream queue rejected an emitted task
    #[error("downstream stage '{stage}' queue is full")]
    QueueFull { stage: String },

    /// Task was evicted from a drop-oldest queue to make room
    #[error("evicted from stage '{stage}' queue by a newer task")]
    Evicted { stage: String },

    /// Handler emitted more tasks than the stage allows
    #[error("handler emitted {emitted} tasks, limit is {limit}")]
    FanOutExceeded { emitted: usize, limit: usize },

    /// Downstream queue was already closed when a task was emitted
    #[error("downstream stage '{stage}' is closed")]
    DownstreamClosed { stage: String },
}

impl TaskError {
    /// Short machine-friendly label, used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Handler(_) => "handler",
            Self::Panicked(_) => "panicked",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::AbandonedOnShutdown => "abandoned_on_shutdown",
            Self::QueueFull { .. } => "queue_full",
            Self::Evicted { .. } => "evicted",
            Self::FanOutExceeded { .. } => "fan_out_exceeded",
            Self::DownstreamClosed { .. } => "downstream_closed",
        }
    }
}

impl From<ContextError> for TaskError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl From<HandlerError> for TaskError {
    fn from(err: HandlerError) -> Self {
        Self::Handler(err)
    }
}

/// Error returned by a stage handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub kind: Option<String>,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl HandlerError {
    /// Create a new handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            details: None,
        }
    }

    /// Set the error kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Some(kind) => write!(f, "[{}] {}", kind, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

impl From<ContextError> for HandlerError {
    fn from(err: ContextError) -> Self {
        let kind = match err {
            ContextError::Cancelled => "cancelled",
            ContextError::DeadlineExceeded => "deadline_exceeded",
        };
        Self::new(err.to_string()).with_kind(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_display() {
        let error = HandlerError::new("value out of range");
        assert_eq!(error.to_string(), "value out of range");

        let error = error.with_kind("VALIDATION");
        assert_eq!(error.to_string(), "[VALIDATION] value out of range");
    }

    #[test]
    fn test_handler_error_from_anyhow() {
        let err = anyhow::anyhow!("connection reset").context("writing record");
        let error = HandlerError::from(err);
        assert_eq!(error.message, "writing record: connection reset");
        assert!(error.kind.is_none());
    }

    #[test]
    fn test_handler_error_from_context_error() {
        let error = HandlerError::from(ContextError::DeadlineExceeded);
        assert_eq!(error.kind.as_deref(), Some("deadline_exceeded"));
    }

    #[test]
    fn test_handler_error_serialization() {
        let error = HandlerError::new("bad unit")
            .with_kind("VALIDATION")
            .with_details(serde_json::json!({"field": "unit"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: HandlerError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }

    #[test]
    fn test_task_error_kind() {
        assert_eq!(TaskError::AbandonedOnShutdown.kind(), "abandoned_on_shutdown");
        assert_eq!(
            TaskError::FanOutExceeded {
                emitted: 5,
                limit: 2
            }
            .kind(),
            "fan_out_exceeded"
        );
        assert_eq!(
            TaskError::from(ContextError::Cancelled),
            TaskError::Cancelled
        );
    }

    #[test]
    fn test_pipeline_error_from_context_error() {
        assert_eq!(
            PipelineError::from(ContextError::DeadlineExceeded),
            PipelineError::DeadlineExceeded
        );
        assert_eq!(
            PipelineError::from(ContextError::Cancelled),
            PipelineError::Cancelled
        );
    }
}
