//! Outcome accounting for the ingest pipeline

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sluice::{ErrorSink, ResultSink, Task, TaskError, TaskFailure};
use tracing::{debug, info, warn};

use crate::payload::Payload;

/// Counts every task that leaves the pipeline
///
/// Installed as both the result sink and the error sink. Completions are
/// keyed by the kind of payload that was stored; failures by
/// [`TaskError::kind`].
#[derive(Debug, Default)]
pub struct OutcomeLedger {
    completed: DashMap<String, u64>,
    failures: DashMap<&'static str, u64>,
}

impl OutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.completed.iter().map(|entry| *entry.value()).sum()
    }

    pub fn failed(&self) -> u64 {
        self.failures.iter().map(|entry| *entry.value()).sum()
    }

    /// Failures of one kind (e.g. "queue_full")
    pub fn failures_of(&self, kind: &str) -> u64 {
        self.failures.get(kind).map(|count| *count).unwrap_or(0)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            completed: self
                .completed
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
            failures: self
                .failures
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
        }
    }
}

#[async_trait]
impl ResultSink<Payload> for OutcomeLedger {
    async fn accept(&self, task: Task<Payload>) {
        let kind = match task.payload() {
            Payload::Persisted(record) => record.kind.clone(),
            other => other.kind().to_string(),
        };
        debug!(task_id = %task.id(), %kind, "Task completed");
        *self.completed.entry(kind).or_insert(0) += 1;
    }
}

#[async_trait]
impl ErrorSink<Payload> for OutcomeLedger {
    async fn report(&self, failure: TaskFailure<Payload>) {
        let kind = failure.error.kind();
        match &failure.error {
            TaskError::Handler(error) => {
                info!(
                    stage = %failure.stage,
                    task_id = %failure.task_id,
                    error = %error,
                    "Task rejected by handler"
                );
            }
            TaskError::Panicked(_) => {
                warn!(
                    stage = %failure.stage,
                    task_id = %failure.task_id,
                    error = %failure.error,
                    "Handler panicked"
                );
            }
            _ => {
                warn!(
                    stage = %failure.stage,
                    task_id = %failure.task_id,
                    error = %failure.error,
                    kind,
                    returned = failure.task.is_some(),
                    "Task did not complete"
                );
            }
        }
        *self.failures.entry(kind).or_insert(0) += 1;
    }
}

/// Serializable view of an [`OutcomeLedger`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub completed: BTreeMap<String, u64>,
    pub failures: BTreeMap<String, u64>,
}
