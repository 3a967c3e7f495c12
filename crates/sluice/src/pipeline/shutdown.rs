//! Shutdown coordination
//!
//! Shutdown closes the entry queue, then walks the stages in order: once
//! every worker of stage `i` has exited, the queue of stage `i + 1` is
//! closed. A downstream queue is therefore never closed while an upstream
//! worker could still emit into it.
//!
//! The cascade runs on a background task. If the caller's deadline passes
//! first, the pipeline scope is cancelled, every queue is closed and
//! drained, and each drained task is reported as abandoned. The cascade
//! keeps running until the workers wind down on their own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::orchestrator::PipelineInner;
use super::{Pipeline, PipelineEvent, Stage};
use crate::context::{earliest, Context, ScopeLink};
use crate::error::{PipelineError, TaskError};
use crate::sink::TaskFailure;

/// How long `shutdown` waits on the error sink after abandoning tasks
pub const ABANDON_REPORT_GRACE: Duration = Duration::from_millis(100);

/// Pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Accepting submissions
    Running,
    /// Entry queue closed; stages draining in order
    ShuttingDown,
    /// Every stage has stopped
    Drained,
    /// Shutdown complete and signalled
    Stopped,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Drained => write!(f, "drained"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Pipeline-wide abandonment signal shared with every worker
///
/// Handler contexts hold a [`ScopeLink`], so a deadline set after a
/// handler started still reaches it.
#[derive(Debug)]
pub(crate) struct ShutdownScope {
    token: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
}

impl Default for ShutdownScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownScope {
    pub fn new() -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            deadline,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Handle for a handler context
    pub fn link(&self) -> ScopeLink {
        ScopeLink::new(self.token.clone(), self.deadline.subscribe())
    }

    /// Shutdown deadline, once a shutdown with a deadline has begun
    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    /// Record a shutdown deadline; an earlier existing one wins
    pub fn set_deadline(&self, deadline: Instant) {
        self.deadline.send_if_modified(|current| {
            let next = earliest(*current, Some(deadline));
            let changed = next != *current;
            *current = next;
            changed
        });
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Give up on all remaining work
    pub fn abandon(&self) {
        self.token.cancel();
    }

    pub fn is_abandoned(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl<P: Send + 'static> Pipeline<P> {
    /// Stop accepting work and wait for everything accepted to finish
    ///
    /// `ctx` bounds the wait. On expiry (or cancellation) queued tasks are
    /// reported as [`TaskError::AbandonedOnShutdown`], in-flight handlers
    /// see their context cancelled, and this returns
    /// [`PipelineError::ShutdownTimeout`]. Workers still finish exiting in
    /// the background.
    ///
    /// Calling this after the pipeline stopped returns `Ok(())`; concurrent
    /// calls all wait for the same cascade.
    #[instrument(skip(self, ctx), fields(stages = self.inner.stages.len()))]
    pub async fn shutdown(&self, ctx: &Context) -> Result<(), PipelineError> {
        if let Some(deadline) = ctx.deadline() {
            self.inner.scope.set_deadline(deadline);
        }

        if self.inner.begin_shutdown() {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move { inner.cascade().await });
        }

        let mut state_rx = self.inner.state_tx.subscribe();
        // The sender lives in `inner`, so the wait only ends on `Stopped`
        let stopped = ctx
            .run(state_rx.wait_for(|state| *state == PipelineState::Stopped))
            .await
            .map(|_| ());

        match stopped {
            Ok(()) => {
                info!("Pipeline shutdown complete");
                Ok(())
            }
            Err(reason) => {
                warn!(%reason, "Shutdown deadline reached; abandoning remaining tasks");
                self.inner.abandon().await;
                Err(PipelineError::ShutdownTimeout)
            }
        }
    }

    /// [`shutdown`](Self::shutdown) with a deadline `timeout` from now
    pub async fn shutdown_timeout(&self, timeout: Duration) -> Result<(), PipelineError> {
        self.shutdown(&Context::with_timeout(timeout)).await
    }
}

impl<P: Send + 'static> PipelineInner<P> {
    /// Move `Running -> ShuttingDown` and close the entry queue
    ///
    /// Returns `false` if shutdown had already begun.
    pub(super) fn begin_shutdown(&self) -> bool {
        let started = self.state_tx.send_if_modified(|state| {
            if *state == PipelineState::Running {
                *state = PipelineState::ShuttingDown;
                true
            } else {
                false
            }
        });
        if !started {
            return false;
        }

        info!("Pipeline shutdown started");
        self.emit(PipelineEvent::StateChanged {
            from: PipelineState::Running,
            to: PipelineState::ShuttingDown,
        });
        if let Some(entry) = self.stages.first() {
            self.close_stage(entry);
        }
        true
    }

    async fn cascade(&self) {
        for (index, stage) in self.stages.iter().enumerate() {
            // Entry queue was closed by `begin_shutdown`
            if index > 0 {
                self.close_stage(stage);
            }

            stage.join().await;
            info!(
                stage = %stage.name(),
                processed = stage.metrics().processed(),
                "Stage stopped"
            );
            self.emit(PipelineEvent::StageStopped {
                stage: stage.name().to_string(),
            });
        }

        self.transition(PipelineState::ShuttingDown, PipelineState::Drained);
        self.transition(PipelineState::Drained, PipelineState::Stopped);
    }

    fn close_stage(&self, stage: &Stage<P>) {
        if !stage.close() {
            debug!(stage = %stage.name(), "Stage queue already closed");
        }
        debug!(stage = %stage.name(), remaining = stage.queue_depth(), "Stage draining");
        self.emit(PipelineEvent::StageDraining {
            stage: stage.name().to_string(),
        });
    }

    fn transition(&self, from: PipelineState, to: PipelineState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(%from, %to, "Pipeline state changed");
            self.emit(PipelineEvent::StateChanged { from, to });
        }
    }

    /// Cancel the scope, then close and drain every queue
    ///
    /// Drained tasks are reported from a separate task. A slow error sink
    /// gets [`ABANDON_REPORT_GRACE`] before the caller moves on; reporting
    /// then continues in the background.
    pub(super) async fn abandon(&self) {
        self.scope.abandon();

        // Close everything first so nothing lands behind the drain
        for stage in &self.stages {
            stage.close();
        }

        let mut failures = Vec::new();
        for stage in &self.stages {
            let abandoned = stage.queue().drain();
            if abandoned.is_empty() {
                continue;
            }

            warn!(
                stage = %stage.name(),
                count = abandoned.len(),
                "Abandoning queued tasks"
            );
            self.emit(PipelineEvent::TasksAbandoned {
                stage: stage.name().to_string(),
                count: abandoned.len(),
            });

            for task in abandoned {
                stage
                    .metrics()
                    .record_failure(&TaskError::AbandonedOnShutdown);
                failures.push(TaskFailure::returned(
                    stage.name(),
                    task,
                    TaskError::AbandonedOnShutdown,
                ));
            }
        }
        if failures.is_empty() {
            return;
        }

        let count = failures.len();
        let errors = Arc::clone(&self.errors);
        let reporting = self.runtime.spawn(async move {
            for failure in failures {
                errors.report(failure).await;
            }
        });

        match tokio::time::timeout(ABANDON_REPORT_GRACE, reporting).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, count, "Reporting abandoned tasks failed"),
            Err(_) => warn!(
                count,
                "Error sink is backed up; abandoned tasks are still being reported"
            ),
        }
    }
}
