//! Cancellation context carried by every task
//!
//! A [`Context`] combines an explicit cancellation signal with an optional
//! deadline. Handlers receive one per invocation and are expected to check
//! it at safe points, or to wrap blocking sub-operations in
//! [`Context::run`] so they return as soon as the result is no longer wanted.
//!
//! Contexts form a tree: cancelling a parent cancels every child, and a
//! child's deadline is never later than its parent's.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// Context was cancelled explicitly (or its pipeline abandoned it)
    #[error("context cancelled")]
    Cancelled,

    /// Context deadline has passed
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation signal plus optional deadline
///
/// # Example
///
/// ```ignore
/// async fn handle(ctx: Context, task: Task<Payload>) -> HandlerResult<Payload> {
///     for chunk in task.payload().chunks() {
///         if let Some(err) = ctx.err() {
///             return Err(err.into());
///         }
///         ctx.run(upload(chunk)).await??;
///     }
///     Ok(vec![])
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    /// Pipeline-wide scope, cancelled when a shutdown deadline forces abandonment
    scope: Option<ScopeLink>,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            scope: None,
            deadline: None,
        }
    }

    /// A fresh context expiring `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A fresh context expiring at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::background()
        }
    }

    /// Derive a child context, cancelled whenever this one is
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            scope: self.scope.clone(),
            deadline: self.deadline,
        }
    }

    /// Derive a child whose deadline is the earlier of ours and `deadline`
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = earliest(self.deadline, Some(deadline));
        child
    }

    /// Derive a child expiring at most `timeout` from now
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        self.child_with_deadline(Instant::now() + timeout)
    }

    /// Tighten this context's own deadline in place
    pub(crate) fn tighten(mut self, deadline: Instant) -> Self {
        self.deadline = earliest(self.deadline, Some(deadline));
        self
    }

    /// Link to a pipeline scope, following its shutdown deadline
    pub(crate) fn scoped(&self, scope: ScopeLink) -> Self {
        Self {
            token: self.token.child_token(),
            scope: Some(scope),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and all contexts derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Get a handle that can cancel this context from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }

    /// Absolute deadline, if any
    ///
    /// Inside a pipeline this includes a shutdown deadline set after the
    /// handler started.
    pub fn deadline(&self) -> Option<Instant> {
        earliest(self.deadline, self.scope.as_ref().and_then(ScopeLink::deadline))
    }

    /// Time left before the deadline; `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.scope.as_ref().is_some_and(|s| s.token.is_cancelled())
    }

    /// Check if the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// Why the context is done, or `None` while it is still live
    ///
    /// Cancellation is reported in preference to expiry.
    pub fn err(&self) -> Option<ContextError> {
        if self.is_cancelled() {
            Some(ContextError::Cancelled)
        } else if self.is_expired() {
            Some(ContextError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolve once the context is cancelled or its deadline passes
    pub async fn done(&self) -> ContextError {
        let scope = async {
            match &self.scope {
                Some(scope) => scope.token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => ContextError::Cancelled,
            _ = scope => ContextError::Cancelled,
            _ = self.expired() => ContextError::DeadlineExceeded,
        }
    }

    /// Resolve once the deadline passes, re-arming when the shutdown
    /// deadline moves
    async fn expired(&self) {
        let mut updates = self.scope.as_ref().map(|scope| scope.deadline.clone());
        let mut shutdown = self.scope.as_ref().and_then(ScopeLink::deadline);

        loop {
            let expiry = sleep_until(earliest(self.deadline, shutdown));
            let changed = async {
                match updates.as_mut() {
                    Some(rx) => rx.changed().await.is_ok(),
                    None => std::future::pending().await,
                }
            };

            let updated = tokio::select! {
                _ = expiry => return,
                updated = changed => updated,
            };

            if !updated {
                // Scope gone; its last deadline still applies
                updates = None;
            } else if let Some(rx) = &updates {
                shutdown = *rx.borrow();
            }
        }
    }

    /// Race `operation` against this context
    ///
    /// Returns the operation's output if it finishes first. Otherwise the
    /// operation's future is dropped and the reason is returned.
    pub async fn run<F>(&self, operation: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = operation => Ok(output),
        }
    }
}

/// A worker's view of the pipeline shutdown scope
#[derive(Debug, Clone)]
pub(crate) struct ScopeLink {
    token: CancellationToken,
    deadline: watch::Receiver<Option<Instant>>,
}

impl ScopeLink {
    pub fn new(token: CancellationToken, deadline: watch::Receiver<Option<Instant>>) -> Self {
        Self { token, deadline }
    }

    fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }
}

/// Handle to cancel a context
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the context
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if cancellation was already requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_expired());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
        assert!(ctx.err().is_none());
    }

    #[test]
    fn test_cancellation_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        let handle = parent.cancel_handle();

        assert!(!child.is_cancelled());
        handle.cancel();

        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[test]
    fn test_child_cancel_does_not_affect_parent() {
        let parent = Context::background();
        let child = parent.child();

        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_is_earliest() {
        let now = Instant::now();
        let parent = Context::with_deadline(now + Duration::from_secs(5));

        let later = parent.child_with_deadline(now + Duration::from_secs(10));
        assert_eq!(later.deadline(), Some(now + Duration::from_secs(5)));

        let sooner = parent.child_with_timeout(Duration::from_secs(1));
        assert_eq!(sooner.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let ctx = Context::with_timeout(Duration::from_millis(100));
        assert!(ctx.err().is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(ctx.is_expired());
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_resolves_on_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_done_resolves_on_cancel() {
        let ctx = Context::background();
        let handle = ctx.cancel_handle();

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            handle.cancel();
        });

        assert_eq!(ctx.done().await, ContextError::Cancelled);
    }

    fn scope_link(
        deadline: Option<Instant>,
    ) -> (CancellationToken, watch::Sender<Option<Instant>>, ScopeLink) {
        let token = CancellationToken::new();
        let (tx, rx) = watch::channel(deadline);
        let link = ScopeLink::new(token.clone(), rx);
        (token, tx, link)
    }

    #[tokio::test]
    async fn test_scope_cancellation() {
        let (scope, _tx, link) = scope_link(None);
        let ctx = Context::background().scoped(link);

        assert!(!ctx.is_cancelled());
        scope.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.done().await, ContextError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scoped_intersects_deadline() {
        let now = Instant::now();
        let ctx = Context::with_deadline(now + Duration::from_secs(10));

        let (_scope, _tx, link) = scope_link(Some(now + Duration::from_secs(2)));
        assert_eq!(ctx.scoped(link).deadline(), Some(now + Duration::from_secs(2)));

        let (_scope, _tx, link) = scope_link(None);
        assert_eq!(ctx.scoped(link).deadline(), Some(now + Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline_set_while_running() {
        let (_scope, tx, link) = scope_link(None);
        let ctx = Context::background().scoped(link);
        assert!(ctx.deadline().is_none());

        let waiter = ctx.clone();
        let done = tokio::spawn(async move { waiter.done().await });
        tokio::task::yield_now().await;

        let deadline = Instant::now() + Duration::from_secs(1);
        tx.send_replace(Some(deadline));
        assert_eq!(ctx.deadline(), Some(deadline));
        assert_eq!(ctx.remaining(), Some(Duration::from_secs(1)));

        assert_eq!(done.await.unwrap(), ContextError::DeadlineExceeded);
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline_survives_scope_drop() {
        let deadline = Instant::now() + Duration::from_millis(50);
        let (_scope, tx, link) = scope_link(Some(deadline));
        let ctx = Context::background().scoped(link);
        drop(tx);

        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert!(Instant::now() >= deadline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_output_when_fast() {
        let ctx = Context::with_timeout(Duration::from_secs(1));
        let result = ctx.run(async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_abandons_slow_operation() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        let started = Instant::now();

        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(60)))
            .await;

        assert_eq!(result, Err(ContextError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_run_on_cancelled_context_skips_operation() {
        let ctx = Context::background();
        ctx.cancel();

        let result = ctx.run(async { panic!("must not be polled") }).await;
        assert_eq!(result, Err(ContextError::Cancelled));
    }
}
