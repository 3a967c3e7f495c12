//! Fixed-capacity FIFO queue shared by producers and a stage's workers
//!
//! The queue is a `VecDeque` behind a short-held lock, with two `Notify`
//! handles for the not-empty and not-full conditions. Channels are not used
//! because drop-oldest needs to evict the head from the producer side, and a
//! blocked `push` that gives up must hand its item back to the caller.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::OverflowPolicy;
use crate::context::{Context, ContextError};

/// Successful push outcome
#[derive(Debug, PartialEq, Eq)]
pub enum Pushed<T> {
    /// Item was appended
    Enqueued,
    /// Item was appended after evicting this older item
    Evicted(T),
}

/// Push failure; always hands the item back
pub enum PushError<T> {
    /// Queue at capacity and the policy does not wait
    Full(T),
    /// Queue no longer accepts items
    Closed(T),
    /// Caller's context was cancelled while waiting for space
    Cancelled(T),
    /// Caller's context expired while waiting for space
    DeadlineExceeded(T),
}

impl<T> PushError<T> {
    fn from_context(err: ContextError, item: T) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled(item),
            ContextError::DeadlineExceeded => Self::DeadlineExceeded(item),
        }
    }

    /// Recover the item that could not be pushed
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item)
            | Self::Closed(item)
            | Self::Cancelled(item)
            | Self::DeadlineExceeded(item) => item,
        }
    }

    /// Check if the failure was a full queue
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }

    /// Check if the failure was a closed queue
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
            Self::Cancelled(_) => f.write_str("Cancelled(..)"),
            Self::DeadlineExceeded(_) => f.write_str("DeadlineExceeded(..)"),
        }
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Closed(_) => f.write_str("queue is closed"),
            Self::Cancelled(_) => f.write_str("cancelled while waiting for queue space"),
            Self::DeadlineExceeded(_) => {
                f.write_str("deadline exceeded while waiting for queue space")
            }
        }
    }
}

impl<T> std::error::Error for PushError<T> {}

/// Close failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CloseError {
    /// `close` was already called
    #[error("queue is already closed")]
    AlreadyClosed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer FIFO queue
///
/// The number of resident items never exceeds [`capacity`](Self::capacity).
/// Closing stops new pushes but keeps already-queued items available to
/// [`pop`](Self::pop) until the queue is empty.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Push according to `policy`
    ///
    /// `ctx` bounds the wait under [`OverflowPolicy::Block`]; the other
    /// policies never wait.
    pub async fn push(
        &self,
        item: T,
        policy: OverflowPolicy,
        ctx: &Context,
    ) -> Result<Pushed<T>, PushError<T>> {
        match policy {
            OverflowPolicy::Block => self.push_blocking(item, ctx).await,
            OverflowPolicy::RejectImmediately => self.try_push(item).map(|()| Pushed::Enqueued),
            OverflowPolicy::DropOldest => self.push_evicting(item),
        }
    }

    /// Push without waiting; fails with `Full` at capacity
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);

        self.not_empty.notify_one();
        Ok(())
    }

    fn push_evicting(&self, item: T) -> Result<Pushed<T>, PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        let evicted = if state.items.len() >= self.capacity {
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);

        self.not_empty.notify_one();
        Ok(match evicted {
            Some(old) => Pushed::Evicted(old),
            None => Pushed::Enqueued,
        })
    }

    async fn push_blocking(&self, mut item: T, ctx: &Context) -> Result<Pushed<T>, PushError<T>> {
        loop {
            // Register interest before checking, so a pop between the check
            // and the await still wakes us.
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_push(item) {
                Ok(()) => return Ok(Pushed::Enqueued),
                Err(PushError::Full(back)) => item = back,
                Err(err) => return Err(err),
            }

            tokio::select! {
                biased;
                _ = &mut notified => {}
                err = ctx.done() => return Err(PushError::from_context(err, item)),
            }
        }
    }

    /// Wait for the next item
    ///
    /// Returns `None` only once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Take the next item if one is queued
    pub fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Stop accepting new items; queued items remain poppable
    pub fn close(&self) -> Result<(), CloseError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CloseError::AlreadyClosed);
        }
        state.closed = true;
        drop(state);

        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        Ok(())
    }

    /// Remove and return every queued item
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_waiters();
        }
        items
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Check if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check if `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.try_push(i).unwrap();
        }

        let mut out = Vec::new();
        while let Some(i) = queue.try_pop() {
            out.push(i);
        }
        assert_eq!(out, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_pop_pending_until_push() {
        let queue = BoundedQueue::new(2);
        let mut pop = tokio_test::task::spawn(queue.pop());
        tokio_test::assert_pending!(pop.poll());

        queue.try_push(7).unwrap();
        assert!(pop.is_woken());
        assert_eq!(tokio_test::assert_ready!(pop.poll()), Some(7));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn test_reject_when_full() {
        let queue = BoundedQueue::new(2);
        let ctx = Context::background();

        for i in 0..2 {
            let pushed = queue
                .push(i, OverflowPolicy::RejectImmediately, &ctx)
                .await
                .unwrap();
            assert_eq!(pushed, Pushed::Enqueued);
        }

        let err = queue
            .push(2, OverflowPolicy::RejectImmediately, &ctx)
            .await
            .unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_head() {
        let queue = BoundedQueue::new(2);
        let ctx = Context::background();

        queue.push(1, OverflowPolicy::DropOldest, &ctx).await.unwrap();
        queue.push(2, OverflowPolicy::DropOldest, &ctx).await.unwrap();
        let pushed = queue.push(3, OverflowPolicy::DropOldest, &ctx).await.unwrap();

        assert_eq!(pushed, Pushed::Evicted(1));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_waits_for_space() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.try_push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .push(2, OverflowPolicy::Block, &Context::background())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await, Some(1));
        let pushed = producer.await.unwrap().unwrap();
        assert_eq!(pushed, Pushed::Enqueued);
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_times_out_and_returns_item() {
        let queue = BoundedQueue::new(1);
        queue.try_push("held").unwrap();

        let ctx = Context::with_timeout(Duration::from_millis(50));
        let err = queue
            .push("late", OverflowPolicy::Block, &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::DeadlineExceeded("late")));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_block_cancelled() {
        let queue = BoundedQueue::new(1);
        queue.try_push(0).unwrap();

        let ctx = Context::background();
        ctx.cancel();

        let err = queue.push(1, OverflowPolicy::Block, &ctx).await.unwrap_err();
        assert!(matches!(err, PushError::Cancelled(1)));
    }

    #[tokio::test]
    async fn test_close_twice_fails() {
        let queue: BoundedQueue<u8> = BoundedQueue::new(1);
        assert!(queue.close().is_ok());
        assert_eq!(queue.close(), Err(CloseError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_push_after_close_fails_loudly() {
        let queue = BoundedQueue::new(4);
        queue.close().unwrap();

        for policy in [
            OverflowPolicy::Block,
            OverflowPolicy::RejectImmediately,
            OverflowPolicy::DropOldest,
        ] {
            let err = queue
                .push(9, policy, &Context::background())
                .await
                .unwrap_err();
            assert!(err.is_closed());
            assert_eq!(err.into_inner(), 9);
        }
    }

    #[tokio::test]
    async fn test_close_keeps_queued_items() {
        let queue = BoundedQueue::new(4);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        queue.close().unwrap();

        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_all_consumers() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.close().unwrap();

        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_close_fails_blocked_producer() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.try_push(0).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .push(1, OverflowPolicy::Block, &Context::background())
                    .await
            })
        };

        tokio::task::yield_now().await;
        queue.close().unwrap();

        let err = producer.await.unwrap().unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_drain() {
        let queue = BoundedQueue::new(3);
        queue.try_push('a').unwrap();
        queue.try_push('b').unwrap();

        assert_eq!(queue.drain(), vec!['a', 'b']);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_never_exceeded_under_contention() {
        let queue = Arc::new(BoundedQueue::new(3));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    for i in 0..50 {
                        queue
                            .push(p * 100 + i, OverflowPolicy::Block, &Context::background())
                            .await
                            .unwrap();
                        max_seen.fetch_max(queue.len(), std::sync::atomic::Ordering::Relaxed);
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut received = 0;
                while received < 400 {
                    if queue.pop().await.is_some() {
                        received += 1;
                    }
                }
                received
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        assert_eq!(consumer.await.unwrap(), 400);
        assert!(max_seen.load(std::sync::atomic::Ordering::Relaxed) <= 3);
    }
}
