//! Reuse pool for short-lived scratch objects
//!
//! A [`Pool`] hands out recycled instances of one type so hot handlers do
//! not allocate a fresh buffer per task. It is a cache, not storage: idle
//! objects beyond the cap are dropped, and nothing returned is guaranteed
//! to come back.
//!
//! The pool never resets or inspects what is returned. Callers must clear
//! every mutable field before [`Pool::put`], or the next [`Pool::get`]
//! observes the previous task's data.
//!
//! Not for objects with identity or connection state (database handles,
//! RPC clients).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default number of idle objects kept
pub const DEFAULT_MAX_IDLE: usize = 64;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Allocation-amortizing object pool
///
/// # Example
///
/// ```
/// use sluice::Pool;
///
/// let buffers = Pool::new(|| Vec::<u8>::with_capacity(4096));
///
/// let mut buf = buffers.get();
/// buf.extend_from_slice(b"payload");
/// // ... use buf ...
/// buf.clear();
/// buffers.put(buf);
///
/// assert!(buffers.get().is_empty());
/// ```
pub struct Pool<T> {
    factory: Factory<T>,
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    created: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl<T> Pool<T> {
    /// Create a pool that builds new objects with `factory`
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_max_idle(factory, DEFAULT_MAX_IDLE)
    }

    /// Create a pool keeping at most `max_idle` idle objects
    pub fn with_max_idle<F>(factory: F, max_idle: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            max_idle,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Take a recycled object, or build one if none is idle
    pub fn get(&self) -> T {
        // Pop under the lock, build outside it
        let recycled = self.idle.lock().pop();
        match recycled {
            Some(obj) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                obj
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                (self.factory)()
            }
        }
    }

    /// Return an object for reuse
    ///
    /// The caller must already have reset it.
    pub fn put(&self, obj: T) {
        let mut idle = self.idle.lock();
        if idle.len() >= self.max_idle {
            drop(idle);
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        idle.push(obj);
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of objects waiting to be reused
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.idle())
            .field("max_idle", &self.max_idle)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Pool usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Objects built by the factory
    pub created: u64,
    /// `get` calls served from idle objects
    pub reused: u64,
    /// Objects accepted back by `put`
    pub returned: u64,
    /// Objects dropped by `put` because the pool was full
    pub discarded: u64,
}

impl PoolStats {
    /// Fraction of `get` calls served without allocating
    pub fn hit_rate(&self) -> f64 {
        let total = self.created + self.reused;
        if total == 0 {
            0.0
        } else {
            self.reused as f64 / total as f64
        }
    }
}
