//! Bounded queues between producers and stage workers
//!
//! This module provides:
//! - [`BoundedQueue`] - Fixed-capacity FIFO with async push/pop
//! - [`OverflowPolicy`] - What happens when a push meets a full queue

mod bounded;
mod policy;

pub use bounded::{BoundedQueue, CloseError, PushError, Pushed};
pub use policy::{OverflowPolicy, ParsePolicyError};
