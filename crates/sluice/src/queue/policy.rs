//! Overflow policy for full queues

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What `push` does when the queue is at capacity
///
/// Internal stage-to-stage links normally use [`Block`](Self::Block) so a
/// slow stage backpressures the one feeding it. External ingress normally
/// uses [`RejectImmediately`](Self::RejectImmediately) so callers stay
/// responsive and shed load instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space, bounded by the caller's context
    #[default]
    Block,

    /// Fail with `Full` without waiting
    #[serde(alias = "reject")]
    RejectImmediately,

    /// Evict the oldest queued item to make room
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => write!(f, "block"),
            Self::RejectImmediately => write!(f, "reject_immediately"),
            Self::DropOldest => write!(f, "drop_oldest"),
        }
    }
}

/// Error parsing an [`OverflowPolicy`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown overflow policy '{0}' (expected block, reject or drop_oldest)")]
pub struct ParsePolicyError(String);

impl FromStr for OverflowPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "block" => Ok(Self::Block),
            "reject" | "reject_immediately" => Ok(Self::RejectImmediately),
            "drop_oldest" => Ok(Self::DropOldest),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}
