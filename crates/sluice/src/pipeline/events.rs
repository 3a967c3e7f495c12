//! Lifecycle events broadcast to observers

use serde::{Deserialize, Serialize};

use super::PipelineState;

/// Something observable happened to the pipeline
///
/// Delivered through [`Pipeline::subscribe`](super::Pipeline::subscribe).
/// Slow subscribers may miss events (broadcast lag); no control decision
/// depends on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Pipeline moved between lifecycle states
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },

    /// Stage queue closed; workers are finishing what is left
    StageDraining { stage: String },

    /// Every worker of the stage has exited
    StageStopped { stage: String },

    /// Queued tasks were abandoned at the shutdown deadline
    TasksAbandoned { stage: String, count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::TasksAbandoned {
            stage: "persist".to_string(),
            count: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "tasks_abandoned");
        assert_eq!(json["stage"], "persist");
        assert_eq!(json["count"], 3);
    }
}
