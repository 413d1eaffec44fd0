use serde::{Deserialize, Serialize};

/// How a failed step wants the workflow to react, resolved from the step's
/// `RollbackStrategy` against the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackTarget {
    Abort,
    AbortAfterSiblings,
    Checkpoint { index: usize },
}

/// Inputs to the workflow transition function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Start,
    Pause,
    Resume,
    StepSucceeded { index: usize },
    StepSkipped { index: usize },
    /// Join barrier passed for the parallel group `start..end`
    GroupCompleted { start: usize, end: usize },
    StepFailed { index: usize, target: RollbackTarget },
    Complete,
    Fail(String),
    TimedOut,
    Cancel,
}

impl WorkflowEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::StepSucceeded { .. } => "step_succeeded",
            Self::StepSkipped { .. } => "step_skipped",
            Self::GroupCompleted { .. } => "group_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::Complete => "complete",
            Self::Fail(_) => "fail",
            Self::TimedOut => "timed_out",
            Self::Cancel => "cancel",
        }
    }

    pub fn fail_with_error(error: impl Into<String>) -> Self {
        Self::Fail(error.into())
    }
}
