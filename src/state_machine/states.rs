use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created, not yet driven
    Initialized,
    /// The driving loop is executing steps
    Running,
    /// Suspended at a step boundary
    Paused,
    /// Every step finished or was skipped
    Completed,
    /// Aborted after a step failure or a workflow timeout
    Failed,
    /// Stopped by a user or by orchestrator shutdown
    Cancelled,
}

impl WorkflowState {
    /// Terminal states accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::Initialized
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initialized" => Ok(Self::Initialized),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow state: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(WorkflowState::Completed.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Paused.is_terminal());
        assert!(!WorkflowState::Running.is_terminal());
    }

    #[test]
    fn test_state_string_conversion() {
        assert_eq!(WorkflowState::Paused.to_string(), "paused");
        assert_eq!(
            "cancelled".parse::<WorkflowState>().unwrap(),
            WorkflowState::Cancelled
        );
        assert!("resolved_manually".parse::<WorkflowState>().is_err());

        let json = serde_json::to_string(&WorkflowState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
