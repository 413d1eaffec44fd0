use thiserror::Error;

use super::states::WorkflowState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid workflow transition from {from} on event '{event}'")]
    InvalidTransition { from: WorkflowState, event: String },

    #[error("Workflow is in terminal state {state}; no further transitions allowed")]
    TerminalState { state: WorkflowState },

    #[error("Step {actual} reported out of order, expected step {expected}")]
    StepOutOfOrder { expected: usize, actual: usize },

    #[error("Checkpoint step {target} is after failed step {failed}")]
    InvalidCheckpoint { target: usize, failed: usize },

    #[error("Workflow cannot complete at step {current} of {total}")]
    Incomplete { current: usize, total: usize },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
