// State machine module for workflow executions
//
// Workflow lifecycle states, the events that move them, and a pure transition
// table the workflow engine drives.

pub mod errors;
pub mod events;
pub mod states;
pub mod workflow_state_machine;

// Re-export main types for convenient access
pub use errors::{StateMachineError, StateMachineResult};
pub use events::{RollbackTarget, WorkflowEvent};
pub use states::WorkflowState;
pub use workflow_state_machine::{transition, Effect, WorkflowMachine};
