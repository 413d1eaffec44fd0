//! # System Constants
//!
//! Event names, status groupings and limits shared across the orchestration
//! core.

use crate::state_machine::WorkflowState;

/// Lifecycle event names published on the event bus
pub mod events {
    // Job lifecycle events
    pub const JOB_ANALYZED: &str = "job.analyzed";
    pub const JOB_REJECTED: &str = "job.rejected";
    pub const JOB_COMPLETED: &str = "job.completed";

    // Resource events
    pub const RESOURCES_ALLOCATED: &str = "resources.allocated";
    pub const RESOURCES_RELEASED: &str = "resources.released";
    pub const RESOURCES_EXHAUSTED: &str = "resources.exhausted";

    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_STEP_COMPLETED: &str = "workflow.step_completed";
    pub const WORKFLOW_STEP_SKIPPED: &str = "workflow.step_skipped";
    pub const WORKFLOW_STEP_FAILED: &str = "workflow.step_failed";
    pub const WORKFLOW_ROLLED_BACK: &str = "workflow.rolled_back";
    pub const WORKFLOW_PAUSED: &str = "workflow.paused";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";

    // Service events
    pub const SERVICE_REGISTERED: &str = "service.registered";
    pub const SERVICE_DEREGISTERED: &str = "service.deregistered";
    pub const SERVICE_HEALTH_CHANGED: &str = "service.health_changed";
    pub const CIRCUIT_STATE_CHANGED: &str = "circuit.state_changed";
}

/// System-wide constants
pub mod system {
    /// Version reported in health reports
    pub const REELFLOW_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Component name used in structured error logs
    pub const COMPONENT: &str = "orchestrator";

    /// Event bus buffer; slow subscribers lag rather than block publishers
    pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
}

/// Status groupings for validation and logic
pub mod status_groups {
    use super::WorkflowState;

    /// Workflow states that still hold resources
    pub const WORKFLOW_ACTIVE_STATES: &[WorkflowState] = &[
        WorkflowState::Initialized,
        WorkflowState::Running,
        WorkflowState::Paused,
    ];

    pub const WORKFLOW_FINAL_STATES: &[WorkflowState] = &[
        WorkflowState::Completed,
        WorkflowState::Failed,
        WorkflowState::Cancelled,
    ];
}

/// Event name announced when a workflow enters `state`
pub fn workflow_state_event(state: WorkflowState) -> &'static str {
    match state {
        WorkflowState::Initialized | WorkflowState::Running => events::WORKFLOW_STARTED,
        WorkflowState::Paused => events::WORKFLOW_PAUSED,
        WorkflowState::Completed => events::WORKFLOW_COMPLETED,
        WorkflowState::Failed => events::WORKFLOW_FAILED,
        WorkflowState::Cancelled => events::WORKFLOW_CANCELLED,
    }
}
