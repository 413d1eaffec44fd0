//! Typed lifecycle events published by the orchestration core.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::events;
use crate::error::FailureClass;
use crate::models::{
    HealthStatus, JobComplexity, ProcessingStrategy, ResourceStatus, ResourceType,
};
use crate::resilience::CircuitState;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEvent {
    JobAnalyzed {
        job_id: String,
        complexity: JobComplexity,
        strategy: ProcessingStrategy,
        estimated_duration_secs: f64,
    },
    JobRejected {
        job_id: String,
        error_code: String,
        message: String,
    },
    JobCompleted {
        job_id: String,
        result_url: Option<String>,
    },
    ResourcesAllocated {
        allocation_id: Uuid,
        job_id: String,
    },
    ResourcesReleased {
        allocation_id: Uuid,
        job_id: String,
        status: ResourceStatus,
    },
    ResourcesExhausted {
        job_id: String,
        resource_type: ResourceType,
        requested: f64,
        available: f64,
    },
    WorkflowStarted {
        workflow_id: Uuid,
        job_id: String,
        strategy: ProcessingStrategy,
        total_steps: usize,
    },
    StepCompleted {
        workflow_id: Uuid,
        step_name: String,
        step_index: usize,
        attempts: u32,
        duration_ms: u64,
    },
    StepSkipped {
        workflow_id: Uuid,
        step_name: String,
        step_index: usize,
    },
    StepFailed {
        workflow_id: Uuid,
        step_name: String,
        class: FailureClass,
        attempts: u32,
        message: String,
    },
    WorkflowRolledBack {
        workflow_id: Uuid,
        checkpoint: String,
        rollback_count: u32,
    },
    WorkflowPaused {
        workflow_id: Uuid,
    },
    WorkflowResumed {
        workflow_id: Uuid,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        job_id: String,
        result_url: Option<String>,
    },
    WorkflowFailed {
        workflow_id: Uuid,
        job_id: String,
        error: String,
    },
    WorkflowCancelled {
        workflow_id: Uuid,
        job_id: String,
    },
    ServiceRegistered {
        service_name: String,
        instance_id: Uuid,
        endpoint: String,
    },
    ServiceDeregistered {
        service_name: String,
        instance_id: Uuid,
        reason: String,
    },
    ServiceHealthChanged {
        service_name: String,
        instance_id: Uuid,
        from: HealthStatus,
        to: HealthStatus,
    },
    CircuitStateChanged {
        breaker: String,
        from: CircuitState,
        to: CircuitState,
    },
}

impl OrchestrationEvent {
    /// Stable dotted name used by subscribers for filtering
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobAnalyzed { .. } => events::JOB_ANALYZED,
            Self::JobRejected { .. } => events::JOB_REJECTED,
            Self::JobCompleted { .. } => events::JOB_COMPLETED,
            Self::ResourcesAllocated { .. } => events::RESOURCES_ALLOCATED,
            Self::ResourcesReleased { .. } => events::RESOURCES_RELEASED,
            Self::ResourcesExhausted { .. } => events::RESOURCES_EXHAUSTED,
            Self::WorkflowStarted { .. } => events::WORKFLOW_STARTED,
            Self::StepCompleted { .. } => events::WORKFLOW_STEP_COMPLETED,
            Self::StepSkipped { .. } => events::WORKFLOW_STEP_SKIPPED,
            Self::StepFailed { .. } => events::WORKFLOW_STEP_FAILED,
            Self::WorkflowRolledBack { .. } => events::WORKFLOW_ROLLED_BACK,
            Self::WorkflowPaused { .. } => events::WORKFLOW_PAUSED,
            Self::WorkflowResumed { .. } => events::WORKFLOW_RESUMED,
            Self::WorkflowCompleted { .. } => events::WORKFLOW_COMPLETED,
            Self::WorkflowFailed { .. } => events::WORKFLOW_FAILED,
            Self::WorkflowCancelled { .. } => events::WORKFLOW_CANCELLED,
            Self::ServiceRegistered { .. } => events::SERVICE_REGISTERED,
            Self::ServiceDeregistered { .. } => events::SERVICE_DEREGISTERED,
            Self::ServiceHealthChanged { .. } => events::SERVICE_HEALTH_CHANGED,
            Self::CircuitStateChanged { .. } => events::CIRCUIT_STATE_CHANGED,
        }
    }

    /// Workflow the event belongs to, if any
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::StepCompleted { workflow_id, .. }
            | Self::StepSkipped { workflow_id, .. }
            | Self::StepFailed { workflow_id, .. }
            | Self::WorkflowRolledBack { workflow_id, .. }
            | Self::WorkflowPaused { workflow_id }
            | Self::WorkflowResumed { workflow_id }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowFailed { workflow_id, .. }
            | Self::WorkflowCancelled { workflow_id, .. } => Some(*workflow_id),
            _ => None,
        }
    }
}
