//! # Orchestration Types
//!
//! Results and read-only views handed to collaborators of the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::status_sink::{ErrorInfo, JobStatus};
use crate::error::OrchestratorError;
use crate::models::{ProcessingStrategy, ResourceStatus, WorkflowExecution, WorkflowMetrics};
use crate::state_machine::WorkflowState;

/// How `orchestrate` disposed of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    /// Executed inline; the result is final
    Immediate,
    /// Handed to the workflow engine; poll for progress
    Queued,
    /// Rejected or failed before completion
    Failed,
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestrationStatus::Immediate => write!(f, "immediate"),
            OrchestrationStatus::Queued => write!(f, "queued"),
            OrchestrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of orchestrating one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResult {
    pub job_id: String,
    pub orchestration_id: Uuid,
    pub status: OrchestrationStatus,
    pub job_status: JobStatus,
    pub strategy: Option<ProcessingStrategy>,
    pub result_url: Option<String>,
    pub message: String,
    pub workflow_id: Option<Uuid>,
    pub error: Option<ErrorInfo>,
}

impl OrchestrationResult {
    pub fn immediate(
        job_id: impl Into<String>,
        strategy: ProcessingStrategy,
        workflow_id: Uuid,
        result_url: Option<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            orchestration_id: Uuid::new_v4(),
            status: OrchestrationStatus::Immediate,
            job_status: JobStatus::Completed,
            strategy: Some(strategy),
            result_url,
            message: "Job completed synchronously".to_string(),
            workflow_id: Some(workflow_id),
            error: None,
        }
    }

    pub fn queued(job_id: impl Into<String>, strategy: ProcessingStrategy, workflow_id: Uuid) -> Self {
        Self {
            job_id: job_id.into(),
            orchestration_id: Uuid::new_v4(),
            status: OrchestrationStatus::Queued,
            job_status: JobStatus::Processing,
            strategy: Some(strategy),
            result_url: None,
            message: format!("Job accepted for {strategy} processing"),
            workflow_id: Some(workflow_id),
            error: None,
        }
    }

    pub fn failed(job_id: impl Into<String>, error: ErrorInfo) -> Self {
        Self {
            job_id: job_id.into(),
            orchestration_id: Uuid::new_v4(),
            status: OrchestrationStatus::Failed,
            job_status: JobStatus::Failed,
            strategy: None,
            result_url: None,
            message: error.message.clone(),
            workflow_id: None,
            error: Some(error),
        }
    }

    pub fn from_error(job_id: impl Into<String>, error: &OrchestratorError) -> Self {
        Self::failed(job_id, ErrorInfo::from(error))
    }

    pub fn with_strategy(mut self, strategy: ProcessingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_workflow(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == OrchestrationStatus::Failed
    }
}

/// Projection of a job's current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub workflow_id: Option<Uuid>,
    pub strategy: Option<ProcessingStrategy>,
    pub progress_percent: f64,
    pub current_step: Option<String>,
    pub result_url: Option<String>,
    pub allocation_status: Option<ResourceStatus>,
    pub error: Option<ErrorInfo>,
    pub updated_at: DateTime<Utc>,
}

impl JobStatusView {
    pub fn from_execution(execution: &WorkflowExecution) -> Self {
        let terminal = execution.state.is_terminal();
        Self {
            job_id: execution.job_id.clone(),
            status: JobStatus::from(execution.state),
            workflow_id: Some(execution.id),
            strategy: Some(execution.definition.strategy),
            progress_percent: execution.progress_percent(),
            current_step: (!terminal)
                .then(|| execution.current_step_name().map(str::to_string))
                .flatten(),
            result_url: execution.context.result_url(),
            allocation_status: Some(execution.context.allocation.status),
            error: (execution.state == WorkflowState::Failed)
                .then(|| execution.last_error.as_ref())
                .flatten()
                .map(|err| ErrorInfo::from(&OrchestratorError::Workflow(err.clone()))),
            updated_at: execution
                .finished_at
                .or(execution.started_at)
                .unwrap_or(execution.created_at),
        }
    }

    /// View of a job that never reached the workflow engine
    pub fn rejected(result: &OrchestrationResult) -> Self {
        Self {
            job_id: result.job_id.clone(),
            status: result.job_status,
            workflow_id: None,
            strategy: result.strategy,
            progress_percent: 0.0,
            current_step: None,
            result_url: None,
            allocation_status: None,
            error: result.error.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Projection of one workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusView {
    pub workflow_id: Uuid,
    pub job_id: String,
    pub state: WorkflowState,
    pub strategy: ProcessingStrategy,
    pub current_step: usize,
    pub current_step_name: Option<String>,
    pub total_steps: usize,
    pub progress_percent: f64,
    pub completed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub rollback_count: u32,
    pub metrics: WorkflowMetrics,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowExecution> for WorkflowStatusView {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            workflow_id: execution.id,
            job_id: execution.job_id.clone(),
            state: execution.state,
            strategy: execution.definition.strategy,
            current_step: execution.current_step,
            current_step_name: execution.current_step_name().map(str::to_string),
            total_steps: execution.total_steps(),
            progress_percent: execution.progress_percent(),
            completed_steps: execution
                .definition
                .steps
                .iter()
                .filter(|s| execution.context.step_data.contains_key(&s.name))
                .map(|s| s.name.clone())
                .collect(),
            skipped_steps: execution.context.skipped_steps.iter().cloned().collect(),
            rollback_count: execution.rollback_count,
            metrics: execution.metrics.clone(),
            last_error: execution.last_error.as_ref().map(ToString::to_string),
            created_at: execution.created_at,
            started_at: execution.started_at,
            finished_at: execution.finished_at,
        }
    }
}
