//! # Job Status Sink
//!
//! Narrow write-only interface to the persisted job store owned by the
//! surrounding system. The core reports status transitions and progress; it
//! never reads the store back.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::OrchestratorError;
use crate::state_machine::WorkflowState;

/// Externally visible job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

impl From<WorkflowState> for JobStatus {
    fn from(state: WorkflowState) -> Self {
        match state {
            WorkflowState::Initialized => JobStatus::Queued,
            WorkflowState::Running => JobStatus::Processing,
            WorkflowState::Paused => JobStatus::Paused,
            WorkflowState::Completed => JobStatus::Completed,
            WorkflowState::Failed => JobStatus::Failed,
            WorkflowState::Cancelled => JobStatus::Cancelled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Stable code plus human readable message for a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<&OrchestratorError> for ErrorInfo {
    fn from(error: &OrchestratorError) -> Self {
        Self::new(error.error_code(), error.to_string())
    }
}

#[async_trait]
pub trait JobStatusSink: Send + Sync {
    async fn record_status(&self, job_id: &str, status: JobStatus, error: Option<&ErrorInfo>);

    async fn record_progress(&self, job_id: &str, percent: f64, current_step: Option<&str>);
}

/// Sink that only writes tracing records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusSink;

#[async_trait]
impl JobStatusSink for TracingStatusSink {
    async fn record_status(&self, job_id: &str, status: JobStatus, error: Option<&ErrorInfo>) {
        tracing::info!(
            job_id = job_id,
            status = %status,
            error_code = error.map(|e| e.code.as_str()),
            error_message = error.map(|e| e.message.as_str()),
            "📝 Job status recorded"
        );
    }

    async fn record_progress(&self, job_id: &str, percent: f64, current_step: Option<&str>) {
        tracing::debug!(
            job_id = job_id,
            percent = percent,
            current_step = current_step,
            "Job progress recorded"
        );
    }
}

/// One recorded status write
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRecord {
    pub status: JobStatus,
    pub error: Option<ErrorInfo>,
}

/// One recorded progress write
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    pub percent: f64,
    pub current_step: Option<String>,
}

/// Keeps every write in memory; used by tests and embedded deployments
#[derive(Debug, Default)]
pub struct InMemoryStatusSink {
    statuses: DashMap<String, Vec<StatusRecord>>,
    progress: DashMap<String, Vec<ProgressRecord>>,
}

impl InMemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statuses(&self, job_id: &str) -> Vec<StatusRecord> {
        self.statuses
            .get(job_id)
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn latest_status(&self, job_id: &str) -> Option<JobStatus> {
        self.statuses
            .get(job_id)
            .and_then(|records| records.last().map(|r| r.status))
    }

    pub fn progress(&self, job_id: &str) -> Vec<ProgressRecord> {
        self.progress
            .get(job_id)
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStatusSink for InMemoryStatusSink {
    async fn record_status(&self, job_id: &str, status: JobStatus, error: Option<&ErrorInfo>) {
        self.statuses
            .entry(job_id.to_string())
            .or_default()
            .push(StatusRecord {
                status,
                error: error.cloned(),
            });
    }

    async fn record_progress(&self, job_id: &str, percent: f64, current_step: Option<&str>) {
        self.progress
            .entry(job_id.to_string())
            .or_default()
            .push(ProgressRecord {
                percent,
                current_step: current_step.map(str::to_string),
            });
    }
}
