//! # Job History
//!
//! One [`JobSummary`] is emitted per job that reaches a final status. The
//! analytics engine keeps a bounded window of them and forwards each one to
//! every registered [`HistorySink`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::models::{JobComplexity, ProcessingStrategy, StepType};
use crate::orchestration::status_sink::JobStatus;

/// One step run as seen by the engine, after retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_name: String,
    pub step_type: StepType,
    pub service: String,
    pub attempts: u32,
    pub duration_ms: u64,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub workflow_id: Option<Uuid>,
    pub strategy: ProcessingStrategy,
    pub complexity: JobComplexity,
    pub status: JobStatus,
    pub estimated_duration_secs: f64,
    pub actual_duration_secs: f64,
    pub steps: Vec<StepRecord>,
    pub rollbacks: u32,
    pub error_code: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobSummary {
    /// Actual over estimated duration; `None` without a usable estimate
    pub fn estimate_ratio(&self) -> Option<f64> {
        (self.estimated_duration_secs > 0.0)
            .then(|| self.actual_duration_secs / self.estimated_duration_secs)
    }
}

/// Receives every finished job summary
pub trait HistorySink: Send + Sync {
    fn record(&self, summary: &JobSummary);
}

/// Writes each summary as one structured tracing record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHistorySink;

impl HistorySink for TracingHistorySink {
    fn record(&self, summary: &JobSummary) {
        tracing::info!(
            job_id = %summary.job_id,
            workflow_id = ?summary.workflow_id,
            strategy = %summary.strategy,
            status = %summary.status,
            duration_secs = summary.actual_duration_secs,
            steps = summary.steps.len(),
            rollbacks = summary.rollbacks,
            error_code = summary.error_code.as_deref(),
            "📈 Job summary"
        );
    }
}

/// Bounded in-memory history, oldest entries dropped first
#[derive(Debug)]
pub struct InMemoryHistorySink {
    capacity: usize,
    entries: Mutex<VecDeque<JobSummary>>,
}

impl InMemoryHistorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn find(&self, job_id: &str) -> Option<JobSummary> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|s| s.job_id == job_id)
            .cloned()
    }
}

impl HistorySink for InMemoryHistorySink {
    fn record(&self, summary: &JobSummary) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(summary.clone());
    }
}
