//! # Workflow Model
//!
//! Immutable workflow templates (`WorkflowDefinition`) and the mutable
//! per-job instances (`WorkflowExecution`) driven by the workflow engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use uuid::Uuid;

use super::allocation::AllocatedResources;
use super::analysis::{JobAnalysis, JobComplexity, ProcessingStrategy};
use super::job_request::VideoJobRequest;
use crate::error::{FailureClass, OrchestratorError, Result, WorkflowError};
use crate::state_machine::WorkflowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Validation,
    AssetDownload,
    Preprocessing,
    Rendering,
    Composition,
    Encoding,
    Upload,
    Cleanup,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepType::Validation => "validation",
            StepType::AssetDownload => "asset_download",
            StepType::Preprocessing => "preprocessing",
            StepType::Rendering => "rendering",
            StepType::Composition => "composition",
            StepType::Encoding => "encoding",
            StepType::Upload => "upload",
            StepType::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

/// Predicate deciding whether a step runs, evaluated against the workflow
/// context right before the step starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum StepCondition {
    Always,
    StepCompleted(String),
    StepSkipped(String),
    ElementCountAtLeast(usize),
    HasEffects,
    HasGpuEffects,
    ComplexityAtLeast(JobComplexity),
    MetadataEquals { key: String, value: serde_json::Value },
    Not(Box<StepCondition>),
    All(Vec<StepCondition>),
    Any(Vec<StepCondition>),
}

impl Default for StepCondition {
    fn default() -> Self {
        StepCondition::Always
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// Maximum jitter as a fraction of the computed delay (0.0 - 1.0)
    #[serde(default)]
    pub jitter: f64,
    /// Failure classes eligible for retry; empty means every transient class
    #[serde(default)]
    pub retry_conditions: Vec<FailureClass>,
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn should_retry(&self, class: FailureClass) -> bool {
        if self.retry_conditions.is_empty() {
            class.is_transient()
        } else {
            self.retry_conditions.contains(&class)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 250,
            backoff_multiplier: 2.0,
            max_backoff_ms: 10_000,
            jitter: 0.1,
            retry_conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackStrategy {
    /// Abort now and run cleanup
    Immediate,
    /// Let running parallel siblings finish, then abort
    Graceful,
    /// Resume execution from the named earlier step
    Checkpoint { step: String },
}

impl Default for RollbackStrategy {
    fn default() -> Self {
        RollbackStrategy::Immediate
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub step_type: StepType,
    /// Logical service the step is dispatched to
    pub service: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub rollback_strategy: RollbackStrategy,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub condition: StepCondition,
    /// Executor parameters; schema is fixed per `step_type`
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl WorkflowStep {
    pub fn new(name: impl Into<String>, step_type: StepType, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_type,
            service: service.into(),
            timeout_ms: 30_000,
            retry_policy: RetryPolicy::default(),
            rollback_strategy: RollbackStrategy::Immediate,
            depends_on: Vec::new(),
            parallel: false,
            condition: StepCondition::Always,
            parameters: serde_json::Value::Null,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_rollback(mut self, strategy: RollbackStrategy) -> Self {
        self.rollback_strategy = strategy;
        self
    }

    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn in_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn when(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Immutable workflow template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub strategy: ProcessingStrategy,
    pub steps: Vec<WorkflowStep>,
    /// Whole-workflow deadline, independent of step timeouts
    pub timeout_ms: u64,
    pub max_rollbacks: u32,
    /// Best-effort step run when the workflow aborts
    #[serde(default)]
    pub cleanup_step: Option<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, strategy: ProcessingStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            steps: Vec::new(),
            timeout_ms: 30 * 60 * 1000,
            max_rollbacks: 3,
            cleanup_step: None,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_cleanup(mut self, step: WorkflowStep) -> Self {
        self.cleanup_step = Some(step);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_rollbacks(mut self, max_rollbacks: u32) -> Self {
        self.max_rollbacks = max_rollbacks;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Consecutive `parallel` steps form one group joined by a barrier;
    /// every other step is a group of its own.
    pub fn step_groups(&self) -> Vec<Range<usize>> {
        let mut groups = Vec::new();
        let mut index = 0;
        while index < self.steps.len() {
            let start = index;
            if self.steps[index].parallel {
                while index < self.steps.len() && self.steps[index].parallel {
                    index += 1;
                }
            } else {
                index += 1;
            }
            groups.push(start..index);
        }
        groups
    }

    /// Group that contains `index`, if any
    pub fn group_at(&self, index: usize) -> Option<Range<usize>> {
        self.step_groups().into_iter().find(|g| g.contains(&index))
    }

    /// Index execution resumes from when rolling back to `step`. A parallel
    /// step can only be re-entered at the start of its group.
    pub fn checkpoint_index(&self, step: &str) -> Option<usize> {
        let index = self.step_index(step)?;
        Some(self.group_at(index).map_or(index, |group| group.start))
    }

    /// Structural checks: unique names, dependencies pointing backwards,
    /// checkpoint targets at or before the step that names them.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(OrchestratorError::validation(
                "workflow.steps",
                format!("workflow '{}' has no steps", self.name),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            if !seen.insert(step.name.as_str()) {
                return Err(OrchestratorError::validation(
                    "workflow.steps",
                    format!("duplicate step name '{}'", step.name),
                ));
            }
            if step.timeout_ms == 0 {
                return Err(OrchestratorError::validation(
                    format!("workflow.steps.{}.timeout_ms", step.name),
                    "step timeout must be greater than zero",
                ));
            }
            for dependency in &step.depends_on {
                match self.step_index(dependency) {
                    Some(dep_index) if dep_index < index => {}
                    Some(_) => {
                        return Err(OrchestratorError::validation(
                            format!("workflow.steps.{}.depends_on", step.name),
                            format!("dependency '{dependency}' does not precede the step"),
                        ))
                    }
                    None => {
                        return Err(OrchestratorError::validation(
                            format!("workflow.steps.{}.depends_on", step.name),
                            format!("unknown dependency '{dependency}'"),
                        ))
                    }
                }
            }
            if let RollbackStrategy::Checkpoint { step: target } = &step.rollback_strategy {
                match self.step_index(target) {
                    Some(target_index) if target_index <= index => {}
                    _ => {
                        return Err(OrchestratorError::validation(
                            format!("workflow.steps.{}.rollback_strategy", step.name),
                            format!("checkpoint '{target}' must name this or an earlier step"),
                        ))
                    }
                }
            }
        }

        // Parallel siblings must not depend on each other
        for group in self.step_groups() {
            if group.len() < 2 {
                continue;
            }
            let names: HashSet<&str> = self.steps[group.clone()]
                .iter()
                .map(|s| s.name.as_str())
                .collect();
            for step in &self.steps[group] {
                if step.depends_on.iter().any(|d| names.contains(d.as_str())) {
                    return Err(OrchestratorError::validation(
                        format!("workflow.steps.{}.depends_on", step.name),
                        "parallel steps cannot depend on siblings in the same group",
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Typed output of a step, one fixed schema per step kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutput {
    Validation {
        elements_checked: usize,
        warnings: Vec<String>,
    },
    AssetDownload {
        assets: usize,
        bytes: u64,
        cache_hits: usize,
    },
    Preprocessing {
        normalized_elements: usize,
    },
    Rendering {
        frames: u64,
        segment: Option<u32>,
    },
    Composition {
        tracks: u32,
        duration_secs: f64,
    },
    Encoding {
        output_path: String,
        bitrate_kbps: u32,
        size_bytes: u64,
    },
    Upload {
        result_url: String,
    },
    Cleanup {
        removed_artifacts: usize,
    },
}

impl StepOutput {
    pub fn step_type(&self) -> StepType {
        match self {
            StepOutput::Validation { .. } => StepType::Validation,
            StepOutput::AssetDownload { .. } => StepType::AssetDownload,
            StepOutput::Preprocessing { .. } => StepType::Preprocessing,
            StepOutput::Rendering { .. } => StepType::Rendering,
            StepOutput::Composition { .. } => StepType::Composition,
            StepOutput::Encoding { .. } => StepType::Encoding,
            StepOutput::Upload { .. } => StepType::Upload,
            StepOutput::Cleanup { .. } => StepType::Cleanup,
        }
    }

    pub fn result_url(&self) -> Option<&str> {
        match self {
            StepOutput::Upload { result_url } => Some(result_url),
            _ => None,
        }
    }
}

/// Data shared between the steps of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub request: VideoJobRequest,
    pub analysis: JobAnalysis,
    pub allocation: AllocatedResources,
    pub step_data: BTreeMap<String, StepOutput>,
    pub skipped_steps: BTreeSet<String>,
}

impl WorkflowContext {
    pub fn new(
        request: VideoJobRequest,
        analysis: JobAnalysis,
        allocation: AllocatedResources,
    ) -> Self {
        Self {
            request,
            analysis,
            allocation,
            step_data: BTreeMap::new(),
            skipped_steps: BTreeSet::new(),
        }
    }

    pub fn output(&self, step_name: &str) -> Option<&StepOutput> {
        self.step_data.get(step_name)
    }

    /// Last upload URL produced by any step
    pub fn result_url(&self) -> Option<String> {
        self.step_data
            .values()
            .filter_map(StepOutput::result_url)
            .last()
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub steps_completed: u32,
    pub steps_skipped: u32,
    /// Steps that failed after their retry policy was exhausted
    pub steps_failed: u32,
    pub total_attempts: u32,
    pub retries: u32,
    pub rollbacks: u32,
    pub total_step_duration_ms: u64,
    pub average_step_duration_ms: f64,
    /// Largest share of any pool dimension held by this execution
    pub resource_utilization: f64,
}

impl WorkflowMetrics {
    pub fn record_step(&mut self, duration: Duration, attempts: u32) {
        self.steps_completed += 1;
        self.total_attempts += attempts;
        self.retries += attempts.saturating_sub(1);
        self.total_step_duration_ms += duration.as_millis() as u64;
        self.average_step_duration_ms =
            self.total_step_duration_ms as f64 / f64::from(self.steps_completed);
    }
}

/// Live instance of a workflow for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub job_id: String,
    pub definition: WorkflowDefinition,
    pub state: WorkflowState,
    pub current_step: usize,
    pub context: WorkflowContext,
    pub metrics: WorkflowMetrics,
    /// Attempts per step since the last rollback
    pub step_attempts: HashMap<String, u32>,
    pub rollback_count: u32,
    pub last_error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(definition: WorkflowDefinition, context: WorkflowContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: context.request.id.clone(),
            definition,
            state: WorkflowState::Initialized,
            current_step: 0,
            context,
            metrics: WorkflowMetrics::default(),
            step_attempts: HashMap::new(),
            rollback_count: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn total_steps(&self) -> usize {
        self.definition.steps.len()
    }

    pub fn current_step_name(&self) -> Option<&str> {
        self.definition
            .steps
            .get(self.current_step)
            .map(|s| s.name.as_str())
    }

    pub fn progress_percent(&self) -> f64 {
        let total = self.total_steps();
        if self.state == WorkflowState::Completed {
            return 100.0;
        }
        if total == 0 {
            return 0.0;
        }
        (self.current_step.min(total) as f64 / total as f64) * 100.0
    }
}
