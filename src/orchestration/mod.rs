//! # Orchestration Engine
//!
//! Decision-and-execution layer for video jobs.
//!
//! ## Core Components
//!
//! - **JobAnalyzer**: scores a request, classifies its complexity and picks a processing strategy
//! - **WorkflowBuilder**: turns an analysed request into a step definition per strategy
//! - **condition**: evaluates step conditions against the workflow context
//! - **StepExecutor**: contract for the backing services that perform a step
//! - **JobStatusSink**: write-only interface to the persisted job store
//! - **WorkflowEngine**: drives executions through the workflow state machine
//! - **health**: folds pool, breaker and registry state into one verdict
//! - **MasterOrchestrator**: façade running analyzer → allocator → engine
//!
//! ## Flow
//!
//! ```text
//! orchestrate(request)
//!   ├── validate_job_request
//!   ├── JobAnalyzer::analyze          → JobAnalysis
//!   ├── ResourceAllocator::allocate   → AllocatedResources | ResourceError
//!   ├── WorkflowBuilder::build        → WorkflowDefinition
//!   └── WorkflowEngine::run_inline | start
//! ```

pub mod condition;
pub mod health;
pub mod job_analyzer;
pub mod orchestrator;
pub mod status_sink;
pub mod step_executor;
pub mod types;
pub mod workflow_builder;
pub mod workflow_engine;

pub use health::{HealthIssue, HealthVerdict, SystemHealthReport};
pub use job_analyzer::JobAnalyzer;
pub use orchestrator::{MasterOrchestrator, OrchestratorBuilder};
pub use status_sink::{
    ErrorInfo, InMemoryStatusSink, JobStatus, JobStatusSink, ProgressRecord, StatusRecord,
    TracingStatusSink,
};
pub use step_executor::{StepExecutor, StepRequest};
pub use types::{JobStatusView, OrchestrationResult, OrchestrationStatus, WorkflowStatusView};
pub use workflow_builder::{WorkflowBuilder, VALIDATION_STEP};
pub use workflow_engine::{EngineComponents, ShutdownReport, WorkflowEngine};
