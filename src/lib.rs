#![allow(clippy::doc_markdown)] // Allow technical terms like GPU, TOML in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Reelflow Core
//!
//! Orchestration core for video-composition jobs.
//!
//! ## Overview
//!
//! The core consumes validated job requests and decides, per job, how to run
//! them: inline, queued, or as a multi-step distributed workflow. It reserves
//! compute, memory, storage, network and GPU capacity for each job, routes
//! every workflow step to a healthy backing service instance, retries and
//! rolls back failed steps, and feeds finished jobs into an analytics loop.
//!
//! The HTTP front door, the persisted job table, object storage and the
//! backing media services are collaborators behind narrow traits
//! ([`orchestration::StepExecutor`], [`orchestration::JobStatusSink`],
//! [`registry::HealthChecker`], [`analytics::HistorySink`]).
//!
//! ## Module Organization
//!
//! - [`models`] - job request, analysis, allocation, service and workflow data
//! - [`resources`] - resource pool tracker and allocator
//! - [`registry`] - service registry, load balancer, health monitor
//! - [`resilience`] - circuit breakers and retry executor
//! - [`state_machine`] - pure workflow transition table
//! - [`orchestration`] - analyzer, templates, workflow engine, master orchestrator
//! - [`analytics`] - job history, forecasts, bottlenecks, recommendations
//! - [`events`] - lifecycle event bus
//! - [`config`] - configuration tree and layered loader
//! - [`error`] - error taxonomy with stable codes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reelflow_core::config::OrchestratorConfig;
//! use reelflow_core::orchestration::{MasterOrchestrator, StepExecutor};
//! use reelflow_core::models::{ElementType, OutputFormat, VideoElement, VideoJobRequest};
//!
//! # async fn example(executor: Arc<dyn StepExecutor>) -> reelflow_core::Result<()> {
//! let orchestrator = MasterOrchestrator::builder(OrchestratorConfig::default())
//!     .with_executor(executor)
//!     .build()?;
//!
//! let request = VideoJobRequest::new("job-1", OutputFormat::Mp4, 1280, 720).with_element(
//!     VideoElement::new("intro", ElementType::Video)
//!         .with_source("s3://bucket/intro.mp4")
//!         .with_timing(0.0, 10.0),
//! );
//! let result = orchestrator.orchestrate(request).await;
//! println!("{} -> {}", result.job_id, result.status);
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod registry;
pub mod resilience;
pub mod resources;
pub mod state_machine;
pub mod validation;

pub use config::{ConfigManager, OrchestratorConfig};
pub use constants::{status_groups, system};
// Re-export constants events with different name to avoid conflict
pub use constants::events as system_events;
pub use error::{
    FailureClass, OrchestratorError, ResourceError, Result, StepError, WorkflowError,
};
pub use events::{EventPublisher, OrchestrationEvent};
pub use orchestration::{
    JobStatus, JobStatusSink, MasterOrchestrator, OrchestrationResult, OrchestrationStatus,
    StepExecutor, SystemHealthReport,
};
pub use state_machine::WorkflowState;
