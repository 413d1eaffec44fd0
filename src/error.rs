//! # Orchestrator Errors
//!
//! Error taxonomy shared by every component of the orchestration core. Each
//! variant maps onto a stable, user-visible error code so a `failed`
//! orchestration result can always be reported without leaking internals.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::allocation::ResourceType;
use crate::state_machine::StateMachineError;

/// Allocation refused because a resource dimension lacks capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("Insufficient {resource_type} capacity: requested {requested:.2}, available {available:.2}")]
pub struct ResourceError {
    pub resource_type: ResourceType,
    pub requested: f64,
    pub available: f64,
}

impl ResourceError {
    pub fn new(resource_type: ResourceType, requested: f64, available: f64) -> Self {
        Self {
            resource_type,
            requested,
            available,
        }
    }
}

/// Classification of a step failure, used by retry policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The call did not answer within its deadline
    Timeout,
    /// Generic transient failure reported by the backing service
    Transient,
    /// 5xx-equivalent backing service error
    ServiceError,
    /// Connection level failure
    Network,
    /// No healthy instance could take the call
    NoCapacity,
    /// The circuit breaker rejected the call without invoking it
    CircuitOpen,
    /// Will never succeed if repeated
    Permanent,
    /// The call was abandoned because the workflow was cancelled
    Cancelled,
}

impl FailureClass {
    /// Classes retried when a policy does not list its own conditions
    pub const DEFAULT_RETRYABLE: [FailureClass; 6] = [
        FailureClass::Timeout,
        FailureClass::Transient,
        FailureClass::ServiceError,
        FailureClass::Network,
        FailureClass::NoCapacity,
        FailureClass::CircuitOpen,
    ];

    pub fn is_transient(&self) -> bool {
        Self::DEFAULT_RETRYABLE.contains(self)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureClass::Timeout => "timeout",
            FailureClass::Transient => "transient",
            FailureClass::ServiceError => "service_error",
            FailureClass::Network => "network",
            FailureClass::NoCapacity => "no_capacity",
            FailureClass::CircuitOpen => "circuit_open",
            FailureClass::Permanent => "permanent",
            FailureClass::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Failure returned by a backing processing-step executor or by the call
/// plumbing around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum StepError {
    #[error("Step call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Transient step failure: {0}")]
    Transient(String),

    #[error("Backing service error ({status}): {message}")]
    ServiceError { status: u16, message: String },

    #[error("Network failure: {0}")]
    Network(String),

    #[error("No healthy instance available for service {service}")]
    NoCapacity { service: String },

    #[error("Service {service} unavailable: circuit breaker is open")]
    CircuitOpen { service: String },

    #[error("Permanent step failure: {0}")]
    Permanent(String),

    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn class(&self) -> FailureClass {
        match self {
            StepError::Timeout { .. } => FailureClass::Timeout,
            StepError::Transient(_) => FailureClass::Transient,
            StepError::ServiceError { .. } => FailureClass::ServiceError,
            StepError::Network(_) => FailureClass::Network,
            StepError::NoCapacity { .. } => FailureClass::NoCapacity,
            StepError::CircuitOpen { .. } => FailureClass::CircuitOpen,
            StepError::Permanent(_) => FailureClass::Permanent,
            StepError::Cancelled => FailureClass::Cancelled,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StepError::Permanent(message.into())
    }
}

/// A workflow step failed after its retry policy was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("Step '{step_name}' failed after {attempts} attempt(s) [{class}]: {message}")]
pub struct WorkflowError {
    pub step_name: String,
    pub class: FailureClass,
    pub message: String,
    pub retryable: bool,
    pub attempts: u32,
}

impl WorkflowError {
    pub fn from_step_error(step_name: impl Into<String>, error: &StepError, attempts: u32) -> Self {
        let class = error.class();
        Self {
            step_name: step_name.into(),
            class,
            message: error.to_string(),
            retryable: class.is_transient(),
            attempts,
        }
    }

    /// Whether the failure was the breaker refusing calls rather than a real
    /// step failure.
    pub fn is_service_unavailable(&self) -> bool {
        self.class == FailureClass::CircuitOpen
    }
}

/// Top level error type for the orchestration core
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error on '{field}': {message}")]
    Validation { field: String, message: String },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("Service unavailable: {service} ({reason})")]
    ServiceUnavailable { service: String, reason: String },

    #[error("No capacity for service {service}")]
    NoCapacity { service: String },

    #[error(transparent)]
    StateTransition(#[from] StateMachineError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal orchestrator error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable error code surfaced in failed orchestration results
    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation { .. } => "VALIDATION_ERROR",
            OrchestratorError::Resource(_) => "RESOURCE_EXHAUSTED",
            OrchestratorError::Workflow(err) if err.is_service_unavailable() => {
                "SERVICE_UNAVAILABLE"
            }
            OrchestratorError::Workflow(_) => "WORKFLOW_STEP_FAILED",
            OrchestratorError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            OrchestratorError::NoCapacity { .. } => "NO_CAPACITY",
            OrchestratorError::StateTransition(_) => "INVALID_STATE_TRANSITION",
            OrchestratorError::Configuration(_) => "CONFIGURATION_ERROR",
            OrchestratorError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a caller may reasonably resubmit the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Resource(_)
            | OrchestratorError::ServiceUnavailable { .. }
            | OrchestratorError::NoCapacity { .. } => true,
            OrchestratorError::Workflow(err) => err.retryable,
            _ => false,
        }
    }
}

impl From<config::ConfigError> for OrchestratorError {
    fn from(err: config::ConfigError) -> Self {
        OrchestratorError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
