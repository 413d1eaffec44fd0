//! # Step Executor Contract
//!
//! The video pipeline itself lives behind backing services. The engine
//! reaches them through [`StepExecutor`], one call per step attempt against
//! the instance the load balancer picked.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StepError;
use crate::models::{ServiceInstance, StepOutput, StepType, VideoJobRequest};

/// Everything a backing service needs to run one step attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub workflow_id: Uuid,
    pub job_id: String,
    pub allocation_id: Uuid,
    pub step_name: String,
    pub step_type: StepType,
    pub parameters: serde_json::Value,
    /// Outputs of the steps this one depends on
    pub inputs: Vec<(String, StepOutput)>,
    pub request: Arc<VideoJobRequest>,
    pub timeout: Duration,
    /// 1-based attempt number within the current retry sequence
    pub attempt: u32,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step attempt on `instance`. The output variant must match
    /// `request.step_type`.
    async fn execute(
        &self,
        instance: &ServiceInstance,
        request: StepRequest,
    ) -> Result<StepOutput, StepError>;
}

/// Whether a failure says something about the backing service's health.
/// Bad input and cancellation do not trip breakers.
pub fn counts_against_service(error: &StepError) -> bool {
    !matches!(error, StepError::Permanent(_) | StepError::Cancelled)
}

/// Reject outputs whose variant does not match the step that produced them
pub fn check_output(step_type: StepType, output: StepOutput) -> Result<StepOutput, StepError> {
    if output.step_type() == step_type {
        Ok(output)
    } else {
        Err(StepError::permanent(format!(
            "{step_type} step returned {} output",
            output.step_type()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_must_match_step_type() {
        let output = StepOutput::Upload {
            result_url: "https://cdn/x.mp4".to_string(),
        };
        assert!(check_output(StepType::Upload, output.clone()).is_ok());
        assert!(matches!(
            check_output(StepType::Encoding, output),
            Err(StepError::Permanent(_))
        ));
    }

    #[test]
    fn test_permanent_failures_do_not_count_against_service() {
        assert!(!counts_against_service(&StepError::permanent("bad input")));
        assert!(!counts_against_service(&StepError::Cancelled));
        assert!(counts_against_service(&StepError::transient("busy")));
        assert!(counts_against_service(&StepError::Timeout { timeout_ms: 5 }));
    }
}
