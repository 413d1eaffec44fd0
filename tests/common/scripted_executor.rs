//! Step executor driven by a per-step script

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;

use reelflow_core::error::StepError;
use reelflow_core::models::{ServiceInstance, StepOutput, StepType};
use reelflow_core::orchestration::{StepExecutor, StepRequest};

/// Succeeds with a well-formed output unless a step was scripted to fail.
/// Scripted failures are consumed one per call.
#[derive(Default)]
pub struct ScriptedExecutor {
    failures: DashMap<String, (u32, StepError)>,
    delays: DashMap<String, Duration>,
    default_delay: Duration,
    calls: DashMap<String, u32>,
    log: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps this long before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Fail the next `times` calls of `step` with a transient error
    pub fn fail_step(self, step: &str, times: u32) -> Self {
        self.fail_step_with(step, times, StepError::transient("scripted failure"))
    }

    pub fn fail_step_with(self, step: &str, times: u32, error: StepError) -> Self {
        self.failures.insert(step.to_string(), (times, error));
        self
    }

    pub fn delay_step(self, step: &str, delay: Duration) -> Self {
        self.delays.insert(step.to_string(), delay);
        self
    }

    pub fn calls(&self, step: &str) -> u32 {
        self.calls.get(step).map(|c| *c).unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|c| *c.value()).sum()
    }

    /// Step names in call order
    pub fn call_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn scripted_failure(&self, step: &str) -> Option<StepError> {
        let mut entry = self.failures.get_mut(step)?;
        let (remaining, error) = entry.value_mut();
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(error.clone())
    }
}

pub fn output_for(request: &StepRequest) -> StepOutput {
    match request.step_type {
        StepType::Validation => StepOutput::Validation {
            elements_checked: request.request.elements.len(),
            warnings: vec![],
        },
        StepType::AssetDownload => StepOutput::AssetDownload {
            assets: request.request.elements.len(),
            bytes: 1_048_576,
            cache_hits: 0,
        },
        StepType::Preprocessing => StepOutput::Preprocessing {
            normalized_elements: request.request.elements.len(),
        },
        StepType::Rendering => StepOutput::Rendering {
            frames: 240,
            segment: request
                .parameters
                .get("segment")
                .and_then(|s| s.as_u64())
                .map(|s| s as u32),
        },
        StepType::Composition => StepOutput::Composition {
            tracks: 2,
            duration_secs: request.request.timeline_end(),
        },
        StepType::Encoding => StepOutput::Encoding {
            output_path: format!("/scratch/{}.mp4", request.job_id),
            bitrate_kbps: 8_000,
            size_bytes: 52_428_800,
        },
        StepType::Upload => StepOutput::Upload {
            result_url: format!("https://cdn.example.com/{}.mp4", request.job_id),
        },
        StepType::Cleanup => StepOutput::Cleanup {
            removed_artifacts: 3,
        },
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _instance: &ServiceInstance,
        request: StepRequest,
    ) -> Result<StepOutput, StepError> {
        *self.calls.entry(request.step_name.clone()).or_insert(0) += 1;
        self.log.lock().push(request.step_name.clone());

        let delay = self
            .delays
            .get(&request.step_name)
            .map(|d| *d)
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.scripted_failure(&request.step_name) {
            Some(error) => Err(error),
            None => Ok(output_for(&request)),
        }
    }
}
