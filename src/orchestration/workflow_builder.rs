//! # Workflow Templates
//!
//! One workflow template per processing strategy. Step services come from
//! `workflow.services`, retry behaviour from the configured default policy.
//!
//! | Strategy | Shape |
//! |---|---|
//! | `quick_sync` | render → upload |
//! | `balanced_async` | validation → download → preprocess? → render → encode → upload |
//! | `resource_intensive` | balanced + composition, longer render/encode timeouts |
//! | `distributed` | validation → N parallel downloads → N parallel segment renders → compose → encode → upload |
//!
//! Every non-inline template carries a cleanup step. Distributed renders,
//! composition and encoding roll back to the `validation` checkpoint.

use serde_json::json;

use crate::config::WorkflowConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    JobAnalysis, ProcessingStrategy, RetryPolicy, RollbackStrategy, StepCondition, StepType,
    VideoJobRequest, WorkflowDefinition, WorkflowStep,
};

pub const VALIDATION_STEP: &str = "validation";

#[derive(Debug, Clone, Default)]
pub struct WorkflowBuilder {
    config: WorkflowConfig,
    retry: RetryPolicy,
}

impl WorkflowBuilder {
    pub fn new(config: WorkflowConfig, retry: RetryPolicy) -> Self {
        Self { config, retry }
    }

    fn step(&self, name: impl Into<String>, step_type: StepType) -> WorkflowStep {
        WorkflowStep::new(name, step_type, self.config.services.service_for(step_type))
            .with_timeout_ms(self.config.step_timeout_ms)
            .with_retry_policy(self.retry.clone())
    }

    /// Timeout for render and encode steps: twice the estimate, at least
    /// the configured step timeout, never past the workflow deadline
    fn heavy_timeout_ms(&self, analysis: &JobAnalysis, factor: f64) -> u64 {
        let estimate_ms = (analysis.estimated_duration_secs.max(0.0) * 1000.0 * factor) as u64;
        estimate_ms
            .max(self.config.step_timeout_ms)
            .min(self.config.workflow_timeout_ms)
    }

    fn checkpoint() -> RollbackStrategy {
        RollbackStrategy::Checkpoint {
            step: VALIDATION_STEP.to_string(),
        }
    }

    pub fn build(
        &self,
        request: &VideoJobRequest,
        analysis: &JobAnalysis,
    ) -> Result<WorkflowDefinition> {
        let definition = match analysis.strategy {
            ProcessingStrategy::QuickSync => self.quick_sync(request, analysis),
            ProcessingStrategy::BalancedAsync => self.balanced(request, analysis, false),
            ProcessingStrategy::ResourceIntensive => self.balanced(request, analysis, true),
            ProcessingStrategy::Distributed => self.distributed(request, analysis),
        }
        .with_timeout_ms(self.config.workflow_timeout_ms)
        .with_max_rollbacks(self.config.max_rollbacks);

        definition.validate().map_err(|err| {
            OrchestratorError::Internal(format!(
                "template for {} produced an invalid workflow: {err}",
                analysis.strategy
            ))
        })?;
        Ok(definition)
    }

    fn output_parameters(request: &VideoJobRequest) -> serde_json::Value {
        json!({
            "format": request.output_format,
            "width": request.width,
            "height": request.height,
        })
    }

    fn cleanup(&self, request: &VideoJobRequest) -> WorkflowStep {
        self.step("cleanup", StepType::Cleanup)
            .with_retry_policy(RetryPolicy::no_retry())
            .with_parameters(json!({ "job_id": request.id }))
    }

    fn quick_sync(&self, request: &VideoJobRequest, analysis: &JobAnalysis) -> WorkflowDefinition {
        WorkflowDefinition::new("quick_sync", ProcessingStrategy::QuickSync)
            .with_step(
                self.step("render", StepType::Rendering)
                    .with_timeout_ms(self.heavy_timeout_ms(analysis, 2.0))
                    .with_parameters(Self::output_parameters(request)),
            )
            .with_step(self.step("upload", StepType::Upload).depends_on("render"))
    }

    fn balanced(
        &self,
        request: &VideoJobRequest,
        analysis: &JobAnalysis,
        intensive: bool,
    ) -> WorkflowDefinition {
        let (name, strategy, factor) = if intensive {
            ("resource_intensive", ProcessingStrategy::ResourceIntensive, 3.0)
        } else {
            ("balanced_async", ProcessingStrategy::BalancedAsync, 2.0)
        };
        let heavy_timeout = self.heavy_timeout_ms(analysis, factor);

        let mut definition = WorkflowDefinition::new(name, strategy)
            .with_step(
                self.step(VALIDATION_STEP, StepType::Validation)
                    .with_retry_policy(RetryPolicy::no_retry()),
            )
            .with_step(
                self.step("download_assets", StepType::AssetDownload)
                    .depends_on(VALIDATION_STEP)
                    .with_parameters(json!({ "elements": request.elements.len() })),
            )
            .with_step(
                self.step("preprocess", StepType::Preprocessing)
                    .depends_on("download_assets")
                    .when(StepCondition::HasEffects),
            )
            .with_step(
                self.step("render", StepType::Rendering)
                    .depends_on("download_assets")
                    .with_timeout_ms(heavy_timeout)
                    .with_rollback(Self::checkpoint())
                    .with_parameters(Self::output_parameters(request)),
            );

        let mut encode_after = "render";
        if intensive {
            definition = definition.with_step(
                self.step("compose", StepType::Composition)
                    .depends_on("render")
                    .with_timeout_ms(heavy_timeout)
                    .with_rollback(Self::checkpoint()),
            );
            encode_after = "compose";
        }

        definition
            .with_step(
                self.step("encode", StepType::Encoding)
                    .depends_on(encode_after)
                    .with_timeout_ms(heavy_timeout)
                    .with_rollback(Self::checkpoint())
                    .with_parameters(Self::output_parameters(request)),
            )
            .with_step(self.step("upload", StepType::Upload).depends_on("encode"))
            .with_cleanup(self.cleanup(request))
    }

    fn distributed(&self, request: &VideoJobRequest, analysis: &JobAnalysis) -> WorkflowDefinition {
        let segments = self.config.distributed_segments.max(1);
        let heavy_timeout = self.heavy_timeout_ms(analysis, 1.0);
        let element_count = request.elements.len() as u32;

        let mut definition = WorkflowDefinition::new("distributed", ProcessingStrategy::Distributed)
            .with_step(
                self.step(VALIDATION_STEP, StepType::Validation)
                    .with_retry_policy(RetryPolicy::no_retry()),
            );

        for segment in 0..segments {
            // Elements are dealt round-robin over the download shards
            let shard_size = element_count / segments + u32::from(segment < element_count % segments);
            definition = definition.with_step(
                self.step(format!("download_{segment}"), StepType::AssetDownload)
                    .depends_on(VALIDATION_STEP)
                    .in_parallel()
                    .with_rollback(RollbackStrategy::Graceful)
                    .with_parameters(json!({
                        "shard": segment,
                        "shards": segments,
                        "elements": shard_size,
                    })),
            );
        }

        definition = definition.with_step(
            self.step("preprocess", StepType::Preprocessing)
                .depends_on(VALIDATION_STEP)
                .when(StepCondition::HasEffects),
        );

        for segment in 0..segments {
            definition = definition.with_step(
                self.step(format!("render_{segment}"), StepType::Rendering)
                    .depends_on(VALIDATION_STEP)
                    .in_parallel()
                    .with_timeout_ms(heavy_timeout)
                    .with_rollback(Self::checkpoint())
                    .with_parameters(json!({
                        "segment": segment,
                        "segments": segments,
                        "format": request.output_format,
                        "width": request.width,
                        "height": request.height,
                    })),
            );
        }

        definition
            .with_step(
                self.step("compose", StepType::Composition)
                    .depends_on(VALIDATION_STEP)
                    .with_timeout_ms(heavy_timeout)
                    .with_rollback(Self::checkpoint())
                    .with_parameters(json!({ "segments": segments })),
            )
            .with_step(
                self.step("encode", StepType::Encoding)
                    .depends_on("compose")
                    .with_timeout_ms(heavy_timeout)
                    .with_rollback(Self::checkpoint())
                    .with_parameters(Self::output_parameters(request)),
            )
            .with_step(self.step("upload", StepType::Upload).depends_on("encode"))
            .with_cleanup(self.cleanup(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;
    use crate::models::{EffectType, ElementType, OutputFormat, VideoElement};
    use crate::orchestration::JobAnalyzer;

    fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new(WorkflowConfig::default(), RetryPolicy::default())
    }

    fn analysis_for(request: &VideoJobRequest, strategy: ProcessingStrategy) -> JobAnalysis {
        let mut analysis = JobAnalyzer::new(AnalyzerConfig::default()).analyze(request);
        analysis.strategy = strategy;
        analysis
    }

    fn request() -> VideoJobRequest {
        VideoJobRequest::new("job", OutputFormat::Mp4, 1920, 1080)
            .with_element(
                VideoElement::new("a", ElementType::Video)
                    .with_source("s3://a.mp4")
                    .with_timing(0.0, 30.0)
                    .with_effect(EffectType::Upscale),
            )
            .with_element(VideoElement::new("b", ElementType::Audio).with_source("s3://b.mp3"))
    }

    #[test]
    fn test_quick_sync_template() {
        let request = request();
        let definition = builder()
            .build(&request, &analysis_for(&request, ProcessingStrategy::QuickSync))
            .unwrap();
        let names: Vec<_> = definition.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["render", "upload"]);
        assert!(definition.cleanup_step.is_none());
    }

    #[test]
    fn test_resource_intensive_adds_composition() {
        let request = request();
        let definition = builder()
            .build(&request, &analysis_for(&request, ProcessingStrategy::ResourceIntensive))
            .unwrap();
        assert!(definition.step_index("compose").is_some());
        assert_eq!(definition.steps[definition.step_index("upload").unwrap()].service, "storage-service");
        assert!(definition.cleanup_step.is_some());
    }

    #[test]
    fn test_distributed_template_has_parallel_groups_and_checkpoints() {
        let request = request();
        let definition = builder()
            .build(&request, &analysis_for(&request, ProcessingStrategy::Distributed))
            .unwrap();

        let groups = definition.step_groups();
        // validation, downloads, preprocess, renders, compose, encode, upload
        assert_eq!(groups.len(), 7);
        assert_eq!(groups[1].len(), 4);
        assert_eq!(groups[3].len(), 4);

        let render = &definition.steps[definition.step_index("render_2").unwrap()];
        assert_eq!(
            render.rollback_strategy,
            RollbackStrategy::Checkpoint {
                step: VALIDATION_STEP.to_string()
            }
        );
        assert_eq!(render.parameters["segment"], 2);

        let shards: u64 = (0..4)
            .map(|i| {
                definition.steps[definition.step_index(&format!("download_{i}")).unwrap()]
                    .parameters["elements"]
                    .as_u64()
                    .unwrap()
            })
            .sum();
        assert_eq!(shards, 2);
    }
}
