//! # Job Analyzer
//!
//! Turns a validated request into a [`JobAnalysis`]: complexity score and
//! class, estimated runtime, resource requirements, priority and the
//! processing strategy. Analysis never fails. Requests that cannot be
//! measured (no elements, zero frame area, non-finite timing) are classified
//! as `enterprise`/`distributed` and flagged `Unanalyzable`; the allocator is
//! the real gatekeeper.

use chrono::Utc;
use std::collections::HashSet;
use tracing::debug;

use crate::config::AnalyzerConfig;
use crate::models::{
    ElementType, JobAnalysis, JobComplexity, JobPriority, OptimizationHint, ProcessingStrategy,
    ResourceRequirements, RiskFactor, VideoElement, VideoJobRequest,
};

/// Frame area of 1080p; larger outputs count as high resolution
const FULL_HD_PIXELS: f64 = 1920.0 * 1080.0;
/// Runtime assumed for requests that cannot be measured
const UNANALYZABLE_ESTIMATE_SECS: f64 = 3_600.0;
const MANY_ELEMENTS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct JobAnalyzer {
    config: AnalyzerConfig,
}

impl JobAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn analyze(&self, request: &VideoJobRequest) -> JobAnalysis {
        if !is_measurable(request) {
            debug!(job_id = %request.id, "Request not measurable, using conservative analysis");
            return self.conservative(request);
        }

        let source_secs = self.source_duration(request);
        let pixel_ratio = request.pixel_count() as f64 / self.config.pixels_per_score_point;
        let score = self.complexity_score(request, source_secs, pixel_ratio);
        let complexity = self.classify(score);
        let estimated = self.estimate_duration(request, pixel_ratio);
        let has_gpu_effects = request.has_gpu_effects();
        let strategy = self.select_strategy(complexity, estimated, source_secs, has_gpu_effects);
        let requirements =
            self.requirements(request, complexity, source_secs, pixel_ratio, has_gpu_effects);
        let priority = self.priority(request);
        let risk_factors = self.risk_factors(request, source_secs, estimated, &requirements);
        let optimization_hints = hints(request, strategy, &requirements, &risk_factors);

        debug!(
            job_id = %request.id,
            score = score,
            complexity = %complexity,
            strategy = %strategy,
            estimated_secs = estimated,
            "🔍 Job analyzed"
        );

        JobAnalysis {
            job_id: request.id.clone(),
            complexity_score: score,
            complexity,
            priority,
            strategy,
            estimated_duration_secs: estimated,
            source_duration_secs: source_secs,
            requirements,
            risk_factors,
            optimization_hints,
            analyzed_at: Utc::now(),
        }
    }

    fn element_duration(&self, element: &VideoElement) -> f64 {
        element
            .duration
            .unwrap_or(self.config.default_element_duration_secs)
    }

    /// Sum of element durations, undeclared lengths counted at the default
    pub fn source_duration(&self, request: &VideoJobRequest) -> f64 {
        request
            .elements
            .iter()
            .map(|e| self.element_duration(e))
            .sum()
    }

    pub fn complexity_score(
        &self,
        request: &VideoJobRequest,
        source_secs: f64,
        pixel_ratio: f64,
    ) -> f64 {
        let gpu_effects = request
            .elements
            .iter()
            .flat_map(|e| e.effects.iter())
            .filter(|effect| effect.effect_type.is_gpu_accelerated())
            .count();
        let other_effects = request.effect_count() - gpu_effects;

        request.elements.len() as f64 * self.config.score_per_element
            + source_secs / self.config.seconds_per_score_point
            + pixel_ratio
            + other_effects as f64 * self.config.score_per_effect
            + gpu_effects as f64 * self.config.score_per_gpu_effect
    }

    pub fn classify(&self, score: f64) -> JobComplexity {
        if score < self.config.simple_max_score {
            JobComplexity::Simple
        } else if score < self.config.moderate_max_score {
            JobComplexity::Moderate
        } else if score < self.config.complex_max_score {
            JobComplexity::Complex
        } else {
            JobComplexity::Enterprise
        }
    }

    /// Per element: download cost plus encode cost scaled by resolution,
    /// output format and effects
    pub fn estimate_duration(&self, request: &VideoJobRequest, pixel_ratio: f64) -> f64 {
        let resolution_multiplier = pixel_ratio.sqrt().max(0.25);
        let format_factor = request.output_format.encode_cost_factor();

        request
            .elements
            .iter()
            .map(|element| {
                let duration = self.element_duration(element);
                let download = match element.element_type {
                    ElementType::Video => 2.0 + 0.1 * duration,
                    ElementType::Audio => 1.0 + 0.02 * duration,
                    ElementType::Image => 0.5,
                    ElementType::Text | ElementType::Subtitle => 0.1,
                };
                let effect_factor = 1.0 + 0.25 * element.effects.len() as f64;
                let encode =
                    duration * 0.5 * resolution_multiplier * format_factor * effect_factor;
                download + encode
            })
            .sum()
    }

    pub fn select_strategy(
        &self,
        complexity: JobComplexity,
        estimated_secs: f64,
        source_secs: f64,
        has_gpu_effects: bool,
    ) -> ProcessingStrategy {
        if source_secs > self.config.distributed_source_secs && has_gpu_effects {
            return ProcessingStrategy::Distributed;
        }
        if estimated_secs < self.config.quick_threshold_secs
            && complexity <= JobComplexity::Moderate
        {
            return ProcessingStrategy::QuickSync;
        }
        match complexity {
            JobComplexity::Simple | JobComplexity::Moderate => ProcessingStrategy::BalancedAsync,
            JobComplexity::Complex => ProcessingStrategy::ResourceIntensive,
            JobComplexity::Enterprise => ProcessingStrategy::Distributed,
        }
    }

    /// Frame area and source length scale compute, memory and bandwidth by
    /// square root. Scratch storage holds decoded frames and intermediate
    /// renders, so it stays linear in length times frame area.
    fn requirements(
        &self,
        request: &VideoJobRequest,
        complexity: JobComplexity,
        source_secs: f64,
        pixel_ratio: f64,
        has_gpu_effects: bool,
    ) -> ResourceRequirements {
        let scale = pixel_ratio.max(0.0).sqrt() * (1.0 + source_secs / 60.0).sqrt();
        let media_elements = request
            .elements
            .iter()
            .filter(|e| e.element_type.requires_source())
            .count()
            .max(1) as f64;
        let gpu_required = complexity >= self.config.gpu_complexity || has_gpu_effects;
        let gpu_units = match (gpu_required, complexity) {
            (false, _) => 0.0,
            (true, JobComplexity::Enterprise) => 2.0,
            (true, _) => 1.0,
        };

        ResourceRequirements {
            cpu_cores: scale.ceil().clamp(1.0, self.config.max_cpu_cores),
            memory_gb: (2.0 * scale).clamp(1.0, self.config.max_memory_gb),
            storage_gb: 1.0 + source_secs * pixel_ratio.max(0.0) * 0.01,
            bandwidth_mbps: 10.0 * pixel_ratio.max(0.0).sqrt().max(1.0) * media_elements.sqrt(),
            gpu_required,
            gpu_units,
        }
    }

    fn priority(&self, request: &VideoJobRequest) -> JobPriority {
        if let Some(priority) = request.priority {
            return priority;
        }
        match request.timeout_seconds {
            Some(timeout) if timeout < self.config.tight_deadline_secs => JobPriority::High,
            _ => JobPriority::Normal,
        }
    }

    fn risk_factors(
        &self,
        request: &VideoJobRequest,
        source_secs: f64,
        estimated_secs: f64,
        requirements: &ResourceRequirements,
    ) -> Vec<RiskFactor> {
        let mut risks = Vec::new();
        if request.pixel_count() as f64 > FULL_HD_PIXELS {
            risks.push(RiskFactor::HighResolution);
        }
        if source_secs > self.config.distributed_source_secs {
            risks.push(RiskFactor::LongDuration);
        }
        if request.elements.len() > MANY_ELEMENTS {
            risks.push(RiskFactor::ManyElements);
        }
        if requirements.gpu_required {
            risks.push(RiskFactor::GpuDependency);
        }
        let remote = request.elements.iter().any(|e| {
            e.source
                .as_deref()
                .is_some_and(|s| s.starts_with("http://") || s.starts_with("https://"))
        });
        if remote {
            risks.push(RiskFactor::RemoteSources);
        }
        let tight = request.timeout_seconds.is_some_and(|timeout| {
            timeout < self.config.tight_deadline_secs || (timeout as f64) < estimated_secs
        });
        if tight {
            risks.push(RiskFactor::TightDeadline);
        }
        risks
    }

    fn conservative(&self, request: &VideoJobRequest) -> JobAnalysis {
        JobAnalysis {
            job_id: request.id.clone(),
            complexity_score: self.config.complex_max_score,
            complexity: JobComplexity::Enterprise,
            priority: self.priority(request),
            strategy: ProcessingStrategy::Distributed,
            estimated_duration_secs: UNANALYZABLE_ESTIMATE_SECS,
            source_duration_secs: 0.0,
            requirements: ResourceRequirements {
                cpu_cores: self.config.max_cpu_cores,
                memory_gb: self.config.max_memory_gb,
                storage_gb: 100.0,
                bandwidth_mbps: 100.0,
                gpu_required: false,
                gpu_units: 0.0,
            },
            risk_factors: vec![RiskFactor::Unanalyzable],
            optimization_hints: Vec::new(),
            analyzed_at: Utc::now(),
        }
    }
}

fn is_measurable(request: &VideoJobRequest) -> bool {
    !request.elements.is_empty()
        && request.pixel_count() > 0
        && request.elements.iter().all(|e| {
            e.start_time.is_finite()
                && e.start_time >= 0.0
                && e.duration.map_or(true, |d| d.is_finite() && d >= 0.0)
        })
}

fn hints(
    request: &VideoJobRequest,
    strategy: ProcessingStrategy,
    requirements: &ResourceRequirements,
    risks: &[RiskFactor],
) -> Vec<OptimizationHint> {
    let mut hints = Vec::new();
    let sources: Vec<&str> = request
        .elements
        .iter()
        .filter_map(|e| e.source.as_deref())
        .collect();

    if sources.len() > 3 {
        hints.push(OptimizationHint::ParallelizeDownloads);
    }
    let distinct: HashSet<&str> = sources.iter().copied().collect();
    if distinct.len() < sources.len() {
        hints.push(OptimizationHint::CacheSources);
    }
    if requirements.gpu_required {
        hints.push(OptimizationHint::UseGpuEncoding);
    }
    if strategy == ProcessingStrategy::Distributed {
        hints.push(OptimizationHint::SplitIntoSegments);
    }
    if risks.contains(&RiskFactor::HighResolution) {
        hints.push(OptimizationHint::PreferHardwareDecode);
    }
    let text_elements = request
        .elements
        .iter()
        .filter(|e| matches!(e.element_type, ElementType::Text | ElementType::Subtitle))
        .count();
    if text_elements >= 3 {
        hints.push(OptimizationHint::BatchTextRendering);
    }
    hints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EffectType, OutputFormat};

    fn analyzer() -> JobAnalyzer {
        JobAnalyzer::new(AnalyzerConfig::default())
    }

    #[test]
    fn test_single_short_clip_is_quick_sync() {
        let request = VideoJobRequest::new("job-1", OutputFormat::Mp4, 1280, 720).with_element(
            VideoElement::new("clip", ElementType::Video)
                .with_source("s3://media/clip.mp4")
                .with_timing(0.0, 10.0),
        );
        let analysis = analyzer().analyze(&request);

        assert_eq!(analysis.complexity, JobComplexity::Simple);
        assert_eq!(analysis.strategy, ProcessingStrategy::QuickSync);
        assert!(analysis.estimated_duration_secs < 30.0);
        assert!(!analysis.requirements.gpu_required);
        assert_eq!(analysis.requirements.amounts().gpu_units, 0.0);
        assert_eq!(analysis.priority, JobPriority::Normal);
    }

    #[test]
    fn test_long_4k_gpu_job_is_distributed() {
        let mut request = VideoJobRequest::new("job-2", OutputFormat::Mp4, 3840, 2160);
        for i in 0..8 {
            request = request.with_element(
                VideoElement::new(format!("clip-{i}"), ElementType::Video)
                    .with_source(format!("s3://media/clip-{i}.mp4"))
                    .with_timing(i as f64 * 50.0, 50.0)
                    .with_effect(EffectType::ColorGrade),
            );
        }
        let analysis = analyzer().analyze(&request);

        assert_eq!(analysis.strategy, ProcessingStrategy::Distributed);
        assert_eq!(analysis.complexity, JobComplexity::Enterprise);
        assert!((analysis.source_duration_secs - 400.0).abs() < 1e-9);
        assert!(analysis.requirements.gpu_required);
        assert!(analysis.has_risk(RiskFactor::HighResolution));
        assert!(analysis
            .optimization_hints
            .contains(&OptimizationHint::SplitIntoSegments));
    }

    #[test]
    fn test_complexity_thresholds() {
        let analyzer = analyzer();
        assert_eq!(analyzer.classify(9.99), JobComplexity::Simple);
        assert_eq!(analyzer.classify(10.0), JobComplexity::Moderate);
        assert_eq!(analyzer.classify(30.0), JobComplexity::Complex);
        assert_eq!(analyzer.classify(45.0), JobComplexity::Enterprise);
    }

    #[test]
    fn test_strategy_decision_table() {
        let analyzer = analyzer();
        assert_eq!(
            analyzer.select_strategy(JobComplexity::Moderate, 10.0, 60.0, false),
            ProcessingStrategy::QuickSync
        );
        assert_eq!(
            analyzer.select_strategy(JobComplexity::Moderate, 45.0, 60.0, false),
            ProcessingStrategy::BalancedAsync
        );
        assert_eq!(
            analyzer.select_strategy(JobComplexity::Complex, 10.0, 60.0, false),
            ProcessingStrategy::ResourceIntensive
        );
        assert_eq!(
            analyzer.select_strategy(JobComplexity::Simple, 10.0, 301.0, true),
            ProcessingStrategy::Distributed
        );
    }

    #[test]
    fn test_unmeasurable_request_degrades_conservatively() {
        let request = VideoJobRequest::new("job-3", OutputFormat::Webm, 0, 720);
        let analysis = analyzer().analyze(&request);
        assert_eq!(analysis.complexity, JobComplexity::Enterprise);
        assert_eq!(analysis.strategy, ProcessingStrategy::Distributed);
        assert!(analysis.has_risk(RiskFactor::Unanalyzable));

        let request = VideoJobRequest::new("job-4", OutputFormat::Mp4, 640, 360).with_element(
            VideoElement::new("bad", ElementType::Video).with_timing(f64::NAN, 3.0),
        );
        assert!(analyzer().analyze(&request).has_risk(RiskFactor::Unanalyzable));
    }

    #[test]
    fn test_tight_deadline_raises_priority() {
        let mut request = VideoJobRequest::new("job-5", OutputFormat::Gif, 640, 360)
            .with_element(VideoElement::new("t", ElementType::Text).with_timing(0.0, 2.0));
        request.timeout_seconds = Some(20);
        let analysis = analyzer().analyze(&request);
        assert_eq!(analysis.priority, JobPriority::High);
        assert!(analysis.has_risk(RiskFactor::TightDeadline));

        let request = request.with_priority(JobPriority::Low);
        assert_eq!(analyzer().analyze(&request).priority, JobPriority::Low);
    }

    #[test]
    fn test_requirements_grow_sublinearly() {
        let analyzer = analyzer();
        let short = VideoJobRequest::new("a", OutputFormat::Mp4, 1920, 1080).with_element(
            VideoElement::new("v", ElementType::Video)
                .with_source("s3://v.mp4")
                .with_timing(0.0, 60.0),
        );
        let long = VideoJobRequest::new("b", OutputFormat::Mp4, 1920, 1080).with_element(
            VideoElement::new("v", ElementType::Video)
                .with_source("s3://v.mp4")
                .with_timing(0.0, 240.0),
        );
        let short_mem = analyzer.analyze(&short).requirements.memory_gb;
        let long_mem = analyzer.analyze(&long).requirements.memory_gb;
        assert!(long_mem > short_mem);
        assert!(long_mem < short_mem * 4.0);

        // Scratch space tracks frame volume one to one
        let short_scratch = analyzer.analyze(&short).requirements.storage_gb - 1.0;
        let long_scratch = analyzer.analyze(&long).requirements.storage_gb - 1.0;
        assert!((long_scratch / short_scratch - 4.0).abs() < 1e-9);
    }
}
