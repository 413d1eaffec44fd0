//! # Orchestrator Configuration
//!
//! Typed configuration tree for the orchestration core. Every section has
//! working defaults so an orchestrator can be built from
//! `OrchestratorConfig::default()` in tests; deployments layer TOML files and
//! `REELFLOW_*` environment variables on top through [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reelflow_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let pool = &manager.config().resources;
//! println!("cpu cores in pool: {}", pool.cpu_cores);
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};
use crate::models::{JobComplexity, LoadBalancingStrategy, ResourceAmounts, RetryPolicy, StepType};
use crate::resilience::CircuitBreakerConfig;

pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub resources: ResourcePoolConfig,
    pub analyzer: AnalyzerConfig,
    pub load_balancer: LoadBalancerConfig,
    pub circuit_breakers: CircuitBreakerSettings,
    pub retry: RetryPolicy,
    pub workflow: WorkflowConfig,
    pub health: HealthConfig,
    pub analytics: AnalyticsConfig,
    pub telemetry: TelemetryConfig,
}

/// Capacity of the local resource pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePoolConfig {
    pub node_id: String,
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub network_mbps: f64,
    pub gpu_units: f64,
    /// How long a non-immediate job may wait in the allocation queue; zero
    /// means fail fast.
    pub allocation_wait_ms: u64,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            cpu_cores: 32.0,
            memory_gb: 128.0,
            storage_gb: 2_000.0,
            network_mbps: 10_000.0,
            gpu_units: 4.0,
            allocation_wait_ms: 0,
        }
    }
}

impl ResourcePoolConfig {
    pub fn totals(&self) -> ResourceAmounts {
        ResourceAmounts {
            cpu_cores: self.cpu_cores,
            memory_gb: self.memory_gb,
            storage_gb: self.storage_gb,
            network_mbps: self.network_mbps,
            gpu_units: self.gpu_units,
        }
    }

    pub fn allocation_wait(&self) -> Duration {
        Duration::from_millis(self.allocation_wait_ms)
    }
}

/// Weights and thresholds used by the job analyzer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Scores below this are `simple`
    pub simple_max_score: f64,
    /// Scores below this are `moderate`
    pub moderate_max_score: f64,
    /// Scores below this are `complex`, anything above is `enterprise`
    pub complex_max_score: f64,
    /// Estimated runtime under which a simple/moderate job runs inline
    pub quick_threshold_secs: f64,
    /// Source material longer than this with GPU effects is distributed
    pub distributed_source_secs: f64,
    /// Duration assumed for elements that do not declare one
    pub default_element_duration_secs: f64,
    pub score_per_element: f64,
    pub score_per_effect: f64,
    pub score_per_gpu_effect: f64,
    /// Seconds of source material that add one point of complexity
    pub seconds_per_score_point: f64,
    /// Frame area that adds one point of complexity (720p)
    pub pixels_per_score_point: f64,
    /// Job timeout below which the derived priority is raised to `high`
    pub tight_deadline_secs: u64,
    /// Complexity from which GPU capacity is requested regardless of effects
    pub gpu_complexity: JobComplexity,
    pub max_cpu_cores: f64,
    pub max_memory_gb: f64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            simple_max_score: 10.0,
            moderate_max_score: 25.0,
            complex_max_score: 45.0,
            quick_threshold_secs: 30.0,
            distributed_source_secs: 300.0,
            default_element_duration_secs: 5.0,
            score_per_element: 2.0,
            score_per_effect: 1.5,
            score_per_gpu_effect: 3.0,
            seconds_per_score_point: 30.0,
            pixels_per_score_point: 1280.0 * 720.0,
            tight_deadline_secs: 60,
            gpu_complexity: JobComplexity::Complex,
            max_cpu_cores: 16.0,
            max_memory_gb: 64.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerConfig {
    pub strategy: LoadBalancingStrategy,
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    /// Instances unhealthy for longer than this are deregistered
    pub unhealthy_eviction_ms: u64,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::LeastConnections,
            health_check_interval_ms: 10_000,
            health_check_timeout_ms: 2_000,
            unhealthy_eviction_ms: 300_000,
        }
    }
}

impl LoadBalancerConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn unhealthy_eviction(&self) -> Duration {
        Duration::from_millis(self.unhealthy_eviction_ms)
    }
}

/// Millisecond form of [`CircuitBreakerConfig`] as it appears in files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub monitoring_window_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 3,
            monitoring_window_ms: 60_000,
            call_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_max_calls: self.half_open_max_calls,
            monitoring_window: Duration::from_millis(self.monitoring_window_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }
}

/// Logical service names each step type is dispatched to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepServiceMap {
    pub validation: String,
    pub asset_download: String,
    pub preprocessing: String,
    pub rendering: String,
    pub composition: String,
    pub encoding: String,
    pub upload: String,
    pub cleanup: String,
}

impl Default for StepServiceMap {
    fn default() -> Self {
        Self {
            validation: "validation-service".to_string(),
            asset_download: "asset-service".to_string(),
            preprocessing: "media-service".to_string(),
            rendering: "render-service".to_string(),
            composition: "render-service".to_string(),
            encoding: "encoder-service".to_string(),
            upload: "storage-service".to_string(),
            cleanup: "storage-service".to_string(),
        }
    }
}

impl StepServiceMap {
    pub fn service_for(&self, step_type: StepType) -> &str {
        match step_type {
            StepType::Validation => &self.validation,
            StepType::AssetDownload => &self.asset_download,
            StepType::Preprocessing => &self.preprocessing,
            StepType::Rendering => &self.rendering,
            StepType::Composition => &self.composition,
            StepType::Encoding => &self.encoding,
            StepType::Upload => &self.upload,
            StepType::Cleanup => &self.cleanup,
        }
    }

    /// Distinct service names, in step order
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in [
            &self.validation,
            &self.asset_download,
            &self.preprocessing,
            &self.rendering,
            &self.composition,
            &self.encoding,
            &self.upload,
            &self.cleanup,
        ] {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub workflow_timeout_ms: u64,
    pub step_timeout_ms: u64,
    pub max_rollbacks: u32,
    /// Grace period running executions get on shutdown before cancellation
    pub shutdown_grace_ms: u64,
    /// How many times a step rejected by an open breaker is re-run after
    /// waiting out the recovery timeout
    pub max_unavailable_waits: u32,
    /// Parallel segments used by the distributed template
    pub distributed_segments: u32,
    /// How long finished and rejected jobs stay queryable
    pub finished_retention_ms: u64,
    /// How often the background purge runs
    pub purge_interval_ms: u64,
    pub services: StepServiceMap,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_ms: 30 * 60 * 1000,
            step_timeout_ms: 120_000,
            max_rollbacks: 3,
            shutdown_grace_ms: 10_000,
            max_unavailable_waits: 1,
            distributed_segments: 4,
            finished_retention_ms: 60 * 60 * 1000,
            purge_interval_ms: 60_000,
            services: StepServiceMap::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_millis(self.finished_retention_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Pool saturation above which the system reports `degraded`
    pub degraded_saturation: f64,
    /// Pool saturation at which the pool counts as exhausted
    pub exhausted_saturation: f64,
    /// Services whose instances decide the verdict; empty means every
    /// service named in `workflow.services`
    pub required_services: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_saturation: 0.85,
            exhausted_saturation: 0.98,
            required_services: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Job summaries kept in memory for reports
    pub history_capacity: usize,
    pub sample_capacity: usize,
    pub sample_interval_ms: u64,
    pub forecast_horizon_minutes: u32,
    /// Dimension saturation flagged as a bottleneck
    pub bottleneck_saturation: f64,
    /// Average step duration flagged as slow
    pub slow_step_ms: f64,
    /// Service failure rate flagged as unreliable
    pub failure_rate_threshold: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1_000,
            sample_capacity: 720,
            sample_interval_ms: 15_000,
            forecast_horizon_minutes: 60,
            bottleneck_saturation: 0.8,
            slow_step_ms: 60_000.0,
            failure_rate_threshold: 0.2,
        }
    }
}

impl AnalyticsConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Overrides the environment-derived level when `RUST_LOG` is unset
    pub log_level: Option<String>,
    pub json_logs: bool,
}

fn invalid(field: &str, message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Configuration(format!("{field}: {}", message.into()))
}

impl OrchestratorConfig {
    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        let pool = &self.resources;
        for (field, value) in [
            ("resources.cpu_cores", pool.cpu_cores),
            ("resources.memory_gb", pool.memory_gb),
            ("resources.storage_gb", pool.storage_gb),
            ("resources.network_mbps", pool.network_mbps),
            ("resources.gpu_units", pool.gpu_units),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, "capacity must be a finite, non-negative number"));
            }
        }
        if pool.cpu_cores == 0.0 || pool.memory_gb == 0.0 {
            return Err(invalid(
                "resources",
                "cpu_cores and memory_gb must be greater than 0",
            ));
        }
        if pool.node_id.is_empty() {
            return Err(invalid("resources.node_id", "must not be empty"));
        }

        let analyzer = &self.analyzer;
        if !(analyzer.simple_max_score < analyzer.moderate_max_score
            && analyzer.moderate_max_score < analyzer.complex_max_score)
        {
            return Err(invalid(
                "analyzer",
                "complexity thresholds must be strictly increasing",
            ));
        }
        if analyzer.seconds_per_score_point <= 0.0 || analyzer.pixels_per_score_point <= 0.0 {
            return Err(invalid("analyzer", "score divisors must be greater than 0"));
        }

        self.circuit_breakers
            .to_breaker_config()
            .validate()
            .map_err(|e| invalid("circuit_breakers", e))?;

        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                "must be at least 1.0 so backoff never shrinks",
            ));
        }
        if self.retry.backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid("retry", "backoff_ms must not exceed max_backoff_ms"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter", "must be between 0.0 and 1.0"));
        }

        if self.workflow.workflow_timeout_ms == 0 || self.workflow.step_timeout_ms == 0 {
            return Err(invalid("workflow", "timeouts must be greater than 0"));
        }
        if self.workflow.distributed_segments == 0 {
            return Err(invalid("workflow.distributed_segments", "must be at least 1"));
        }
        if self.workflow.purge_interval_ms == 0 {
            return Err(invalid("workflow.purge_interval_ms", "must be greater than 0"));
        }

        let health = &self.health;
        if !(0.0 < health.degraded_saturation
            && health.degraded_saturation <= health.exhausted_saturation
            && health.exhausted_saturation <= 1.0)
        {
            return Err(invalid(
                "health",
                "expected 0 < degraded_saturation <= exhausted_saturation <= 1",
            ));
        }

        if self.analytics.history_capacity == 0 || self.analytics.sample_capacity == 0 {
            return Err(invalid("analytics", "capacities must be greater than 0"));
        }
        if self.analytics.sample_interval_ms == 0 {
            return Err(invalid("analytics.sample_interval_ms", "must be greater than 0"));
        }

        Ok(())
    }

    /// Services the health verdict is computed over
    pub fn required_services(&self) -> Vec<String> {
        if self.health.required_services.is_empty() {
            self.workflow.services.services()
        } else {
            self.health.required_services.clone()
        }
    }
}
