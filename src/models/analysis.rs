//! # Job Analysis
//!
//! Immutable estimate produced once per incoming job by the job analyzer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::allocation::ResourceAmounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobComplexity {
    Simple,
    Moderate,
    Complex,
    Enterprise,
}

impl fmt::Display for JobComplexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobComplexity::Simple => "simple",
            JobComplexity::Moderate => "moderate",
            JobComplexity::Complex => "complex",
            JobComplexity::Enterprise => "enterprise",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    QuickSync,
    BalancedAsync,
    ResourceIntensive,
    Distributed,
}

impl ProcessingStrategy {
    pub fn is_synchronous(&self) -> bool {
        matches!(self, ProcessingStrategy::QuickSync)
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessingStrategy::QuickSync => "quick_sync",
            ProcessingStrategy::BalancedAsync => "balanced_async",
            ProcessingStrategy::ResourceIntensive => "resource_intensive",
            ProcessingStrategy::Distributed => "distributed",
        };
        f.write_str(label)
    }
}

/// Resources a job needs for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub bandwidth_mbps: f64,
    pub gpu_required: bool,
    /// GPU units to reserve; zero unless `gpu_required`
    #[serde(default)]
    pub gpu_units: f64,
}

impl ResourceRequirements {
    /// Flat per-dimension amounts to reserve against the pool
    pub fn amounts(&self) -> ResourceAmounts {
        ResourceAmounts {
            cpu_cores: self.cpu_cores,
            memory_gb: self.memory_gb,
            storage_gb: self.storage_gb,
            network_mbps: self.bandwidth_mbps,
            gpu_units: if self.gpu_required { self.gpu_units } else { 0.0 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactor {
    HighResolution,
    LongDuration,
    ManyElements,
    GpuDependency,
    RemoteSources,
    TightDeadline,
    /// Input could not be measured; classification is conservative
    Unanalyzable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationHint {
    ParallelizeDownloads,
    CacheSources,
    UseGpuEncoding,
    SplitIntoSegments,
    PreferHardwareDecode,
    BatchTextRendering,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAnalysis {
    pub job_id: String,
    pub complexity_score: f64,
    pub complexity: JobComplexity,
    pub priority: JobPriority,
    pub strategy: ProcessingStrategy,
    /// Estimated wall-clock processing time, seconds
    pub estimated_duration_secs: f64,
    /// Total source media duration on the timeline, seconds
    pub source_duration_secs: f64,
    pub requirements: ResourceRequirements,
    pub risk_factors: Vec<RiskFactor>,
    pub optimization_hints: Vec<OptimizationHint>,
    pub analyzed_at: DateTime<Utc>,
}

impl JobAnalysis {
    pub fn has_risk(&self, risk: RiskFactor) -> bool {
        self.risk_factors.contains(&risk)
    }
}
