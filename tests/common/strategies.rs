#![allow(dead_code)]

use chrono::Utc;
use proptest::prelude::*;

use reelflow_core::models::{
    JobAnalysis, JobComplexity, JobPriority, ProcessingStrategy, ResourceAmounts,
    ResourceRequirements, RetryPolicy,
};

/// Strategy for pool capacities
pub fn pool_totals_strategy() -> impl Strategy<Value = ResourceAmounts> {
    (1.0f64..64.0, 1.0f64..256.0, 0.0f64..2_000.0, 0.0f64..10_000.0, 0.0f64..8.0).prop_map(
        |(cpu_cores, memory_gb, storage_gb, network_mbps, gpu_units)| ResourceAmounts {
            cpu_cores,
            memory_gb,
            storage_gb,
            network_mbps,
            gpu_units,
        },
    )
}

/// Strategy for per-job requirements, sized so some fit and some do not
pub fn requirements_strategy() -> impl Strategy<Value = ResourceRequirements> {
    (
        0.5f64..24.0,
        0.5f64..96.0,
        0.0f64..600.0,
        0.0f64..4_000.0,
        prop_oneof![Just(0.0f64), Just(1.0), Just(2.0)],
    )
        .prop_map(
            |(cpu_cores, memory_gb, storage_gb, bandwidth_mbps, gpu_units)| ResourceRequirements {
                cpu_cores,
                memory_gb,
                storage_gb,
                bandwidth_mbps,
                gpu_required: gpu_units > 0.0,
                gpu_units,
            },
        )
}

pub fn priority_strategy() -> impl Strategy<Value = JobPriority> {
    prop_oneof![
        Just(JobPriority::Low),
        Just(JobPriority::Normal),
        Just(JobPriority::High),
        Just(JobPriority::Critical),
    ]
}

/// Retry policies that pass configuration validation
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (0u32..6, 1u64..500, 1.0f64..4.0, 0.0f64..1.0, 0u64..20_000).prop_map(
        |(max_retries, backoff_ms, backoff_multiplier, jitter, headroom)| RetryPolicy {
            max_retries,
            backoff_ms,
            backoff_multiplier,
            max_backoff_ms: backoff_ms + headroom,
            jitter,
            retry_conditions: vec![],
        },
    )
}

pub fn analysis_with(
    job_id: String,
    requirements: ResourceRequirements,
    priority: JobPriority,
) -> JobAnalysis {
    JobAnalysis {
        job_id,
        complexity_score: 20.0,
        complexity: JobComplexity::Moderate,
        priority,
        strategy: ProcessingStrategy::BalancedAsync,
        estimated_duration_secs: 120.0,
        source_duration_secs: 60.0,
        requirements,
        risk_factors: vec![],
        optimization_hints: vec![],
        analyzed_at: Utc::now(),
    }
}
