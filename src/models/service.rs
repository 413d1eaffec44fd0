//! # Service Instances
//!
//! Registry entries for the backing services that execute workflow steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::workflow::StepType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Whether the load balancer may route work to an instance in this state
    pub fn is_selectable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Weighted,
    LeastConnections,
    PerformanceBased,
    AiDriven,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        LoadBalancingStrategy::LeastConnections
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCapacity {
    pub max_concurrent_jobs: u32,
    /// Step types the instance accepts; empty means any
    #[serde(default)]
    pub supported_job_types: Vec<StepType>,
}

impl ServiceCapacity {
    pub fn supports(&self, step_type: StepType) -> bool {
        self.supported_job_types.is_empty() || self.supported_job_types.contains(&step_type)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceLoad {
    pub active_jobs: u32,
    pub queued_jobs: u32,
    /// Reported resource utilization, 0.0 - 1.0
    pub resource_utilization: f64,
    pub response_time_ms: f64,
}

impl ServiceLoad {
    /// Load normalised against declared capacity, used for weighting
    pub fn load_factor(&self, capacity: &ServiceCapacity) -> f64 {
        let max = f64::from(capacity.max_concurrent_jobs.max(1));
        let occupancy = f64::from(self.active_jobs + self.queued_jobs) / max;
        (occupancy + self.resource_utilization.clamp(0.0, 1.0)) / 2.0
    }
}

/// Rolling performance record kept per instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceProfile {
    pub average_response_ms: f64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceProfile {
    const SMOOTHING: f64 = 0.2;

    pub fn new() -> Self {
        Self {
            average_response_ms: 0.0,
            total_calls: 0,
            successful_calls: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn record(&mut self, duration: Duration, success: bool) {
        let sample = duration.as_secs_f64() * 1000.0;
        self.average_response_ms = if self.total_calls == 0 {
            sample
        } else {
            self.average_response_ms * (1.0 - Self::SMOOTHING) + sample * Self::SMOOTHING
        };
        self.total_calls += 1;
        if success {
            self.successful_calls += 1;
        }
        self.last_updated = Utc::now();
    }

    /// Historical success rate; instances without history are given the
    /// benefit of the doubt.
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            1.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64
        }
    }
}

impl Default for PerformanceProfile {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: Uuid,
    pub service_name: String,
    pub endpoint: String,
    pub capacity: ServiceCapacity,
    pub load: ServiceLoad,
    pub health: HealthStatus,
    pub performance: PerformanceProfile,
    pub registered_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    pub fn new(
        service_name: impl Into<String>,
        endpoint: impl Into<String>,
        capacity: ServiceCapacity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            endpoint: endpoint.into(),
            capacity,
            load: ServiceLoad::default(),
            health: HealthStatus::Unknown,
            performance: PerformanceProfile::new(),
            registered_at: Utc::now(),
            last_health_check: None,
        }
    }

    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }

    pub fn has_free_slot(&self) -> bool {
        self.load.active_jobs < self.capacity.max_concurrent_jobs
    }
}

/// Outcome of a single health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub response_time_ms: f64,
    #[serde(default)]
    pub load: Option<ServiceLoad>,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthCheckResult {
    pub fn healthy(response_time_ms: f64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            response_time_ms,
            load: None,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms: 0.0,
            load: None,
            message: Some(message.into()),
        }
    }
}
