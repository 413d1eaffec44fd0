//! # System Health
//!
//! Folds pool saturation, circuit breaker state and registry health into one
//! verdict:
//!
//! - **unhealthy**: the CPU or memory pool is exhausted, or more than half
//!   the instances of a required service are unhealthy
//! - **degraded**: anything short of that is wrong (an unhealthy instance,
//!   an open breaker, high saturation, a required service with no instances)
//! - **healthy**: otherwise

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::HealthConfig;
use crate::models::{ResourceType, ResourceUtilization};
use crate::registry::ServiceHealthSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthVerdict::Healthy => write!(f, "healthy"),
            HealthVerdict::Degraded => write!(f, "degraded"),
            HealthVerdict::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// One reason the verdict is not `healthy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthIssue {
    pub component: String,
    pub severity: HealthVerdict,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub status: HealthVerdict,
    pub resources: ResourceUtilization,
    pub services: Vec<ServiceHealthSummary>,
    pub open_circuits: Vec<String>,
    pub active_workflows: usize,
    pub queued_allocations: usize,
    pub issues: Vec<HealthIssue>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthVerdict::Healthy
    }
}

/// Inputs to [`assess`], gathered by the orchestrator
#[derive(Debug, Clone)]
pub struct HealthInputs<'a> {
    pub resources: &'a ResourceUtilization,
    pub services: &'a [ServiceHealthSummary],
    pub open_circuits: &'a [String],
    pub required_services: &'a [String],
}

/// Verdict plus every issue that contributed to it
pub fn assess(config: &HealthConfig, inputs: &HealthInputs<'_>) -> (HealthVerdict, Vec<HealthIssue>) {
    let mut issues = Vec::new();
    let mut issue = |component: String, severity, message: String| {
        issues.push(HealthIssue {
            component,
            severity,
            message,
        })
    };

    for dimension in &inputs.resources.dimensions {
        let saturation = dimension.saturation();
        let critical = matches!(dimension.resource_type, ResourceType::Cpu | ResourceType::Memory);
        if critical && saturation >= config.exhausted_saturation {
            issue(
                format!("pool.{}", dimension.resource_type),
                HealthVerdict::Unhealthy,
                format!("{} pool exhausted ({:.0}% reserved)", dimension.resource_type, saturation * 100.0),
            );
        } else if saturation > config.degraded_saturation {
            issue(
                format!("pool.{}", dimension.resource_type),
                HealthVerdict::Degraded,
                format!("{} pool at {:.0}%", dimension.resource_type, saturation * 100.0),
            );
        }
    }

    for required in inputs.required_services {
        let summary = inputs.services.iter().find(|s| &s.service_name == required);
        match summary {
            None => issue(
                format!("service.{required}"),
                HealthVerdict::Degraded,
                format!("required service {required} has no registered instances"),
            ),
            Some(summary) if summary.unhealthy_majority() => issue(
                format!("service.{required}"),
                HealthVerdict::Unhealthy,
                format!(
                    "{} of {} instances of {required} unhealthy",
                    summary.unhealthy, summary.total
                ),
            ),
            Some(_) => {}
        }
    }

    for summary in inputs.services {
        let majority_reported = inputs.required_services.contains(&summary.service_name)
            && summary.unhealthy_majority();
        if summary.unhealthy > 0 && !majority_reported {
            issue(
                format!("service.{}", summary.service_name),
                HealthVerdict::Degraded,
                format!(
                    "{} of {} instances unhealthy",
                    summary.unhealthy, summary.total
                ),
            );
        }
    }

    for circuit in inputs.open_circuits {
        issue(
            format!("circuit.{circuit}"),
            HealthVerdict::Degraded,
            format!("circuit breaker {circuit} is open"),
        );
    }

    let verdict = issues
        .iter()
        .map(|i| i.severity)
        .max()
        .unwrap_or(HealthVerdict::Healthy);
    (verdict, issues)
}
