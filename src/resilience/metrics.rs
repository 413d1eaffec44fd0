//! # Circuit Breaker Metrics
//!
//! Per-breaker counters plus the system-wide aggregate used by health
//! reports and analytics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::resilience::CircuitState;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls admitted to the protected operation
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Calls refused without invoking the operation
    pub rejected_count: u64,

    /// Failures that were call timeouts
    pub timeout_count: u64,

    pub consecutive_failures: u64,

    /// Failures currently inside the monitoring window
    pub window_failures: u64,

    /// Trial permits issued in the current half-open period
    pub half_open_calls: u64,

    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Calculated success rate (0.0 to 1.0)
    pub success_rate: f64,

    /// Average duration of admitted calls
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            timeout_count: 0,
            consecutive_failures: 0,
            window_failures: 0,
            half_open_calls: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in rates and averages from the raw counters
    pub(crate) fn finalize(mut self, state: CircuitState) -> Self {
        self.current_state = state;
        let completed = self.success_count + self.failure_count;
        if completed > 0 {
            self.failure_rate = self.failure_count as f64 / completed as f64;
            self.success_rate = self.success_count as f64 / completed as f64;
            self.average_duration = self.total_duration / completed as u32;
        }
        self
    }

    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.failure_rate < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// System-wide circuit breaker metrics aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    /// Metrics by breaker key (`service::operation`)
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,
}

impl SystemCircuitBreakerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_circuit_breaker(&mut self, name: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(name, metrics);
    }

    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.circuit_breakers.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    /// Keys of breakers currently refusing calls
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuit_breakers
            .iter()
            .filter(|(_, metrics)| metrics.current_state == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect();
        open.sort();
        open
    }

    /// Fraction of healthy breakers (1.0 when there are none)
    pub fn health_score(&self) -> f64 {
        if self.circuit_breakers.is_empty() {
            return 1.0;
        }
        let healthy = self
            .circuit_breakers
            .values()
            .filter(|metrics| metrics.is_healthy())
            .count();
        healthy as f64 / self.circuit_breakers.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.total_calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.failure_count).sum()
    }

    pub fn system_failure_rate(&self) -> f64 {
        let completed: u64 = self
            .circuit_breakers
            .values()
            .map(|m| m.success_count + m.failure_count)
            .sum();
        if completed == 0 {
            return 0.0;
        }
        self.total_failures() as f64 / completed as f64
    }
}

/// Sink for breaker activity, e.g. a metrics exporter or the event bus
pub trait MetricsCollector: Send + Sync {
    fn record_state_transition(&self, name: &str, from: CircuitState, to: CircuitState);

    fn record_operation_timing(&self, name: &str, duration: Duration, success: bool);
}

/// Collector that only writes tracing records
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsCollector;

impl MetricsCollector for TracingMetricsCollector {
    fn record_state_transition(&self, name: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(
            circuit_breaker = name,
            from_state = ?from,
            to_state = ?to,
            "Circuit breaker state transition"
        );
    }

    fn record_operation_timing(&self, name: &str, duration: Duration, success: bool) {
        tracing::trace!(
            circuit_breaker = name,
            duration_ms = duration.as_millis() as u64,
            success = success,
            "Circuit breaker operation timing"
        );
    }
}
