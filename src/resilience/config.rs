//! # Circuit Breaker Configuration
//!
//! Per-breaker thresholds. The file-facing millisecond form lives in
//! `crate::config::CircuitBreakerSettings` and converts into this type.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside `monitoring_window` that open the circuit
    pub failure_threshold: u32,

    /// Time to wait in open state before probing again
    pub recovery_timeout: Duration,

    /// Trial calls admitted while half-open; that many successes close the
    /// circuit, any failure reopens it
    pub half_open_max_calls: u32,

    /// Rolling window failures are counted in
    pub monitoring_window: Duration,

    /// Upper bound for a single protected call
    pub call_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Render, encode and other long-running processing services
    pub fn for_processing_service() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            monitoring_window: Duration::from_secs(60),
            call_timeout: Duration::from_secs(300),
        }
    }

    /// Object storage and asset fetches
    pub fn for_storage() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(15),
            half_open_max_calls: 2,
            monitoring_window: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.recovery_timeout.is_zero() {
            return Err("recovery_timeout must be greater than 0".to_string());
        }

        if self.recovery_timeout > Duration::from_secs(600) {
            return Err("recovery_timeout should not exceed 600 seconds".to_string());
        }

        if self.half_open_max_calls == 0 {
            return Err("half_open_max_calls must be greater than 0".to_string());
        }

        if self.half_open_max_calls > 50 {
            return Err("half_open_max_calls should not exceed 50".to_string());
        }

        if self.monitoring_window.is_zero() {
            return Err("monitoring_window must be greater than 0".to_string());
        }

        if self.call_timeout.is_zero() {
            return Err("call_timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            monitoring_window: Duration::from_secs(60),
            call_timeout: Duration::from_secs(60),
        }
    }
}
