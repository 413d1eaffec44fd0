//! # Circuit Breaker Implementation
//!
//! Fault isolation for calls to backing services. Three states:
//!
//! - **Closed**: calls pass; failures are counted inside a rolling
//!   monitoring window and the circuit opens once they reach the threshold.
//! - **Open**: calls fail fast without running the operation until the
//!   recovery timeout has elapsed.
//! - **Half-open**: at most `half_open_max_calls` trial calls are admitted.
//!   Any trial failure reopens the circuit; once every trial has succeeded it
//!   closes.
//!
//! Admission and result recording happen under one short critical section.
//! Each admitted call carries the generation it was admitted in, so a slow
//! call that finishes after the circuit changed state updates the counters
//! but cannot flip the new state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerMetrics, MetricsCollector, TracingMetricsCollector,
};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed = 0,
    /// Failure mode - all calls fail fast without executing
    Open = 1,
    /// Testing recovery - limited calls allowed to test service health
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            // Default to safest state
            _ => CircuitState::Open,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or half-open with every trial taken)
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// The call did not finish within its deadline and was recorded as a failure
    #[error("Call to {component} timed out after {timeout:?}")]
    Timeout { component: String, timeout: Duration },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerInner {
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    generation: u64,
    half_open_permits: u32,
    half_open_successes: u32,
    metrics: CircuitBreakerMetrics,
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    trial: bool,
}

enum Outcome {
    Success,
    Failure { timed_out: bool },
    /// Completed with an error that says nothing about service health
    Neutral,
}

/// Returns an unused half-open permit if the protected future is dropped
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    settled: bool,
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.abandon(self.permit);
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    collector: Arc<dyn MetricsCollector>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_collector(name, config, Arc::new(TracingMetricsCollector))
    }

    pub fn with_collector(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        collector: Arc<dyn MetricsCollector>,
    ) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            half_open_max_calls = config.half_open_max_calls,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            inner: Mutex::new(BreakerInner {
                failures: VecDeque::new(),
                opened_at: None,
                generation: 0,
                half_open_permits: 0,
                half_open_successes: 0,
                metrics: CircuitBreakerMetrics::new(),
            }),
            collector,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current circuit state. An open circuit whose recovery timeout has
    /// elapsed still reports `Open` until the next call tries it.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Execute `operation` with the configured call timeout; every error
    /// counts as a failure
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(self.config.call_timeout, operation, |_| true)
            .await
    }

    /// Execute `operation` bounded by `timeout`; every error counts as a
    /// failure
    pub async fn call_with_timeout<F, T, E, Fut>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(timeout, operation, |_| true).await
    }

    /// Execute `operation` bounded by `timeout`. Errors for which
    /// `is_failure` returns false (bad input, caller cancellation) are passed
    /// through without counting against the circuit.
    pub async fn call_filtered<F, T, E, Fut, P>(
        &self,
        timeout: Duration,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let Some(permit) = self.try_acquire() else {
            debug!(component = %self.name, "⚡ Call rejected, circuit open");
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        };
        let mut guard = PermitGuard {
            breaker: self,
            permit,
            settled: false,
        };

        let start = Instant::now();
        let result = tokio::time::timeout(timeout, operation()).await;
        let duration = start.elapsed();
        guard.settled = true;

        match result {
            Ok(Ok(value)) => {
                self.settle(permit, Outcome::Success, duration);
                Ok(value)
            }
            Ok(Err(err)) => {
                let outcome = if is_failure(&err) {
                    Outcome::Failure { timed_out: false }
                } else {
                    Outcome::Neutral
                };
                self.settle(permit, outcome, duration);
                Err(CircuitBreakerError::OperationFailed(err))
            }
            Err(_) => {
                self.settle(permit, Outcome::Failure { timed_out: true }, duration);
                Err(CircuitBreakerError::Timeout {
                    component: self.name.clone(),
                    timeout,
                })
            }
        }
    }

    fn try_acquire(&self) -> Option<Permit> {
        let mut inner = self.inner.lock();
        match self.state() {
            CircuitState::Closed => Some(Permit {
                generation: inner.generation,
                trial: false,
            }),
            CircuitState::Open => {
                let recovered = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.recovery_timeout);
                if !recovered {
                    inner.metrics.rejected_count += 1;
                    return None;
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.half_open_permits = 1;
                inner.metrics.half_open_calls = 1;
                Some(Permit {
                    generation: inner.generation,
                    trial: true,
                })
            }
            CircuitState::HalfOpen => {
                if inner.half_open_permits >= self.config.half_open_max_calls {
                    inner.metrics.rejected_count += 1;
                    return None;
                }
                inner.half_open_permits += 1;
                inner.metrics.half_open_calls += 1;
                Some(Permit {
                    generation: inner.generation,
                    trial: true,
                })
            }
        }
    }

    fn settle(&self, permit: Permit, outcome: Outcome, duration: Duration) {
        let mut inner = self.inner.lock();
        let current = permit.generation == inner.generation;
        inner.metrics.total_calls += 1;
        inner.metrics.total_duration += duration;

        match outcome {
            Outcome::Success => {
                inner.metrics.success_count += 1;
                inner.metrics.consecutive_failures = 0;
                self.collector
                    .record_operation_timing(&self.name, duration, true);

                if current && permit.trial {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_calls {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
            Outcome::Failure { timed_out } => {
                inner.metrics.failure_count += 1;
                inner.metrics.consecutive_failures += 1;
                if timed_out {
                    inner.metrics.timeout_count += 1;
                }
                self.collector
                    .record_operation_timing(&self.name, duration, false);
                warn!(
                    component = %self.name,
                    duration_ms = duration.as_millis() as u64,
                    timed_out = timed_out,
                    "🔴 Operation failed"
                );

                if !current {
                    return;
                }
                if permit.trial {
                    self.transition(&mut inner, CircuitState::Open);
                    return;
                }
                let now = Instant::now();
                inner.failures.push_back(now);
                self.prune_window(&mut inner, now);
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            Outcome::Neutral => {
                // The service answered; a trial still counts as proof of life
                if current && permit.trial {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.half_open_max_calls {
                        self.transition(&mut inner, CircuitState::Closed);
                    }
                }
            }
        }
    }

    fn abandon(&self, permit: Permit) {
        let mut inner = self.inner.lock();
        if permit.trial && permit.generation == inner.generation {
            inner.half_open_permits = inner.half_open_permits.saturating_sub(1);
            inner.metrics.half_open_calls = inner.metrics.half_open_calls.saturating_sub(1);
        }
    }

    fn prune_window(&self, inner: &mut BreakerInner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.duration_since(*oldest) > self.config.monitoring_window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state.store(to as u8, Ordering::Release);
        inner.generation += 1;
        inner.half_open_permits = 0;
        inner.half_open_successes = 0;
        inner.metrics.half_open_calls = 0;

        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                error!(
                    component = %self.name,
                    window_failures = inner.failures.len(),
                    failure_threshold = self.config.failure_threshold,
                    recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                    "🔴 Circuit breaker opened (failing fast)"
                );
            }
            CircuitState::HalfOpen => {
                info!(
                    component = %self.name,
                    half_open_max_calls = self.config.half_open_max_calls,
                    "🟡 Circuit breaker half-open (testing recovery)"
                );
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.failures.clear();
                info!(
                    component = %self.name,
                    total_calls = inner.metrics.total_calls,
                    "🟢 Circuit breaker closed (recovered)"
                );
            }
        }
        self.collector.record_state_transition(&self.name, from, to);
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Force circuit to closed state
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        self.transition(&mut inner, CircuitState::Closed);
    }

    /// Time left before an open circuit admits a trial
    pub fn remaining_open_time(&self) -> Option<Duration> {
        if self.state() != CircuitState::Open {
            return None;
        }
        let inner = self.inner.lock();
        inner
            .opened_at
            .map(|at| self.config.recovery_timeout.saturating_sub(at.elapsed()))
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.inner.lock();
        self.prune_window(&mut inner, Instant::now());
        let mut snapshot = inner.metrics.clone();
        snapshot.window_failures = inner.failures.len() as u64;
        snapshot.finalize(self.state())
    }

    /// Closed with a low failure rate
    pub fn is_healthy(&self) -> bool {
        if self.state() != CircuitState::Closed {
            return false;
        }
        let metrics = self.metrics();
        metrics.success_count + metrics.failure_count < 10 || metrics.failure_rate < 0.1
    }
}
