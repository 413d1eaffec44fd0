//! # Retry Executor
//!
//! Applies a [`RetryPolicy`] around an async operation: exponential backoff
//! with jitter, capped at `max_backoff_ms`, retrying only the failure classes
//! the policy allows. Delays never decrease from one retry to the next and an
//! operation runs at most `max_retries + 1` times.
//!
//! A circuit-open rejection ends the loop immediately; the breaker already
//! answered for the service and hammering it through backoff would only burn
//! the step's time budget.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::error::{FailureClass, StepError};
use crate::models::RetryPolicy;

/// Failure types the executor can classify
pub trait Classify {
    fn failure_class(&self) -> FailureClass;
}

impl Classify for StepError {
    fn failure_class(&self) -> FailureClass {
        self.class()
    }
}

/// Result of a retried operation together with how it got there
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Backoff slept before each retry
    pub delays: Vec<Duration>,
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Backoff before retry number `retry_index` (0-based), never shorter
    /// than `previous`
    pub fn delay_for(&self, retry_index: u32, previous: Duration) -> Duration {
        let max = Duration::from_millis(self.policy.max_backoff_ms);
        let multiplier = self.policy.backoff_multiplier.max(0.0);
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let base_ms = self.policy.backoff_ms as f64 * multiplier.powi(exponent);

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        let jittered_ms = if jitter > 0.0 {
            base_ms * (1.0 + fastrand::f64() * jitter)
        } else {
            base_ms
        };

        let computed = if jittered_ms.is_finite() && jittered_ms < max.as_millis() as f64 {
            Duration::from_secs_f64(jittered_ms.max(0.0) / 1000.0)
        } else {
            max
        };
        computed.min(max).max(previous)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable class or
    /// the policy's attempts are spent. The closure receives the 1-based
    /// attempt number.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts();
        let mut delays = Vec::new();
        let mut previous = Duration::ZERO;
        let mut attempt = 1;

        loop {
            let result = operation(attempt).await;
            let err = match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        delays,
                    }
                }
                Err(err) => err,
            };

            let class = err.failure_class();
            let retryable = class != FailureClass::CircuitOpen && self.policy.should_retry(class);
            if !retryable || attempt >= max_attempts {
                debug!(
                    attempt = attempt,
                    max_attempts = max_attempts,
                    failure_class = %class,
                    error = %err,
                    "Giving up on operation"
                );
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                    delays,
                };
            }

            let delay = self.delay_for(attempt - 1, previous);
            debug!(
                attempt = attempt,
                failure_class = %class,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "🔁 Retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            delays.push(delay);
            previous = delay;
            attempt += 1;
        }
    }
}
