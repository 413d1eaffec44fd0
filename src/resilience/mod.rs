//! # Resilience Module
//!
//! Fault tolerance for calls into backing services.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: one per `(service, operation)` pair, isolating failing services
//! - **Manager**: get-or-create table of breakers, plus system-wide metrics
//! - **Retry Executor**: exponential backoff with jitter driven by a step's `RetryPolicy`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reelflow_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let circuit_breaker = CircuitBreaker::new(
//!     "render-service::execute",
//!     CircuitBreakerConfig::for_processing_service(),
//! );
//!
//! let frames = circuit_breaker
//!     .call(|| async { Ok::<u64, std::io::Error>(240) })
//!     .await?;
//! # let _ = frames;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::CircuitBreakerConfig;
pub use manager::{breaker_key, CircuitBreakerManager};
pub use metrics::{
    CircuitBreakerMetrics, MetricsCollector, SystemCircuitBreakerMetrics, TracingMetricsCollector,
};
pub use retry::{Classify, RetryExecutor, RetryOutcome};
