//! # Service Registry Infrastructure
//!
//! Tracks the backing services that execute workflow steps and routes each
//! step to one of their instances.
//!
//! ## Architecture
//!
//! ```text
//! Registry Infrastructure
//! ├── ServiceRegistry   (instances, health, load reports)
//! ├── LoadBalancer      (per-step instance selection)
//! └── HealthMonitor     (periodic checks + eviction)
//! ```

pub mod health_monitor;
pub mod load_balancer;
pub mod service_registry;

// Re-export main types for easy access
pub use health_monitor::{HealthMonitor, HealthChecker, HealthSweep};
pub use load_balancer::{BlendedScorer, InstanceScorer, LoadBalancer, SelectionError};
pub use service_registry::{ServiceHealthSummary, ServiceRegistry};
