//! # Health Monitor
//!
//! Background task that checks every registered instance on a fixed
//! interval, writes the results into the registry and evicts instances that
//! stayed unhealthy past the eviction window. Breakers of services that lose
//! their last instance are dropped with them.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::service_registry::ServiceRegistry;
use crate::config::LoadBalancerConfig;
use crate::models::{HealthCheckResult, HealthStatus, ServiceInstance};
use crate::resilience::CircuitBreakerManager;

/// Liveness check against one instance
#[async_trait]
pub trait HealthChecker: Send + Sync {
    async fn check(&self, instance: &ServiceInstance) -> HealthCheckResult;
}

/// Outcome of one probing round
#[derive(Debug, Clone, Default)]
pub struct HealthSweep {
    pub checked: usize,
    pub became_unhealthy: usize,
    pub recovered: usize,
    pub evicted: Vec<ServiceInstance>,
}

pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    checker: Arc<dyn HealthChecker>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    config: LoadBalancerConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        checker: Arc<dyn HealthChecker>,
        config: LoadBalancerConfig,
    ) -> Self {
        Self {
            registry,
            checker,
            breakers: None,
            config,
        }
    }

    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    async fn check_one(&self, instance: &ServiceInstance) -> HealthCheckResult {
        let started = Instant::now();
        match tokio::time::timeout(
            self.config.health_check_timeout(),
            self.checker.check(instance),
        )
        .await
        {
            Ok(mut result) => {
                if result.response_time_ms <= 0.0 && result.status != HealthStatus::Unhealthy {
                    result.response_time_ms = started.elapsed().as_secs_f64() * 1000.0;
                }
                result
            }
            Err(_) => HealthCheckResult::unhealthy(format!(
                "health check timed out after {}ms",
                self.config.health_check_timeout_ms
            )),
        }
    }

    /// Check every instance once, concurrently
    pub async fn run_once(&self) -> HealthSweep {
        let instances = self.registry.all_instances();
        let results = join_all(instances.iter().map(|i| self.check_one(i))).await;

        let mut sweep = HealthSweep {
            checked: instances.len(),
            ..HealthSweep::default()
        };
        for (instance, result) in instances.iter().zip(results) {
            let Some(previous) = self.registry.update_health(instance.id, &result) else {
                continue;
            };
            match (previous, result.status) {
                (from, HealthStatus::Unhealthy) if from != HealthStatus::Unhealthy => {
                    sweep.became_unhealthy += 1;
                }
                (HealthStatus::Unhealthy, to) if to != HealthStatus::Unhealthy => {
                    info!(
                        service = %instance.service_name,
                        instance_id = %instance.id,
                        "🟢 Service instance recovered"
                    );
                    sweep.recovered += 1;
                }
                _ => {}
            }
        }

        sweep.evicted = self
            .registry
            .evict_unhealthy(self.config.unhealthy_eviction());
        if let Some(breakers) = &self.breakers {
            for evicted in &sweep.evicted {
                if !self.registry.has_service(&evicted.service_name) {
                    breakers.remove_service(&evicted.service_name);
                }
            }
        }
        if !sweep.evicted.is_empty() {
            warn!(evicted = sweep.evicted.len(), "Evicted unhealthy service instances");
        }

        debug!(
            checked = sweep.checked,
            became_unhealthy = sweep.became_unhealthy,
            recovered = sweep.recovered,
            "Health sweep finished"
        );
        sweep
    }

    /// Check on the configured interval until `shutdown` flips to true
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.health_check_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_ms = self.config.health_check_interval_ms,
                "🩺 Health monitor started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}
