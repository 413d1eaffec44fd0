//! # Load Balancer
//!
//! Picks one registered instance per step dispatch. Unhealthy instances and
//! instances that do not accept the step type are never candidates; among
//! the rest, instances with a free slot are preferred. When no candidate is
//! left the caller gets [`SelectionError::NoCapacity`], which the workflow
//! engine treats as a retryable step failure.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::service_registry::ServiceRegistry;
use crate::models::{LoadBalancingStrategy, ServiceInstance, StepType};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectionError {
    #[error("No instances registered for service {service}")]
    NoInstances { service: String },

    #[error("No healthy instance of {service} accepts {step_type} steps")]
    NoCapacity { service: String, step_type: StepType },
}

/// Scoring hook for the `ai_driven` strategy; the highest score wins
pub trait InstanceScorer: Send + Sync {
    fn score(&self, instance: &ServiceInstance) -> f64;
}

/// Blend of historical success rate, current load and response time
#[derive(Debug, Clone, Copy)]
pub struct BlendedScorer {
    pub success_weight: f64,
    pub load_weight: f64,
    pub latency_weight: f64,
    /// Response time that scores half of the latency component
    pub reference_latency_ms: f64,
}

impl Default for BlendedScorer {
    fn default() -> Self {
        Self {
            success_weight: 0.5,
            load_weight: 0.3,
            latency_weight: 0.2,
            reference_latency_ms: 500.0,
        }
    }
}

impl InstanceScorer for BlendedScorer {
    fn score(&self, instance: &ServiceInstance) -> f64 {
        let success = instance.performance.success_rate();
        let headroom = 1.0 - instance.load.load_factor(&instance.capacity).clamp(0.0, 1.0);
        let latency = instance.performance.average_response_ms.max(0.0);
        let speed = self.reference_latency_ms / (self.reference_latency_ms + latency);

        self.success_weight * success + self.load_weight * headroom + self.latency_weight * speed
    }
}

pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    strategy: LoadBalancingStrategy,
    cursors: DashMap<String, AtomicUsize>,
    scorer: Arc<dyn InstanceScorer>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(registry: Arc<ServiceRegistry>, strategy: LoadBalancingStrategy) -> Self {
        Self {
            registry,
            strategy,
            cursors: DashMap::new(),
            scorer: Arc::new(BlendedScorer::default()),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn InstanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Select an instance of `service` for a step of `step_type`
    pub fn select(
        &self,
        service: &str,
        step_type: StepType,
    ) -> Result<ServiceInstance, SelectionError> {
        let instances = self.registry.instances(service);
        if instances.is_empty() {
            return Err(SelectionError::NoInstances {
                service: service.to_string(),
            });
        }

        let candidates: Vec<ServiceInstance> = instances
            .into_iter()
            .filter(|i| i.health.is_selectable() && i.capacity.supports(step_type))
            .collect();
        if candidates.is_empty() {
            return Err(SelectionError::NoCapacity {
                service: service.to_string(),
                step_type,
            });
        }

        let with_slot: Vec<ServiceInstance> = candidates
            .iter()
            .filter(|i| i.has_free_slot())
            .cloned()
            .collect();
        let pool = if with_slot.is_empty() {
            candidates
        } else {
            with_slot
        };

        let index = match self.strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(service, pool.len()),
            LoadBalancingStrategy::Weighted => weighted(&pool),
            LoadBalancingStrategy::LeastConnections => least_connections(&pool),
            LoadBalancingStrategy::PerformanceBased => performance_based(&pool),
            LoadBalancingStrategy::AiDriven => self.best_scored(&pool),
        };

        let selected = pool.into_iter().nth(index).ok_or_else(|| SelectionError::NoCapacity {
            service: service.to_string(),
            step_type,
        })?;
        debug!(
            service = service,
            instance_id = %selected.id,
            strategy = ?self.strategy,
            active_jobs = selected.load.active_jobs,
            "Selected service instance"
        );
        Ok(selected)
    }

    fn round_robin(&self, service: &str, len: usize) -> usize {
        let cursor = self
            .cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    fn best_scored(&self, pool: &[ServiceInstance]) -> usize {
        pool.iter()
            .enumerate()
            .map(|(index, instance)| (index, self.scorer.score(instance)))
            .fold((0, f64::NEG_INFINITY), |best, (index, score)| {
                if score > best.1 {
                    (index, score)
                } else {
                    best
                }
            })
            .0
    }
}

/// Probability proportional to inverse load
fn weighted(pool: &[ServiceInstance]) -> usize {
    let weights: Vec<f64> = pool
        .iter()
        .map(|i| 1.0 / (0.05 + i.load.load_factor(&i.capacity).max(0.0)))
        .collect();
    let total: f64 = weights.iter().sum();
    let mut pick = fastrand::f64() * total;
    for (index, weight) in weights.iter().enumerate() {
        if pick < *weight {
            return index;
        }
        pick -= weight;
    }
    pool.len() - 1
}

fn least_connections(pool: &[ServiceInstance]) -> usize {
    pool.iter()
        .enumerate()
        .min_by_key(|(_, i)| (i.load.active_jobs, i.load.queued_jobs))
        .map(|(index, _)| index)
        .unwrap_or(0)
}

/// Lowest recent average response time; ties go to the less loaded instance
fn performance_based(pool: &[ServiceInstance]) -> usize {
    pool.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.performance
                .average_response_ms
                .total_cmp(&b.performance.average_response_ms)
                .then(a.load.active_jobs.cmp(&b.load.active_jobs))
        })
        .map(|(index, _)| index)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthCheckResult, HealthStatus, ServiceCapacity};
    use std::collections::HashSet;
    use std::time::Duration;

    fn instance(max_jobs: u32) -> ServiceInstance {
        ServiceInstance::new(
            "render-service",
            "http://render.local",
            ServiceCapacity {
                max_concurrent_jobs: max_jobs,
                supported_job_types: vec![StepType::Rendering, StepType::Composition],
            },
        )
        .with_health(HealthStatus::Healthy)
    }

    fn balancer(strategy: LoadBalancingStrategy) -> (Arc<ServiceRegistry>, LoadBalancer) {
        let registry = Arc::new(ServiceRegistry::new());
        let balancer = LoadBalancer::new(Arc::clone(&registry), strategy);
        (registry, balancer)
    }

    #[test]
    fn test_round_robin_rotates() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::RoundRobin);
        for _ in 0..3 {
            registry.register(instance(4));
        }
        let picked: HashSet<_> = (0..3)
            .map(|_| balancer.select("render-service", StepType::Rendering).unwrap().id)
            .collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_least_connections_prefers_idle_instance() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::LeastConnections);
        let busy = registry.register(instance(4));
        let idle = registry.register(instance(4));
        registry.begin_job(busy);

        assert_eq!(balancer.select("render-service", StepType::Rendering).unwrap().id, idle);
    }

    #[test]
    fn test_performance_based_picks_fastest() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::PerformanceBased);
        let slow = registry.register(instance(4));
        let fast = registry.register(instance(4));
        registry.begin_job(slow);
        registry.end_job(slow, Duration::from_millis(900), true);
        registry.begin_job(fast);
        registry.end_job(fast, Duration::from_millis(50), true);

        assert_eq!(balancer.select("render-service", StepType::Rendering).unwrap().id, fast);
    }

    #[test]
    fn test_ai_driven_prefers_reliable_instance() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::AiDriven);
        let flaky = registry.register(instance(4));
        let solid = registry.register(instance(4));
        for _ in 0..4 {
            registry.begin_job(flaky);
            registry.end_job(flaky, Duration::from_millis(100), false);
            registry.begin_job(solid);
            registry.end_job(solid, Duration::from_millis(100), true);
        }
        assert_eq!(balancer.select("render-service", StepType::Rendering).unwrap().id, solid);
    }

    #[test]
    fn test_weighted_only_returns_candidates() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::Weighted);
        let a = registry.register(instance(4));
        let b = registry.register(instance(4));
        for _ in 0..20 {
            let id = balancer.select("render-service", StepType::Rendering).unwrap().id;
            assert!(id == a || id == b);
        }
    }

    #[test]
    fn test_unhealthy_instances_are_excluded() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::RoundRobin);
        let down = registry.register(instance(4));
        let up = registry.register(instance(4));
        registry.update_health(down, &HealthCheckResult::unhealthy("check failed"));

        for _ in 0..4 {
            assert_eq!(balancer.select("render-service", StepType::Rendering).unwrap().id, up);
        }

        registry.update_health(up, &HealthCheckResult::unhealthy("check failed"));
        assert!(matches!(
            balancer.select("render-service", StepType::Rendering),
            Err(SelectionError::NoCapacity { .. })
        ));
    }

    #[test]
    fn test_unsupported_step_type_and_unknown_service() {
        let (registry, balancer) = balancer(LoadBalancingStrategy::LeastConnections);
        registry.register(instance(4));
        assert!(matches!(
            balancer.select("render-service", StepType::Upload),
            Err(SelectionError::NoCapacity { .. })
        ));
        assert!(matches!(
            balancer.select("encoder-service", StepType::Encoding),
            Err(SelectionError::NoInstances { .. })
        ));
    }
}
