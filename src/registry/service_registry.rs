//! # Service Registry
//!
//! Process-wide table of backing service instances grouped by logical
//! service name. Health checks and post-call load reports mutate entries
//! through the narrow operations below; readers only ever get clones.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::events::{EventPublisher, OrchestrationEvent};
use crate::logging::log_service_operation;
use crate::models::{HealthCheckResult, HealthStatus, ServiceInstance, ServiceLoad};

/// Instance counts by health for one service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceHealthSummary {
    pub service_name: String,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl ServiceHealthSummary {
    /// More than half of the registered instances are unhealthy
    pub fn unhealthy_majority(&self) -> bool {
        self.total > 0 && self.unhealthy * 2 > self.total
    }
}

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Vec<ServiceInstance>>>,
    locations: DashMap<Uuid, String>,
    unhealthy_since: DashMap<Uuid, Instant>,
    events: Option<EventPublisher>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: EventPublisher) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    fn publish(&self, event: OrchestrationEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Add an instance. Re-registering an existing id replaces the entry.
    pub fn register(&self, instance: ServiceInstance) -> Uuid {
        let id = instance.id;
        let service_name = instance.service_name.clone();
        let endpoint = instance.endpoint.clone();

        if self.locations.contains_key(&id) {
            self.remove_entry(id);
        }
        if instance.health == HealthStatus::Unhealthy {
            self.unhealthy_since.insert(id, Instant::now());
        }

        self.services
            .write()
            .entry(service_name.clone())
            .or_default()
            .push(instance);
        self.locations.insert(id, service_name.clone());

        log_service_operation(
            "register",
            &service_name,
            Some(&id.to_string()),
            "registered",
            Some(&endpoint),
        );
        self.publish(OrchestrationEvent::ServiceRegistered {
            service_name,
            instance_id: id,
            endpoint,
        });
        id
    }

    fn remove_entry(&self, instance_id: Uuid) -> Option<ServiceInstance> {
        let (_, service_name) = self.locations.remove(&instance_id)?;
        self.unhealthy_since.remove(&instance_id);

        let mut services = self.services.write();
        let instances = services.get_mut(&service_name)?;
        let position = instances.iter().position(|i| i.id == instance_id)?;
        let removed = instances.remove(position);
        if instances.is_empty() {
            services.remove(&service_name);
        }
        Some(removed)
    }

    pub fn deregister(&self, instance_id: Uuid, reason: &str) -> Option<ServiceInstance> {
        let removed = self.remove_entry(instance_id)?;
        log_service_operation(
            "deregister",
            &removed.service_name,
            Some(&instance_id.to_string()),
            "deregistered",
            Some(reason),
        );
        self.publish(OrchestrationEvent::ServiceDeregistered {
            service_name: removed.service_name.clone(),
            instance_id,
            reason: reason.to_string(),
        });
        Some(removed)
    }

    pub fn get(&self, instance_id: Uuid) -> Option<ServiceInstance> {
        let service_name = self.locations.get(&instance_id)?.value().clone();
        self.services
            .read()
            .get(&service_name)?
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
    }

    /// Instances of a service in registration order
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.services
            .read()
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_instances(&self) -> Vec<ServiceInstance> {
        let services = self.services.read();
        let mut names: Vec<&String> = services.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| services[name].iter().cloned())
            .collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_service(&self, service_name: &str) -> bool {
        self.services.read().contains_key(service_name)
    }

    pub fn instance_count(&self) -> usize {
        self.locations.len()
    }

    fn with_instance<R>(
        &self,
        instance_id: Uuid,
        f: impl FnOnce(&mut ServiceInstance) -> R,
    ) -> Option<R> {
        let service_name = self.locations.get(&instance_id)?.value().clone();
        let mut services = self.services.write();
        let instance = services
            .get_mut(&service_name)?
            .iter_mut()
            .find(|i| i.id == instance_id)?;
        Some(f(instance))
    }

    /// Apply a health check result. Returns the previous status when the instance
    /// is still registered.
    pub fn update_health(
        &self,
        instance_id: Uuid,
        result: &HealthCheckResult,
    ) -> Option<HealthStatus> {
        let (previous, service_name) = self.with_instance(instance_id, |instance| {
            let previous = instance.health;
            instance.health = result.status;
            instance.last_health_check = Some(chrono::Utc::now());
            if let Some(load) = &result.load {
                instance.load = load.clone();
            } else if result.status != HealthStatus::Unhealthy {
                instance.load.response_time_ms = result.response_time_ms;
            }
            (previous, instance.service_name.clone())
        })?;

        if result.status == HealthStatus::Unhealthy {
            self.unhealthy_since
                .entry(instance_id)
                .or_insert_with(Instant::now);
        } else {
            self.unhealthy_since.remove(&instance_id);
        }

        if previous != result.status {
            if result.status == HealthStatus::Unhealthy {
                warn!(
                    service = %service_name,
                    instance_id = %instance_id,
                    from = %previous,
                    message = result.message.as_deref(),
                    "🔴 Service instance unhealthy"
                );
            } else {
                debug!(
                    service = %service_name,
                    instance_id = %instance_id,
                    from = %previous,
                    to = %result.status,
                    "Service instance health changed"
                );
            }
            self.publish(OrchestrationEvent::ServiceHealthChanged {
                service_name,
                instance_id,
                from: previous,
                to: result.status,
            });
        }
        Some(previous)
    }

    /// Replace the load an instance reports about itself
    pub fn report_load(&self, instance_id: Uuid, load: ServiceLoad) -> bool {
        self.with_instance(instance_id, |instance| instance.load = load)
            .is_some()
    }

    /// Count a job dispatched to an instance
    pub fn begin_job(&self, instance_id: Uuid) {
        self.with_instance(instance_id, |instance| {
            instance.load.active_jobs = instance.load.active_jobs.saturating_add(1);
        });
    }

    /// Post-call load report: frees the slot and feeds the performance profile
    pub fn end_job(&self, instance_id: Uuid, duration: Duration, success: bool) {
        self.with_instance(instance_id, |instance| {
            instance.load.active_jobs = instance.load.active_jobs.saturating_sub(1);
            instance.performance.record(duration, success);
            instance.load.response_time_ms = instance.performance.average_response_ms;
        });
    }

    /// Deregister instances that have been unhealthy for at least `after`
    pub fn evict_unhealthy(&self, after: Duration) -> Vec<ServiceInstance> {
        let expired: Vec<Uuid> = self
            .unhealthy_since
            .iter()
            .filter(|entry| entry.value().elapsed() >= after)
            .map(|entry| *entry.key())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.deregister(id, "unhealthy beyond eviction window"))
            .collect()
    }

    pub fn health_summary(&self, service_name: &str) -> ServiceHealthSummary {
        let mut summary = ServiceHealthSummary {
            service_name: service_name.to_string(),
            ..ServiceHealthSummary::default()
        };
        if let Some(instances) = self.services.read().get(service_name) {
            for instance in instances {
                summary.total += 1;
                match instance.health {
                    HealthStatus::Healthy => summary.healthy += 1,
                    HealthStatus::Degraded => summary.degraded += 1,
                    HealthStatus::Unhealthy => summary.unhealthy += 1,
                    HealthStatus::Unknown => summary.unknown += 1,
                }
            }
        }
        summary
    }

    pub fn health_summaries(&self) -> Vec<ServiceHealthSummary> {
        self.service_names()
            .iter()
            .map(|name| self.health_summary(name))
            .collect()
    }
}
