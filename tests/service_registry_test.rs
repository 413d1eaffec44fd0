//! Service registration, load reports and background health probing as seen
//! through the orchestrator

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use reelflow_core::models::{
    HealthCheckResult, HealthStatus, ServiceCapacity, ServiceInstance, ServiceLoad, StepType,
};
use reelflow_core::orchestration::{HealthVerdict, JobStatus};
use reelflow_core::registry::HealthChecker;

/// Reports every instance whose endpoint mentions `down` as unhealthy
struct EndpointChecker;

#[async_trait]
impl HealthChecker for EndpointChecker {
    async fn check(&self, instance: &ServiceInstance) -> HealthCheckResult {
        if instance.endpoint.contains("down") {
            HealthCheckResult::unhealthy("connection refused")
        } else {
            HealthCheckResult::healthy(3.0)
        }
    }
}

fn instance_ids(t: &TestOrchestrator, service: &str) -> Vec<uuid::Uuid> {
    t.orchestrator
        .get_registered_services()
        .into_iter()
        .find(|(name, _)| name == service)
        .map(|(_, instances)| instances.into_iter().map(|i| i.id).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_registered_services_are_grouped_by_name() {
    let t = build_orchestrator(test_config(), ScriptedExecutor::new());

    let services = t.orchestrator.get_registered_services();
    let names: Vec<&str> = services.iter().map(|(name, _)| name.as_str()).collect();

    let mut expected = t.orchestrator.config().workflow.services.services();
    expected.sort();
    assert_eq!(names, expected);
    assert!(services.iter().all(|(_, instances)| instances.len() == 2));
    assert!(services
        .iter()
        .flat_map(|(_, instances)| instances)
        .all(|i| i.health == HealthStatus::Healthy));
}

#[tokio::test]
async fn test_removing_last_instance_drops_service_breakers() {
    let t = build_orchestrator(test_config(), ScriptedExecutor::new());
    let breakers = t.orchestrator.circuit_breakers();
    breakers.get_circuit_breaker("encoder-service", "execute");
    breakers.get_circuit_breaker("render-service", "execute");

    let encoders = instance_ids(&t, "encoder-service");
    assert_eq!(encoders.len(), 2);

    let first = t
        .orchestrator
        .deregister_service(encoders[0], "scale-in")
        .expect("registered instance");
    assert_eq!(first.service_name, "encoder-service");
    // One encoder left, its breaker stays
    assert!(breakers
        .list_components()
        .contains(&"encoder-service::execute".to_string()));

    t.orchestrator.deregister_service(encoders[1], "scale-in");
    assert_eq!(breakers.list_components(), vec!["render-service::execute"]);
    assert!(instance_ids(&t, "encoder-service").is_empty());

    assert!(t
        .orchestrator
        .deregister_service(encoders[0], "already gone")
        .is_none());

    // Encoding is now impossible, so the health verdict says so
    let health = t.orchestrator.get_system_health();
    assert_eq!(health.status, HealthVerdict::Degraded);
    assert!(health
        .issues
        .iter()
        .any(|issue| issue.component == "service.encoder-service"));
}

#[tokio::test]
async fn test_reported_load_steers_least_connections() {
    let t = build_orchestrator(test_config(), ScriptedExecutor::new());
    let renderers = instance_ids(&t, "render-service");

    let busy = ServiceLoad {
        active_jobs: 7,
        queued_jobs: 2,
        resource_utilization: 0.9,
        response_time_ms: 400.0,
    };
    assert!(t.orchestrator.registry().report_load(renderers[0], busy));
    assert!(!t
        .orchestrator
        .registry()
        .report_load(uuid::Uuid::new_v4(), ServiceLoad::default()));

    for _ in 0..5 {
        let chosen = t
            .orchestrator
            .load_balancer()
            .select("render-service", StepType::Rendering)
            .expect("healthy renderers");
        assert_eq!(chosen.id, renderers[1]);
    }
}

#[tokio::test]
async fn test_background_probing_routes_around_failing_instance() {
    let mut config = test_config();
    config.load_balancer.health_check_interval_ms = 10;
    let t = build_orchestrator(config, ScriptedExecutor::new());
    let failing = t.orchestrator.register_service(
        ServiceInstance::new(
            "render-service",
            "http://render-service-down:8080",
            ServiceCapacity {
                max_concurrent_jobs: 8,
                supported_job_types: vec![],
            },
        )
        .with_health(HealthStatus::Healthy),
    );

    t.orchestrator.start_background_tasks(Arc::new(EndpointChecker));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let marked = t
            .orchestrator
            .registry()
            .instances("render-service")
            .iter()
            .any(|i| i.id == failing && i.health == HealthStatus::Unhealthy);
        if marked {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "health check never ran");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for _ in 0..10 {
        let chosen = t
            .orchestrator
            .load_balancer()
            .select("render-service", StepType::Rendering)
            .expect("two healthy renderers remain");
        assert_ne!(chosen.id, failing);
    }

    // One of three renderers down is degraded, not unhealthy
    let health = t.orchestrator.get_system_health();
    assert_eq!(health.status, HealthVerdict::Degraded);
    let render = health
        .services
        .iter()
        .find(|s| s.service_name == "render-service")
        .expect("render summary");
    assert_eq!((render.total, render.unhealthy), (3, 1));

    let result = t.orchestrator.orchestrate(simple_request("job-checked")).await;
    assert_eq!(result.job_status, JobStatus::Completed);

    let report = t.orchestrator.shutdown().await;
    assert_eq!(report.killed, 0);
}
