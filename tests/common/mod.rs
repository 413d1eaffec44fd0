//! Shared fixtures for the integration tests

#![allow(dead_code)]

pub mod builders;
pub mod scripted_executor;
pub mod strategies;

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use reelflow_core::analytics::InMemoryHistorySink;
use reelflow_core::config::OrchestratorConfig;
use reelflow_core::models::{HealthStatus, RetryPolicy, ServiceCapacity, ServiceInstance};
use reelflow_core::orchestration::{InMemoryStatusSink, MasterOrchestrator, WorkflowStatusView};

pub use builders::*;
pub use scripted_executor::ScriptedExecutor;

/// Orchestrator wired to in-memory sinks and a scripted executor
pub struct TestOrchestrator {
    pub orchestrator: Arc<MasterOrchestrator>,
    pub executor: Arc<ScriptedExecutor>,
    pub status_sink: Arc<InMemoryStatusSink>,
    pub history: Arc<InMemoryHistorySink>,
}

/// Default configuration with millisecond retries and quick breaker recovery
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.retry = RetryPolicy {
        max_retries: 2,
        backoff_ms: 1,
        backoff_multiplier: 1.0,
        max_backoff_ms: 5,
        jitter: 0.0,
        retry_conditions: vec![],
    };
    config.circuit_breakers.recovery_timeout_ms = 100;
    config.workflow.shutdown_grace_ms = 200;
    config
}

pub fn build_orchestrator(config: OrchestratorConfig, executor: ScriptedExecutor) -> TestOrchestrator {
    let executor = Arc::new(executor);
    let status_sink = Arc::new(InMemoryStatusSink::new());
    let history = Arc::new(InMemoryHistorySink::new(100));

    let orchestrator = MasterOrchestrator::builder(config)
        .with_executor(executor.clone())
        .with_status_sink(status_sink.clone())
        .with_history_sink(history.clone())
        .build()
        .expect("test configuration should build");
    register_default_services(&orchestrator, 2);

    TestOrchestrator {
        orchestrator: Arc::new(orchestrator),
        executor,
        status_sink,
        history,
    }
}

/// Register `per_service` healthy instances for every service a template uses
pub fn register_default_services(orchestrator: &MasterOrchestrator, per_service: usize) {
    let services = orchestrator.config().workflow.services.services();
    for service in services {
        for n in 0..per_service {
            orchestrator.register_service(healthy_instance(&service, n));
        }
    }
}

pub fn healthy_instance(service: &str, n: usize) -> ServiceInstance {
    ServiceInstance::new(
        service,
        format!("http://{service}-{n}:8080"),
        ServiceCapacity {
            max_concurrent_jobs: 8,
            supported_job_types: vec![],
        },
    )
    .with_health(HealthStatus::Healthy)
}

/// Poll a workflow until `done` holds or `timeout` passes
pub async fn wait_for_workflow<F>(
    orchestrator: &MasterOrchestrator,
    workflow_id: Uuid,
    timeout: Duration,
    done: F,
) -> WorkflowStatusView
where
    F: Fn(&WorkflowStatusView) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let view = orchestrator
            .get_workflow_status(workflow_id)
            .expect("workflow should be tracked");
        if done(&view) {
            return view;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow {workflow_id} stuck in {} at step {}",
            view.state,
            view.current_step
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub async fn wait_until_finished(
    orchestrator: &MasterOrchestrator,
    workflow_id: Uuid,
) -> WorkflowStatusView {
    wait_for_workflow(orchestrator, workflow_id, Duration::from_secs(10), |view| {
        view.state.is_terminal()
    })
    .await
}
