//! End-to-end orchestration scenarios against a scripted backing pipeline

mod common;

use std::time::Duration;

use common::*;
use reelflow_core::error::StepError;
use reelflow_core::events::OrchestrationEvent;
use reelflow_core::models::{ProcessingStrategy, ResourceStatus, ResourceType};
use reelflow_core::orchestration::{HealthVerdict, JobStatus, OrchestrationStatus};
use reelflow_core::resilience::CircuitState;
use reelflow_core::WorkflowState;

fn drain_events(
    receiver: &mut tokio::sync::broadcast::Receiver<reelflow_core::events::PublishedEvent>,
) -> Vec<OrchestrationEvent> {
    let mut events = Vec::new();
    while let Ok(published) = receiver.try_recv() {
        events.push(published.event);
    }
    events
}

#[tokio::test]
async fn test_simple_job_runs_inline_and_completes() {
    let t = build_orchestrator(test_config(), ScriptedExecutor::new());

    let result = t.orchestrator.orchestrate(simple_request("job-simple")).await;

    assert_eq!(result.status, OrchestrationStatus::Immediate);
    assert_eq!(result.job_status, JobStatus::Completed);
    assert_eq!(result.strategy, Some(ProcessingStrategy::QuickSync));
    assert_eq!(
        result.result_url.as_deref(),
        Some("https://cdn.example.com/job-simple.mp4")
    );
    assert!(result.error.is_none());

    // quick_sync is render then upload, nothing else
    assert_eq!(t.executor.call_log(), vec!["render", "upload"]);

    let utilization = t.orchestrator.get_resource_utilization();
    assert_eq!(utilization.active_allocations, 0);
    for resource_type in ResourceType::ALL {
        assert_eq!(utilization.reserved(resource_type), 0.0);
    }

    assert_eq!(
        t.status_sink.latest_status("job-simple"),
        Some(JobStatus::Completed)
    );
    let summary = t.history.find("job-simple").expect("summary recorded");
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.strategy, ProcessingStrategy::QuickSync);
    assert_eq!(summary.steps.len(), 2);
}

#[tokio::test]
async fn test_distributed_job_is_queued_and_progresses_in_order() {
    let t = build_orchestrator(
        test_config(),
        ScriptedExecutor::new().with_delay(Duration::from_millis(10)),
    );

    let result = t
        .orchestrator
        .orchestrate(distributed_request("job-distributed"))
        .await;

    assert_eq!(result.status, OrchestrationStatus::Queued);
    assert_eq!(result.strategy, Some(ProcessingStrategy::Distributed));
    let workflow_id = result.workflow_id.expect("queued jobs carry a workflow id");

    // The allocation is held while the workflow runs
    assert_eq!(
        t.orchestrator
            .get_resource_utilization()
            .reserved(ResourceType::Gpu),
        2.0
    );

    let mut observed = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let finished = loop {
        let view = t
            .orchestrator
            .get_workflow_status(workflow_id)
            .expect("workflow is tracked");
        observed.push(view.current_step);
        if view.state.is_terminal() {
            break view;
        }
        assert!(tokio::time::Instant::now() < deadline, "workflow did not finish");
        tokio::time::sleep(Duration::from_millis(1)).await;
    };

    assert_eq!(finished.state, WorkflowState::Completed);
    assert!(
        observed.windows(2).all(|pair| pair[0] <= pair[1]),
        "current_step went backwards: {observed:?}"
    );
    assert_eq!(finished.current_step, finished.total_steps);
    assert_eq!(finished.rollback_count, 0);

    for segment in 0..4 {
        assert_eq!(t.executor.calls(&format!("download_{segment}")), 1);
        assert_eq!(t.executor.calls(&format!("render_{segment}")), 1);
    }
    assert_eq!(t.executor.calls("preprocess"), 1);
    assert_eq!(t.executor.calls("compose"), 1);
    // Cleanup only runs on failure
    assert_eq!(t.executor.calls("cleanup"), 0);

    let status = t
        .orchestrator
        .get_job_status("job-distributed")
        .expect("job is tracked");
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.progress_percent, 100.0);
    assert_eq!(
        status.result_url.as_deref(),
        Some("https://cdn.example.com/job-distributed.mp4")
    );
    assert_eq!(status.allocation_status, Some(ResourceStatus::Released));
    assert_eq!(t.orchestrator.get_resource_utilization().active_allocations, 0);
    assert!(t.orchestrator.get_active_workflows().is_empty());
}

#[tokio::test]
async fn test_gpu_over_request_is_refused_without_reserving() {
    let mut config = test_config();
    config.resources.gpu_units = 1.0;
    let t = build_orchestrator(config, ScriptedExecutor::new());
    let mut events = t.orchestrator.events().subscribe();
    let before = t.orchestrator.get_resource_utilization();

    let result = t
        .orchestrator
        .orchestrate(distributed_request("job-gpu"))
        .await;

    assert!(result.is_failed());
    assert_eq!(result.job_status, JobStatus::Failed);
    let error = result.error.expect("failed result carries an error");
    assert_eq!(error.code, "RESOURCE_EXHAUSTED");
    assert!(error.message.contains("gpu"), "message: {}", error.message);
    assert!(result.workflow_id.is_none());

    let after = t.orchestrator.get_resource_utilization();
    assert_eq!(before.dimensions, after.dimensions);
    assert_eq!(after.active_allocations, 0);
    assert_eq!(t.executor.total_calls(), 0);

    let exhausted = drain_events(&mut events).into_iter().find_map(|event| match event {
        OrchestrationEvent::ResourcesExhausted {
            resource_type,
            requested,
            available,
            ..
        } => Some((resource_type, requested, available)),
        _ => None,
    });
    assert_eq!(exhausted, Some((ResourceType::Gpu, 2.0, 1.0)));

    let status = t.orchestrator.get_job_status("job-gpu").expect("rejection is tracked");
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(
        t.status_sink.latest_status("job-gpu"),
        Some(JobStatus::Failed)
    );
}

#[tokio::test]
async fn test_encode_failure_rolls_back_to_validation_checkpoint() {
    // Three failures exhaust the default two retries on the first pass
    let t = build_orchestrator(test_config(), ScriptedExecutor::new().fail_step("encode", 3));
    let mut events = t.orchestrator.events().subscribe();

    let result = t
        .orchestrator
        .orchestrate(balanced_request("job-rollback"))
        .await;
    assert_eq!(result.status, OrchestrationStatus::Queued);
    assert_eq!(result.strategy, Some(ProcessingStrategy::BalancedAsync));
    let workflow_id = result.workflow_id.expect("workflow id");

    let finished = wait_until_finished(&t.orchestrator, workflow_id).await;
    assert_eq!(finished.state, WorkflowState::Completed);
    assert_eq!(finished.rollback_count, 1);

    assert_eq!(t.executor.calls("validation"), 2);
    assert_eq!(t.executor.calls("download_assets"), 2);
    assert_eq!(t.executor.calls("render"), 2);
    assert_eq!(t.executor.calls("encode"), 4);
    assert_eq!(t.executor.calls("upload"), 1);
    // No effects on the timeline
    assert_eq!(t.executor.calls("preprocess"), 0);
    assert!(finished.skipped_steps.contains(&"preprocess".to_string()));

    let rolled_back = drain_events(&mut events).into_iter().find_map(|event| match event {
        OrchestrationEvent::WorkflowRolledBack {
            checkpoint,
            rollback_count,
            ..
        } => Some((checkpoint, rollback_count)),
        _ => None,
    });
    assert_eq!(rolled_back, Some(("validation".to_string(), 1)));

    let summary = t.history.find("job-rollback").expect("summary recorded");
    assert_eq!(summary.rollbacks, 1);
}

#[tokio::test]
async fn test_permanent_failure_fails_job_and_runs_cleanup() {
    let t = build_orchestrator(
        test_config(),
        ScriptedExecutor::new().fail_step_with("upload", 1, StepError::permanent("bucket missing")),
    );

    let result = t
        .orchestrator
        .orchestrate(balanced_request("job-upload"))
        .await;
    let workflow_id = result.workflow_id.expect("workflow id");
    let finished = wait_until_finished(&t.orchestrator, workflow_id).await;

    assert_eq!(finished.state, WorkflowState::Failed);
    // Permanent failures are not retried
    assert_eq!(t.executor.calls("upload"), 1);
    assert_eq!(t.executor.calls("cleanup"), 1);

    let status = t.orchestrator.get_job_status("job-upload").expect("tracked");
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.allocation_status, Some(ResourceStatus::Failed));
    let error = status.error.expect("failure carries an error");
    assert_eq!(error.code, "WORKFLOW_STEP_FAILED");
    assert!(error.message.contains("upload"));
    assert_eq!(t.orchestrator.get_resource_utilization().active_allocations, 0);
}

#[tokio::test]
async fn test_open_circuit_surfaces_as_service_unavailable() {
    let mut config = test_config();
    config.circuit_breakers.failure_threshold = 2;
    config.circuit_breakers.recovery_timeout_ms = 60_000;
    config.workflow.max_unavailable_waits = 0;
    config.workflow.max_rollbacks = 0;
    let t = build_orchestrator(
        config,
        ScriptedExecutor::new().fail_step_with(
            "render",
            10,
            StepError::ServiceError {
                status: 503,
                message: "render farm overloaded".to_string(),
            },
        ),
    );

    let mut events = t.orchestrator.events().subscribe();
    let result = t
        .orchestrator
        .orchestrate(balanced_request("job-breaker"))
        .await;
    let finished = wait_until_finished(&t.orchestrator, result.workflow_id.expect("id")).await;

    assert_eq!(finished.state, WorkflowState::Failed);
    // The third attempt never reached the service
    assert_eq!(t.executor.calls("render"), 2);

    let status = t.orchestrator.get_job_status("job-breaker").expect("tracked");
    assert_eq!(
        status.error.map(|e| e.code),
        Some("SERVICE_UNAVAILABLE".to_string())
    );

    let health = t.orchestrator.get_system_health();
    assert_eq!(health.status, HealthVerdict::Degraded);
    assert!(!health.open_circuits.is_empty());

    // The breaker's own transition reaches the event bus
    let opened: Vec<String> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            OrchestrationEvent::CircuitStateChanged {
                breaker,
                from: CircuitState::Closed,
                to: CircuitState::Open,
            } => Some(breaker),
            _ => None,
        })
        .collect();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].starts_with("render-service"));
}

#[tokio::test]
async fn test_forced_breaker_transitions_are_published() {
    let t = build_orchestrator(test_config(), ScriptedExecutor::new());
    let mut events = t.orchestrator.events().subscribe();

    let breaker = t
        .orchestrator
        .circuit_breakers()
        .get_circuit_breaker("encoder-service", "encoding");
    breaker.force_open();
    breaker.force_closed();

    let transitions: Vec<(CircuitState, CircuitState)> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            OrchestrationEvent::CircuitStateChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_duplicate_submission_does_not_disturb_running_job() {
    let t = build_orchestrator(
        test_config(),
        ScriptedExecutor::new().with_delay(Duration::from_millis(20)),
    );

    let first = t.orchestrator.orchestrate(balanced_request("job-dup")).await;
    assert_eq!(first.status, OrchestrationStatus::Queued);

    let second = t.orchestrator.orchestrate(balanced_request("job-dup")).await;
    assert!(second.is_failed());
    assert_eq!(second.error.map(|e| e.code), Some("VALIDATION_ERROR".to_string()));

    // The rejected duplicate released its own allocation
    assert_eq!(t.orchestrator.get_resource_utilization().active_allocations, 1);

    let finished = wait_until_finished(&t.orchestrator, first.workflow_id.expect("id")).await;
    assert_eq!(finished.state, WorkflowState::Completed);
    assert_eq!(
        t.orchestrator.get_job_status("job-dup").map(|s| s.status),
        Some(JobStatus::Completed)
    );
}

#[tokio::test]
async fn test_analytics_report_reflects_finished_jobs() {
    let t = build_orchestrator(test_config(), ScriptedExecutor::new());

    for n in 0..3 {
        let result = t
            .orchestrator
            .orchestrate(simple_request(&format!("job-{n}")))
            .await;
        assert_eq!(result.job_status, JobStatus::Completed);
    }

    let report = t.orchestrator.get_system_analytics();
    assert_eq!(report.jobs.total, 3);
    assert_eq!(report.jobs.completed, 3);
    assert_eq!(report.jobs.success_rate, 1.0);
    assert!(report
        .strategies
        .iter()
        .any(|s| s.strategy == ProcessingStrategy::QuickSync && s.jobs == 3));
    assert_eq!(t.history.len(), 3);
}
