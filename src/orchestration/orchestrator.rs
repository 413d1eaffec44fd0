//! # Master Orchestrator
//!
//! Top-level façade over the orchestration core. Owns every shared component
//! (resource pool, service registry, breaker table, analytics) and wires them
//! into the job pipeline:
//!
//! ```text
//! request → validate → JobAnalyzer → ResourceAllocator ─┬─ quick_sync → engine (inline) → immediate
//!                                                       └─ otherwise  → engine (spawned) → queued
//! ```
//!
//! `orchestrate` is the only entry point that creates work. Everything else
//! is a read-only projection or an explicit control request.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health::{assess, HealthInputs, SystemHealthReport};
use super::job_analyzer::JobAnalyzer;
use super::status_sink::{ErrorInfo, JobStatus, JobStatusSink, TracingStatusSink};
use super::step_executor::StepExecutor;
use super::types::{JobStatusView, OrchestrationResult, WorkflowStatusView};
use super::workflow_builder::WorkflowBuilder;
use super::workflow_engine::{EngineComponents, ShutdownReport, WorkflowEngine};
use crate::analytics::{AnalyticsEngine, HistorySink, SystemAnalyticsReport, TracingHistorySink};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::events::{EventPublisher, OrchestrationEvent};
use crate::logging::{log_error, log_job_operation};
use crate::models::{
    AllocatedResources, AllocationOwner, JobAnalysis, ResourceUtilization, ServiceInstance,
    VideoJobRequest, WorkflowContext, WorkflowExecution,
};
use crate::registry::{HealthMonitor, HealthChecker, InstanceScorer, LoadBalancer, ServiceRegistry};
use crate::resilience::CircuitBreakerManager;
use crate::resources::{CapacitySample, ResourceAllocator, ResourcePool};
use crate::state_machine::WorkflowState;
use crate::validation::validate_job_request;

/// Assembles a [`MasterOrchestrator`]. Only the step executor is required.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    executor: Option<Arc<dyn StepExecutor>>,
    status_sink: Option<Arc<dyn JobStatusSink>>,
    history_sinks: Vec<Arc<dyn HistorySink>>,
    scorer: Option<Arc<dyn InstanceScorer>>,
    events: Option<EventPublisher>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            executor: None,
            status_sink: None,
            history_sinks: Vec::new(),
            scorer: None,
            events: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn JobStatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    pub fn with_history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history_sinks.push(sink);
        self
    }

    /// Scoring function for the `ai_driven` load balancing strategy
    pub fn with_scorer(mut self, scorer: Arc<dyn InstanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<MasterOrchestrator> {
        self.config.validate()?;
        let executor = self.executor.ok_or_else(|| {
            OrchestratorError::Configuration("a step executor is required".to_string())
        })?;
        let config = self.config;
        let events = self.events.unwrap_or_default();
        let status_sink = self
            .status_sink
            .unwrap_or_else(|| Arc::new(TracingStatusSink));

        let pool = Arc::new(ResourcePool::new(
            config.resources.node_id.clone(),
            config.resources.totals(),
        ));
        let allocator = Arc::new(ResourceAllocator::new(pool));
        let registry = Arc::new(ServiceRegistry::with_events(events.clone()));
        let mut load_balancer = LoadBalancer::new(registry.clone(), config.load_balancer.strategy);
        if let Some(scorer) = self.scorer {
            load_balancer = load_balancer.with_scorer(scorer);
        }
        let load_balancer = Arc::new(load_balancer);
        // Breaker transitions go out on the event bus
        let breakers = Arc::new(CircuitBreakerManager::with_collector(
            config.circuit_breakers.to_breaker_config(),
            Arc::new(events.clone()),
        ));

        let sinks = if self.history_sinks.is_empty() {
            vec![Arc::new(TracingHistorySink) as Arc<dyn HistorySink>]
        } else {
            self.history_sinks
        };
        let analytics = Arc::new(
            sinks
                .into_iter()
                .fold(AnalyticsEngine::new(config.analytics.clone()), |engine, sink| {
                    engine.with_sink(sink)
                }),
        );

        let engine = WorkflowEngine::new(EngineComponents {
            config: config.workflow.clone(),
            load_balancer: load_balancer.clone(),
            breakers: breakers.clone(),
            allocator: allocator.clone(),
            executor,
            status_sink: status_sink.clone(),
            analytics: analytics.clone(),
            events: events.clone(),
        });

        let (shutdown, _) = watch::channel(false);
        info!(
            node_id = %config.resources.node_id,
            strategy = ?config.load_balancer.strategy,
            "🚀 Master orchestrator ready"
        );

        Ok(MasterOrchestrator {
            analyzer: JobAnalyzer::new(config.analyzer.clone()),
            builder: WorkflowBuilder::new(config.workflow.clone(), config.retry.clone()),
            required_services: config.required_services(),
            config,
            allocator,
            registry,
            load_balancer,
            breakers,
            analytics,
            engine,
            status_sink,
            events,
            rejected: Arc::new(DashMap::new()),
            shutdown,
            background: Mutex::new(Vec::new()),
        })
    }
}

struct RejectedJob {
    result: OrchestrationResult,
    rejected_at: Instant,
}

pub struct MasterOrchestrator {
    config: OrchestratorConfig,
    analyzer: JobAnalyzer,
    builder: WorkflowBuilder,
    required_services: Vec<String>,
    allocator: Arc<ResourceAllocator>,
    registry: Arc<ServiceRegistry>,
    load_balancer: Arc<LoadBalancer>,
    breakers: Arc<CircuitBreakerManager>,
    analytics: Arc<AnalyticsEngine>,
    engine: WorkflowEngine,
    status_sink: Arc<dyn JobStatusSink>,
    events: EventPublisher,
    /// Jobs that failed before reaching the workflow engine
    rejected: Arc<DashMap<String, RejectedJob>>,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MasterOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterOrchestrator")
            .field("node_id", &self.config.resources.node_id)
            .field("engine", &self.engine)
            .field("rejected", &self.rejected.len())
            .finish()
    }
}

impl MasterOrchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.load_balancer
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn analytics(&self) -> &Arc<AnalyticsEngine> {
        &self.analytics
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Run one job through analysis, allocation and execution. Failures are
    /// reported in the result, never as an `Err`.
    pub async fn orchestrate(&self, request: VideoJobRequest) -> OrchestrationResult {
        let job_id = request.id.clone();
        if self.engine.is_shutting_down() {
            let err = OrchestratorError::ServiceUnavailable {
                service: "orchestrator".to_string(),
                reason: "shutting down".to_string(),
            };
            return self.reject(&job_id, &err, None).await;
        }

        if let Err(err) = validate_job_request(&request) {
            return self.reject(&job_id, &err, None).await;
        }

        let analysis = self.analyzer.analyze(&request);
        self.events.publish(OrchestrationEvent::JobAnalyzed {
            job_id: job_id.clone(),
            complexity: analysis.complexity,
            strategy: analysis.strategy,
            estimated_duration_secs: analysis.estimated_duration_secs,
        });
        log_job_operation(
            "analyze",
            &job_id,
            Some(&analysis.strategy.to_string()),
            "analyzed",
            Some(&format!(
                "complexity={} score={:.2} estimate_secs={:.1}",
                analysis.complexity, analysis.complexity_score, analysis.estimated_duration_secs
            )),
        );

        let allocation = match self.allocate(&analysis).await {
            Ok(allocation) => allocation,
            Err(err) => return self.reject(&job_id, &err, Some(&analysis)).await,
        };
        self.events.publish(OrchestrationEvent::ResourcesAllocated {
            allocation_id: allocation.id,
            job_id: job_id.clone(),
        });

        match self.execute(request, analysis.clone(), allocation).await {
            Ok(result) => {
                self.rejected.remove(&job_id);
                result
            }
            Err(err) => self.reject(&job_id, &err, Some(&analysis)).await,
        }
    }

    async fn allocate(&self, analysis: &JobAnalysis) -> Result<AllocatedResources> {
        let wait = self.config.resources.allocation_wait();
        let allocated = if analysis.strategy.is_synchronous() || wait.is_zero() {
            self.allocator.allocate(analysis)
        } else {
            self.allocator.allocate_with_wait(analysis, wait).await
        };
        allocated.map_err(|err| {
            self.events.publish(OrchestrationEvent::ResourcesExhausted {
                job_id: analysis.job_id.clone(),
                resource_type: err.resource_type,
                requested: err.requested,
                available: err.available,
            });
            OrchestratorError::Resource(err)
        })
    }

    /// Build and run the workflow. On any error the allocation is released
    /// before returning.
    async fn execute(
        &self,
        request: VideoJobRequest,
        analysis: JobAnalysis,
        allocation: AllocatedResources,
    ) -> Result<OrchestrationResult> {
        let allocation_id = allocation.id;
        let started = self.start_execution(request, analysis, allocation).await;
        if started.is_err() {
            self.allocator.release_failed(allocation_id);
        }
        started
    }

    async fn start_execution(
        &self,
        request: VideoJobRequest,
        analysis: JobAnalysis,
        allocation: AllocatedResources,
    ) -> Result<OrchestrationResult> {
        let job_id = request.id.clone();
        let strategy = analysis.strategy;
        let definition = self.builder.build(&request, &analysis)?;
        let mut execution =
            WorkflowExecution::new(definition, WorkflowContext::new(request, analysis, allocation));

        let owner = if strategy.is_synchronous() {
            AllocationOwner::Immediate(job_id.clone())
        } else {
            AllocationOwner::Workflow(execution.id)
        };
        execution.context.allocation = self
            .allocator
            .activate(execution.context.allocation.id, owner)?;

        if strategy.is_synchronous() {
            let done = self.engine.run_inline(execution).await?;
            return Ok(self.inline_result(&done));
        }

        self.status_sink
            .record_status(&job_id, JobStatus::Queued, None)
            .await;
        let workflow_id = self.engine.start(execution)?;
        log_job_operation(
            "orchestrate",
            &job_id,
            Some(&strategy.to_string()),
            "queued",
            Some(&format!("workflow_id={workflow_id}")),
        );
        Ok(OrchestrationResult::queued(job_id, strategy, workflow_id))
    }

    fn inline_result(&self, done: &WorkflowExecution) -> OrchestrationResult {
        let strategy = done.definition.strategy;
        let result = if done.state == WorkflowState::Completed {
            OrchestrationResult::immediate(
                done.job_id.clone(),
                strategy,
                done.id,
                done.context.result_url(),
            )
        } else {
            let view = JobStatusView::from_execution(done);
            let error = view.error.unwrap_or_else(|| {
                ErrorInfo::from(&OrchestratorError::ServiceUnavailable {
                    service: "orchestrator".to_string(),
                    reason: format!("job {} ended in state {}", done.job_id, done.state),
                })
            });
            let mut result = OrchestrationResult::failed(done.job_id.clone(), error)
                .with_strategy(strategy)
                .with_workflow(done.id);
            result.job_status = JobStatus::from(done.state);
            result
        };
        log_job_operation(
            "orchestrate",
            &done.job_id,
            Some(&strategy.to_string()),
            &result.status.to_string(),
            None,
        );
        result
    }

    async fn reject(
        &self,
        job_id: &str,
        err: &OrchestratorError,
        analysis: Option<&JobAnalysis>,
    ) -> OrchestrationResult {
        let mut result = OrchestrationResult::from_error(job_id, err);
        if let Some(analysis) = analysis {
            result = result.with_strategy(analysis.strategy);
        }
        let error = ErrorInfo::from(err);

        warn!(
            job_id = job_id,
            error_code = %error.code,
            error = %error.message,
            "🚫 Job rejected"
        );
        self.events.publish(OrchestrationEvent::JobRejected {
            job_id: job_id.to_string(),
            error_code: error.code.clone(),
            message: error.message.clone(),
        });
        // A duplicate submission must not overwrite the running job's status
        if self.engine.workflow_for_job(job_id).is_none() {
            self.status_sink
                .record_status(job_id, JobStatus::Failed, Some(&error))
                .await;
            self.rejected.insert(
                job_id.to_string(),
                RejectedJob {
                    result: result.clone(),
                    rejected_at: Instant::now(),
                },
            );
        }
        result
    }

    /// Current status of a job, from its workflow if it has one
    pub fn get_job_status(&self, job_id: &str) -> Option<JobStatusView> {
        if let Some(execution) = self.engine.find_by_job(job_id) {
            let mut view = JobStatusView::from_execution(&execution);
            if let Some(allocation) = self.allocator.get(execution.context.allocation.id) {
                view.allocation_status = Some(allocation.status);
            }
            return Some(view);
        }
        self.rejected
            .get(job_id)
            .map(|rejected| JobStatusView::rejected(&rejected.result))
    }

    pub fn get_workflow_status(&self, workflow_id: Uuid) -> Option<WorkflowStatusView> {
        self.engine
            .get(workflow_id)
            .map(|execution| WorkflowStatusView::from(&execution))
    }

    pub fn get_active_workflows(&self) -> Vec<WorkflowStatusView> {
        self.engine
            .active()
            .iter()
            .map(WorkflowStatusView::from)
            .collect()
    }

    pub fn get_resource_utilization(&self) -> ResourceUtilization {
        self.allocator.utilization()
    }

    /// Registered instances grouped by service name, names sorted
    pub fn get_registered_services(&self) -> Vec<(String, Vec<ServiceInstance>)> {
        let mut names = self.registry.service_names();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let instances = self.registry.instances(&name);
                (name, instances)
            })
            .collect()
    }

    pub fn get_system_health(&self) -> SystemHealthReport {
        let resources = self.allocator.utilization();
        let services = self.registry.health_summaries();
        let open_circuits = self.breakers.open_circuits();
        let (status, issues) = assess(
            &self.config.health,
            &HealthInputs {
                resources: &resources,
                services: &services,
                open_circuits: &open_circuits,
                required_services: &self.required_services,
            },
        );

        SystemHealthReport {
            status,
            resources,
            services,
            open_circuits,
            active_workflows: self.engine.active_count(),
            queued_allocations: self.allocator.queued_requests(),
            issues,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn get_system_analytics(&self) -> SystemAnalyticsReport {
        self.analytics.report(
            &self.breakers.get_system_metrics(),
            &self.registry.health_summaries(),
        )
    }

    pub fn pause_workflow(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.engine.pause(workflow_id)
    }

    pub fn resume_workflow(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.engine.resume(workflow_id)
    }

    /// Cancel the job's workflow at its next step boundary
    pub fn cancel_job(&self, job_id: &str) -> Result<WorkflowState> {
        let workflow_id = self.engine.workflow_for_job(job_id).ok_or_else(|| {
            OrchestratorError::validation("job_id", format!("job {job_id} has no workflow"))
        })?;
        self.engine.cancel(workflow_id)
    }

    pub fn register_service(&self, instance: ServiceInstance) -> Uuid {
        self.registry.register(instance)
    }

    /// Remove an instance; a service losing its last instance also loses its
    /// circuit breakers
    pub fn deregister_service(&self, instance_id: Uuid, reason: &str) -> Option<ServiceInstance> {
        let removed = self.registry.deregister(instance_id, reason)?;
        if !self.registry.has_service(&removed.service_name) {
            self.breakers.remove_service(&removed.service_name);
        }
        Some(removed)
    }

    pub fn apply_resource_telemetry(&self, samples: &[CapacitySample]) {
        self.allocator.apply_telemetry(samples);
    }

    /// Forget finished workflows and rejected jobs older than `older_than`.
    /// Returns how many jobs were dropped.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        purge(&self.engine, &self.rejected, older_than)
    }

    fn spawn_purger(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let rejected = self.rejected.clone();
        let interval = self.config.workflow.purge_interval();
        let retention = self.config.workflow.finished_retention();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let purged = purge(&engine, &rejected, retention);
                        if purged > 0 {
                            debug!(purged = purged, "🧹 Purged finished jobs");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Start the health monitor, the utilization sampler and the purge of
    /// finished jobs. All stop on [`shutdown`](Self::shutdown).
    pub fn start_background_tasks(&self, checker: Arc<dyn HealthChecker>) {
        let monitor = Arc::new(
            HealthMonitor::new(
                self.registry.clone(),
                checker,
                self.config.load_balancer.clone(),
            )
            .with_breakers(self.breakers.clone()),
        );
        let mut background = self.background.lock();
        background.push(monitor.spawn(self.shutdown.subscribe()));
        background.push(
            self.analytics
                .clone()
                .spawn_sampler(self.allocator.clone(), self.shutdown.subscribe()),
        );
        background.push(self.spawn_purger(self.shutdown.subscribe()));
        info!(tasks = background.len(), "Background tasks started");
    }

    /// Stop accepting jobs, wind down running workflows within the configured
    /// grace period, release every remaining allocation and stop background
    /// tasks.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_grace(self.config.workflow.shutdown_grace())
            .await
    }

    pub async fn shutdown_with_grace(&self, grace: Duration) -> ShutdownReport {
        info!(grace_ms = grace.as_millis() as u64, "🛑 Orchestrator shutting down");
        let report = self.engine.shutdown(grace).await;

        let leaked = self.allocator.release_all();
        if leaked > 0 {
            warn!(released = leaked, "Released allocations left after shutdown");
        }
        if let Err(err) = self.allocator.verify_invariants() {
            log_error("orchestrator", "shutdown", &err.to_string(), None);
        }

        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Background task did not stop in time");
            }
        }
        report
    }
}

fn purge(
    engine: &WorkflowEngine,
    rejected: &DashMap<String, RejectedJob>,
    older_than: Duration,
) -> usize {
    let before = rejected.len();
    rejected.retain(|_, job| job.rejected_at.elapsed() < older_than);
    engine.purge_finished(older_than) + before.saturating_sub(rejected.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::models::{OutputFormat, StepOutput};
    use crate::orchestration::step_executor::StepRequest;
    use async_trait::async_trait;

    struct NoopExecutor;

    #[async_trait]
    impl StepExecutor for NoopExecutor {
        async fn execute(
            &self,
            _instance: &ServiceInstance,
            _request: StepRequest,
        ) -> std::result::Result<StepOutput, StepError> {
            Err(StepError::permanent("not used"))
        }
    }

    #[test]
    fn test_builder_requires_executor() {
        let err = MasterOrchestrator::builder(OrchestratorConfig::default())
            .build()
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected_before_allocation() {
        let orchestrator = MasterOrchestrator::builder(OrchestratorConfig::default())
            .with_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();

        let result = orchestrator
            .orchestrate(VideoJobRequest::new("empty", OutputFormat::Mp4, 1280, 720))
            .await;

        assert!(result.is_failed());
        assert_eq!(result.error.unwrap().code, "VALIDATION_ERROR");
        assert_eq!(orchestrator.allocator().active_count(), 0);
        assert_eq!(
            orchestrator.get_job_status("empty").map(|v| v.status),
            Some(JobStatus::Failed)
        );
    }

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthChecker for AlwaysHealthy {
        async fn check(&self, _instance: &ServiceInstance) -> crate::models::HealthCheckResult {
            crate::models::HealthCheckResult::healthy(1.0)
        }
    }

    #[tokio::test]
    async fn test_rejected_jobs_expire_after_retention() {
        let orchestrator = MasterOrchestrator::builder(OrchestratorConfig::default())
            .with_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();
        orchestrator
            .orchestrate(VideoJobRequest::new("empty", OutputFormat::Mp4, 1280, 720))
            .await;

        assert_eq!(orchestrator.purge_finished(Duration::from_secs(60)), 0);
        assert!(orchestrator.get_job_status("empty").is_some());
        assert_eq!(orchestrator.purge_finished(Duration::ZERO), 1);
        assert!(orchestrator.get_job_status("empty").is_none());
    }

    #[tokio::test]
    async fn test_background_purge_forgets_old_jobs() {
        let mut config = OrchestratorConfig::default();
        config.workflow.finished_retention_ms = 0;
        config.workflow.purge_interval_ms = 10;
        let orchestrator = MasterOrchestrator::builder(config)
            .with_executor(Arc::new(NoopExecutor))
            .build()
            .unwrap();
        orchestrator.start_background_tasks(Arc::new(AlwaysHealthy));

        orchestrator
            .orchestrate(VideoJobRequest::new("empty", OutputFormat::Mp4, 1280, 720))
            .await;
        for _ in 0..100 {
            if orchestrator.get_job_status("empty").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(orchestrator.get_job_status("empty").is_none());

        let report = orchestrator.shutdown().await;
        assert_eq!(report.killed, 0);
    }
}
