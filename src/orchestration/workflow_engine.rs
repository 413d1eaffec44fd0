//! # Workflow Engine
//!
//! Drives `WorkflowExecution`s through the pure transition table in
//! [`crate::state_machine`]. Each execution gets one driver, either spawned as
//! its own task ([`WorkflowEngine::start`]) or awaited in place
//! ([`WorkflowEngine::run_inline`]). The driver is the only writer of its
//! execution; readers see a snapshot refreshed after every change.
//!
//! Per step group the driver evaluates conditions, dispatches the runnable
//! steps concurrently and waits at the group's join barrier. A step attempt
//! goes load balancer → circuit breaker (per-call timeout) → backing
//! executor. The step's retry sequence as a whole is bounded by the step
//! timeout, and the whole group is raced against the workflow deadline and
//! an abort signal.
//!
//! Pause, resume and cancel are honoured at step boundaries. Abort, used by
//! shutdown once the grace period is spent, interrupts in-flight steps.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::condition;
use super::status_sink::{ErrorInfo, JobStatus, JobStatusSink};
use super::step_executor::{check_output, counts_against_service, StepExecutor, StepRequest};
use crate::analytics::{AnalyticsEngine, JobSummary, StepRecord};
use crate::config::WorkflowConfig;
use crate::error::{FailureClass, OrchestratorError, Result, StepError, WorkflowError};
use crate::events::{EventPublisher, OrchestrationEvent};
use crate::logging::{log_error, log_workflow_operation};
use crate::models::{
    ResourceType, RollbackStrategy, StepOutput, StepType, VideoJobRequest, WorkflowExecution,
    WorkflowStep,
};
use crate::registry::{LoadBalancer, ServiceRegistry};
use crate::resilience::{CircuitBreakerError, CircuitBreakerManager, RetryExecutor};
use crate::resources::ResourceAllocator;
use crate::state_machine::{Effect, RollbackTarget, WorkflowEvent, WorkflowMachine, WorkflowState};

/// How long an aborted driver gets to wind down before its task is killed
const ABORT_SETTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
    Abort,
}

struct ExecutionHandle {
    snapshot: RwLock<WorkflowExecution>,
    control: watch::Sender<Control>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionHandle {
    fn state(&self) -> WorkflowState {
        self.snapshot.read().state
    }

    /// Raise the control level; cancel and abort are never downgraded
    fn request(&self, requested: Control) {
        self.control.send_if_modified(|current| {
            let allowed = match (*current, requested) {
                (Control::Abort, _) => false,
                (Control::Cancel, Control::Abort) => true,
                (Control::Cancel, _) => false,
                (from, to) => from != to,
            };
            if allowed {
                *current = requested;
            }
            allowed
        });
    }
}

/// Everything the engine needs, injected by the orchestrator
pub struct EngineComponents {
    pub config: WorkflowConfig,
    pub load_balancer: Arc<LoadBalancer>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub allocator: Arc<ResourceAllocator>,
    pub executor: Arc<dyn StepExecutor>,
    pub status_sink: Arc<dyn JobStatusSink>,
    pub analytics: Arc<AnalyticsEngine>,
    pub events: EventPublisher,
}

struct EngineInner {
    components: EngineComponents,
    executions: DashMap<Uuid, Arc<ExecutionHandle>>,
    jobs: DashMap<String, Uuid>,
    shutting_down: AtomicBool,
}

/// Outcome of [`WorkflowEngine::shutdown`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Executions that reached a final state within the grace period
    pub finished_within_grace: usize,
    /// Executions interrupted mid-step after the grace period
    pub interrupted: usize,
    /// Drivers that did not wind down and were killed
    pub killed: usize,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("executions", &self.inner.executions.len())
            .field(
                "shutting_down",
                &self.inner.shutting_down.load(Ordering::Acquire),
            )
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(components: EngineComponents) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                components,
                executions: DashMap::new(),
                jobs: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.components.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    fn register(&self, execution: WorkflowExecution) -> Result<ExecutionDriver> {
        if self.is_shutting_down() {
            return Err(OrchestratorError::ServiceUnavailable {
                service: "workflow-engine".to_string(),
                reason: "shutting down".to_string(),
            });
        }
        execution.definition.validate()?;

        let existing = self.inner.jobs.get(&execution.job_id).map(|id| *id);
        if let Some(existing) = existing {
            let active = self
                .inner
                .executions
                .get(&existing)
                .is_some_and(|handle| !handle.state().is_terminal());
            if active {
                return Err(OrchestratorError::validation(
                    "job_id",
                    format!("job {} already has an active workflow", execution.job_id),
                ));
            }
        }

        let (control, receiver) = watch::channel(Control::Run);
        let handle = Arc::new(ExecutionHandle {
            snapshot: RwLock::new(execution.clone()),
            control,
            task: Mutex::new(None),
        });
        self.inner.executions.insert(execution.id, handle.clone());
        self.inner.jobs.insert(execution.job_id.clone(), execution.id);

        Ok(ExecutionDriver::new(
            self.inner.clone(),
            execution,
            handle,
            receiver,
        ))
    }

    /// Spawn a driver task for `execution` and return its id immediately
    pub fn start(&self, execution: WorkflowExecution) -> Result<Uuid> {
        let workflow_id = execution.id;
        let driver = self.register(execution)?;
        let handle = driver.handle.clone();
        let task = tokio::spawn(async move {
            driver.run().await;
        });
        *handle.task.lock() = Some(task);
        Ok(workflow_id)
    }

    /// Drive `execution` to a final state on the caller's task
    pub async fn run_inline(&self, execution: WorkflowExecution) -> Result<WorkflowExecution> {
        let driver = self.register(execution)?;
        Ok(driver.run().await)
    }

    fn handle(&self, workflow_id: Uuid) -> Result<Arc<ExecutionHandle>> {
        self.inner
            .executions
            .get(&workflow_id)
            .map(|h| h.clone())
            .ok_or_else(|| {
                OrchestratorError::validation("workflow_id", format!("unknown workflow {workflow_id}"))
            })
    }

    fn request(&self, workflow_id: Uuid, control: Control) -> Result<WorkflowState> {
        let handle = self.handle(workflow_id)?;
        let state = handle.state();
        if state.is_terminal() {
            return Err(crate::state_machine::StateMachineError::TerminalState { state }.into());
        }
        handle.request(control);
        Ok(state)
    }

    /// Suspend at the next step boundary. No-op when already paused.
    pub fn pause(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.request(workflow_id, Control::Pause)
    }

    /// Continue a paused execution. No-op when already running.
    pub fn resume(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.request(workflow_id, Control::Run)
    }

    /// Cancel at the next step boundary
    pub fn cancel(&self, workflow_id: Uuid) -> Result<WorkflowState> {
        self.request(workflow_id, Control::Cancel)
    }

    pub fn get(&self, workflow_id: Uuid) -> Option<WorkflowExecution> {
        self.inner
            .executions
            .get(&workflow_id)
            .map(|h| h.snapshot.read().clone())
    }

    pub fn workflow_for_job(&self, job_id: &str) -> Option<Uuid> {
        self.inner.jobs.get(job_id).map(|id| *id)
    }

    pub fn find_by_job(&self, job_id: &str) -> Option<WorkflowExecution> {
        self.workflow_for_job(job_id).and_then(|id| self.get(id))
    }

    /// Executions not yet in a final state
    pub fn active(&self) -> Vec<WorkflowExecution> {
        let mut active: Vec<WorkflowExecution> = self
            .inner
            .executions
            .iter()
            .map(|h| h.snapshot.read().clone())
            .filter(|e| !e.state.is_terminal())
            .collect();
        active.sort_by_key(|e| e.created_at);
        active
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .executions
            .iter()
            .filter(|h| !h.state().is_terminal())
            .count()
    }

    /// Forget final executions that finished more than `older_than` ago
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let expired: Vec<(Uuid, String)> = self
            .inner
            .executions
            .iter()
            .filter_map(|h| {
                let snapshot = h.snapshot.read();
                let finished = snapshot.finished_at.is_some_and(|at| at <= cutoff);
                (snapshot.state.is_terminal() && finished)
                    .then(|| (snapshot.id, snapshot.job_id.clone()))
            })
            .collect();
        for (workflow_id, job_id) in &expired {
            self.inner.executions.remove(workflow_id);
            self.inner.jobs.remove_if(job_id, |_, id| id == workflow_id);
        }
        expired.len()
    }

    /// Stop accepting work, cancel every execution at its next step boundary,
    /// interrupt whatever is still running after `grace`, and release every
    /// allocation the stopped executions held.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.shutting_down.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + grace;

        let handles: Vec<Arc<ExecutionHandle>> = self
            .inner
            .executions
            .iter()
            .map(|h| h.clone())
            .collect();
        let mut tasks = Vec::new();
        for handle in handles {
            if handle.state().is_terminal() {
                continue;
            }
            handle.request(Control::Cancel);
            if let Some(task) = handle.task.lock().take() {
                tasks.push((handle.clone(), task));
            }
        }
        info!(
            running = tasks.len(),
            grace_ms = grace.as_millis() as u64,
            "🛑 Workflow engine shutting down"
        );

        let mut report = ShutdownReport::default();
        let mut stragglers = Vec::new();
        for (handle, mut task) in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(_) => report.finished_within_grace += 1,
                Err(_) => stragglers.push((handle, task)),
            }
        }

        for (handle, mut task) in stragglers {
            handle.request(Control::Abort);
            match tokio::time::timeout(ABORT_SETTLE, &mut task).await {
                Ok(_) => report.interrupted += 1,
                Err(_) => {
                    task.abort();
                    self.force_cancel(&handle).await;
                    report.killed += 1;
                }
            }
        }

        info!(
            finished_within_grace = report.finished_within_grace,
            interrupted = report.interrupted,
            killed = report.killed,
            "Workflow engine stopped"
        );
        report
    }

    /// Finalize an execution whose driver was killed
    async fn force_cancel(&self, handle: &ExecutionHandle) {
        let components = &self.inner.components;
        let execution = {
            let mut snapshot = handle.snapshot.write();
            if snapshot.state.is_terminal() {
                return;
            }
            snapshot.state = WorkflowState::Cancelled;
            snapshot.finished_at = Some(Utc::now());
            snapshot.clone()
        };

        if let Some(released) = components.allocator.release(execution.context.allocation.id) {
            components.events.publish(OrchestrationEvent::ResourcesReleased {
                allocation_id: released.id,
                job_id: released.job_id,
                status: released.status,
            });
        }
        components
            .status_sink
            .record_status(&execution.job_id, JobStatus::Cancelled, None)
            .await;
        components.events.publish(OrchestrationEvent::WorkflowCancelled {
            workflow_id: execution.id,
            job_id: execution.job_id.clone(),
        });
        warn!(
            workflow_id = %execution.id,
            job_id = %execution.job_id,
            "Workflow driver killed during shutdown"
        );
    }
}

/// One finished step run, after retries
struct StepRun {
    index: usize,
    step_name: String,
    step_type: StepType,
    service: String,
    result: std::result::Result<StepOutput, WorkflowError>,
    attempts: u32,
    duration: Duration,
}

impl StepRun {
    fn record(&self) -> StepRecord {
        StepRecord {
            step_name: self.step_name.clone(),
            step_type: self.step_type,
            service: self.service.clone(),
            attempts: self.attempts,
            duration_ms: self.duration.as_millis() as u64,
            succeeded: self.result.is_ok(),
        }
    }
}

type StepFuture = BoxFuture<'static, StepRun>;

/// Keeps an instance's active-job count honest even if the call is dropped
struct InstanceSlot {
    registry: Arc<ServiceRegistry>,
    instance_id: Uuid,
    started: Instant,
    succeeded: bool,
}

impl InstanceSlot {
    fn claim(registry: Arc<ServiceRegistry>, instance_id: Uuid) -> Self {
        registry.begin_job(instance_id);
        Self {
            registry,
            instance_id,
            started: Instant::now(),
            succeeded: false,
        }
    }
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        self.registry
            .end_job(self.instance_id, self.started.elapsed(), self.succeeded);
    }
}

impl EngineInner {
    /// Run one step to completion: a retry sequence bounded by the step
    /// timeout, then up to `max_unavailable_waits` waits for an open breaker
    /// to recover, each followed by a fresh sequence.
    async fn run_step(&self, index: usize, step: WorkflowStep, template: StepRequest) -> StepRun {
        let started = Instant::now();
        let retry = RetryExecutor::new(step.retry_policy.clone());
        let mut attempts = 0;
        let mut waits = 0;

        let result = loop {
            let step_deadline = tokio::time::Instant::now() + step.timeout();
            let attempted = AtomicU32::new(0);
            let sequence = retry.execute(|attempt| {
                attempted.store(attempt, Ordering::Relaxed);
                self.attempt_step(&step, &template, attempt, step_deadline)
            });
            let outcome = match tokio::time::timeout_at(step_deadline, sequence).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    attempts += attempted.load(Ordering::Relaxed);
                    warn!(
                        step = %step.name,
                        timeout_ms = step.timeout_ms,
                        attempts = attempts,
                        "⏱️ Step timed out"
                    );
                    let err = StepError::Timeout {
                        timeout_ms: step.timeout_ms,
                    };
                    break Err(WorkflowError::from_step_error(&step.name, &err, attempts));
                }
            };
            attempts += outcome.attempts;

            match outcome.result {
                Ok(output) => break Ok(output),
                Err(StepError::CircuitOpen { .. })
                    if waits < self.components.config.max_unavailable_waits =>
                {
                    waits += 1;
                    let breaker = self
                        .components
                        .breakers
                        .get_circuit_breaker(&step.service, &step.step_type.to_string());
                    let wait = breaker
                        .remaining_open_time()
                        .unwrap_or(breaker.config().recovery_timeout)
                        + Duration::from_millis(1);
                    info!(
                        step = %step.name,
                        service = %step.service,
                        wait_ms = wait.as_millis() as u64,
                        "⏳ Service unavailable, waiting for circuit recovery"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => break Err(WorkflowError::from_step_error(&step.name, &err, attempts)),
            }
        };

        StepRun {
            index,
            step_name: step.name,
            step_type: step.step_type,
            service: step.service,
            result,
            attempts,
            duration: started.elapsed(),
        }
    }

    async fn attempt_step(
        &self,
        step: &WorkflowStep,
        template: &StepRequest,
        attempt: u32,
        step_deadline: tokio::time::Instant,
    ) -> std::result::Result<StepOutput, StepError> {
        let remaining = step_deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(StepError::Timeout {
                timeout_ms: step.timeout_ms,
            });
        }
        let components = &self.components;
        let instance = components
            .load_balancer
            .select(&step.service, step.step_type)
            .map_err(|err| {
                debug!(step = %step.name, error = %err, "No instance selected");
                StepError::NoCapacity {
                    service: step.service.clone(),
                }
            })?;

        let breaker = components
            .breakers
            .get_circuit_breaker(&step.service, &step.step_type.to_string());
        let call_timeout = breaker.config().call_timeout.min(remaining);

        let mut request = template.clone();
        request.attempt = attempt;
        request.timeout = call_timeout;
        let registry = components.load_balancer.registry().clone();
        let executor = components.executor.clone();

        let call = breaker.call_filtered(
            call_timeout,
            move || async move {
                let mut slot = InstanceSlot::claim(registry, instance.id);
                let result = executor.execute(&instance, request).await;
                slot.succeeded = result.is_ok();
                result
            },
            counts_against_service,
        );

        match call.await {
            Ok(output) => check_output(step.step_type, output),
            Err(CircuitBreakerError::CircuitOpen { .. }) => Err(StepError::CircuitOpen {
                service: step.service.clone(),
            }),
            Err(CircuitBreakerError::Timeout { timeout, .. }) => Err(StepError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(CircuitBreakerError::OperationFailed(err)) => Err(err),
        }
    }
}

enum Boundary {
    Continue,
    Cancel,
    TimedOut,
}

enum Interrupt {
    TimedOut,
    Abort,
}

/// Sole writer of one execution
struct ExecutionDriver {
    inner: Arc<EngineInner>,
    execution: WorkflowExecution,
    machine: WorkflowMachine,
    handle: Arc<ExecutionHandle>,
    control: watch::Receiver<Control>,
    pending: FuturesUnordered<StepFuture>,
    request: Arc<VideoJobRequest>,
    deadline: tokio::time::Instant,
    started: Instant,
    records: Vec<StepRecord>,
    failure: Option<ErrorInfo>,
}

impl ExecutionDriver {
    fn new(
        inner: Arc<EngineInner>,
        execution: WorkflowExecution,
        handle: Arc<ExecutionHandle>,
        control: watch::Receiver<Control>,
    ) -> Self {
        let machine = WorkflowMachine::new(
            execution.definition.steps.len(),
            execution.definition.max_rollbacks,
        );
        let request = Arc::new(execution.context.request.clone());
        let deadline = tokio::time::Instant::now() + execution.definition.timeout();
        Self {
            inner,
            execution,
            machine,
            handle,
            control,
            pending: FuturesUnordered::new(),
            request,
            deadline,
            started: Instant::now(),
            records: Vec::new(),
            failure: None,
        }
    }

    fn components(&self) -> &EngineComponents {
        &self.inner.components
    }

    fn workflow_id(&self) -> String {
        self.execution.id.to_string()
    }

    fn publish(&self) {
        *self.handle.snapshot.write() = self.execution.clone();
    }

    async fn run(mut self) -> WorkflowExecution {
        self.execution.metrics.resource_utilization = self.allocation_share();
        self.apply(WorkflowEvent::Start).await;

        while !self.machine.state.is_terminal() {
            match self.at_boundary().await {
                Boundary::Continue => {}
                Boundary::Cancel => {
                    self.apply(WorkflowEvent::Cancel).await;
                    break;
                }
                Boundary::TimedOut => {
                    self.time_out().await;
                    break;
                }
            }

            if self.machine.is_finished() {
                self.apply(WorkflowEvent::Complete).await;
                break;
            }
            self.run_next_group().await;
        }

        self.publish();
        self.execution
    }

    /// Largest share of any pool dimension held by this execution
    fn allocation_share(&self) -> f64 {
        let pool = self.components().allocator.pool();
        let amounts = self.execution.context.allocation.amounts();
        ResourceType::ALL
            .iter()
            .map(|&rt| {
                let total = pool.total(rt);
                if total > 0.0 {
                    amounts.get(rt) / total
                } else {
                    0.0
                }
            })
            .fold(0.0, f64::max)
    }

    async fn at_boundary(&mut self) -> Boundary {
        if tokio::time::Instant::now() >= self.deadline {
            return Boundary::TimedOut;
        }
        let current = *self.control.borrow_and_update();
        match current {
            Control::Run => Boundary::Continue,
            Control::Cancel | Control::Abort => Boundary::Cancel,
            Control::Pause => {
                self.apply(WorkflowEvent::Pause).await;
                let deadline = self.deadline;
                let next = match tokio::time::timeout_at(
                    deadline,
                    self.control.wait_for(|c| *c != Control::Pause),
                )
                .await
                {
                    Err(_) => return Boundary::TimedOut,
                    Ok(Err(_)) => Control::Cancel,
                    Ok(Ok(control)) => *control,
                };
                if next == Control::Run {
                    self.apply(WorkflowEvent::Resume).await;
                    Boundary::Continue
                } else {
                    Boundary::Cancel
                }
            }
        }
    }

    async fn time_out(&mut self) {
        self.pending = FuturesUnordered::new();
        let step_name = self
            .execution
            .current_step_name()
            .unwrap_or("workflow")
            .to_string();
        self.execution.last_error = Some(WorkflowError {
            step_name,
            class: FailureClass::Timeout,
            message: format!(
                "workflow exceeded its {}ms deadline",
                self.execution.definition.timeout_ms
            ),
            retryable: false,
            attempts: 0,
        });
        self.apply(WorkflowEvent::TimedOut).await;
    }

    fn template_for(&self, step: &WorkflowStep) -> StepRequest {
        let context = &self.execution.context;
        StepRequest {
            workflow_id: self.execution.id,
            job_id: self.execution.job_id.clone(),
            allocation_id: context.allocation.id,
            step_name: step.name.clone(),
            step_type: step.step_type,
            parameters: step.parameters.clone(),
            inputs: step
                .depends_on
                .iter()
                .filter_map(|name| context.output(name).map(|o| (name.clone(), o.clone())))
                .collect(),
            request: self.request.clone(),
            timeout: step.timeout(),
            attempt: 0,
        }
    }

    fn step_future(&self, index: usize, step: &WorkflowStep) -> StepFuture {
        let inner = self.inner.clone();
        let template = self.template_for(step);
        let step = step.clone();
        Box::pin(async move { inner.run_step(index, step, template).await })
    }

    async fn run_next_group(&mut self) {
        let start = self.machine.current_step;
        let Some(group) = self.execution.definition.group_at(start) else {
            self.failure = Some(ErrorInfo::new(
                "INTERNAL_ERROR",
                format!("no step at index {start}"),
            ));
            self.apply(WorkflowEvent::fail_with_error("step index out of range"))
                .await;
            return;
        };

        let mut skipped = Vec::new();
        for index in group.clone() {
            let step = &self.execution.definition.steps[index];
            if condition::evaluate(&step.condition, &self.execution.context) {
                let future = self.step_future(index, step);
                self.pending.push(future);
            } else {
                skipped.push(index);
            }
        }
        for &index in &skipped {
            self.record_skip(index);
        }

        let outcome = {
            let pending = &mut self.pending;
            let control = &mut self.control;
            let deadline = self.deadline;
            tokio::select! {
                joined = join_group(pending) => Ok(joined),
                _ = tokio::time::sleep_until(deadline) => Err(Interrupt::TimedOut),
                _ = control.wait_for(|c| *c == Control::Abort) => Err(Interrupt::Abort),
            }
        };

        match outcome {
            Err(Interrupt::TimedOut) => self.time_out().await,
            Err(Interrupt::Abort) => {
                self.pending = FuturesUnordered::new();
                self.apply(WorkflowEvent::Cancel).await;
            }
            Ok((finished, failure)) => {
                for run in finished {
                    self.record_success(run);
                }
                if let Some(run) = failure {
                    self.handle_failure(run).await;
                    return;
                }

                let event = if group.len() > 1 {
                    WorkflowEvent::GroupCompleted {
                        start: group.start,
                        end: group.end,
                    }
                } else if skipped.contains(&group.start) {
                    WorkflowEvent::StepSkipped { index: group.start }
                } else {
                    WorkflowEvent::StepSucceeded { index: group.start }
                };
                self.apply(event).await;
                self.report_progress().await;
            }
        }
    }

    fn record_skip(&mut self, index: usize) {
        let name = self.execution.definition.steps[index].name.clone();
        self.execution.context.skipped_steps.insert(name.clone());
        self.execution.metrics.steps_skipped += 1;
        debug!(workflow_id = %self.execution.id, step = %name, "Step condition false, skipping");
        self.components().events.publish(OrchestrationEvent::StepSkipped {
            workflow_id: self.execution.id,
            step_name: name,
            step_index: index,
        });
    }

    fn record_success(&mut self, run: StepRun) {
        self.records.push(run.record());
        *self
            .execution
            .step_attempts
            .entry(run.step_name.clone())
            .or_insert(0) += run.attempts;
        let Ok(output) = run.result else {
            return;
        };
        self.execution.metrics.record_step(run.duration, run.attempts);
        self.execution
            .context
            .step_data
            .insert(run.step_name.clone(), output);

        log_workflow_operation(
            "step_completed",
            &self.workflow_id(),
            &self.execution.job_id,
            Some(&run.step_name),
            "completed",
            Some(
                format!(
                    "attempts={} duration_ms={}",
                    run.attempts,
                    run.duration.as_millis()
                )
                .as_str(),
            ),
        );
        self.components().events.publish(OrchestrationEvent::StepCompleted {
            workflow_id: self.execution.id,
            step_name: run.step_name,
            step_index: run.index,
            attempts: run.attempts,
            duration_ms: run.duration.as_millis() as u64,
        });
    }

    fn rollback_target(&self, step: &WorkflowStep, index: usize) -> RollbackTarget {
        match &step.rollback_strategy {
            RollbackStrategy::Immediate => RollbackTarget::Abort,
            RollbackStrategy::Graceful if self.pending.is_empty() => RollbackTarget::Abort,
            RollbackStrategy::Graceful => RollbackTarget::AbortAfterSiblings,
            RollbackStrategy::Checkpoint { step: checkpoint } => {
                match self.execution.definition.checkpoint_index(checkpoint) {
                    Some(target) if target <= index => RollbackTarget::Checkpoint { index: target },
                    _ => RollbackTarget::Abort,
                }
            }
        }
    }

    async fn handle_failure(&mut self, run: StepRun) {
        self.records.push(run.record());
        *self
            .execution
            .step_attempts
            .entry(run.step_name.clone())
            .or_insert(0) += run.attempts;
        let Err(error) = run.result else {
            return;
        };
        self.execution.metrics.steps_failed += 1;

        warn!(
            workflow_id = %self.execution.id,
            step = %error.step_name,
            failure_class = %error.class,
            attempts = error.attempts,
            "❌ Step failed after retries"
        );
        self.components().events.publish(OrchestrationEvent::StepFailed {
            workflow_id: self.execution.id,
            step_name: error.step_name.clone(),
            class: error.class,
            attempts: error.attempts,
            message: error.message.clone(),
        });
        self.execution.last_error = Some(error);

        let step = self.execution.definition.steps[run.index].clone();
        let target = self.rollback_target(&step, run.index);
        if target != RollbackTarget::AbortAfterSiblings {
            // Dropping the futures cancels the siblings
            self.pending = FuturesUnordered::new();
        }
        self.apply(WorkflowEvent::StepFailed {
            index: run.index,
            target,
        })
        .await;
        self.report_progress().await;
    }

    async fn report_progress(&mut self) {
        if self.machine.state.is_terminal() {
            return;
        }
        self.publish();
        let sink = self.inner.components.status_sink.clone();
        let job_id = self.execution.job_id.clone();
        let percent = self.execution.progress_percent();
        let current_step = self.execution.current_step_name().map(str::to_string);
        sink.record_progress(&job_id, percent, current_step.as_deref()).await;
    }

    /// Feed `event` to the machine and perform the resulting effects. An
    /// event the machine rejects fails the execution.
    async fn apply(&mut self, event: WorkflowEvent) {
        let effects = match self.machine.apply(&event) {
            Ok(effects) => effects,
            Err(err) => {
                log_error(
                    "workflow_engine",
                    event.event_type(),
                    &err.to_string(),
                    Some(&self.workflow_id()),
                );
                if self.machine.state.is_terminal() {
                    return;
                }
                self.failure = Some(ErrorInfo::new(
                    OrchestratorError::StateTransition(err.clone()).error_code(),
                    err.to_string(),
                ));
                match self.machine.apply(&WorkflowEvent::fail_with_error(err.to_string())) {
                    Ok(effects) => effects,
                    Err(_) => return,
                }
            }
        };

        self.execution.state = self.machine.state;
        self.execution.current_step = self.machine.current_step;
        self.execution.rollback_count = self.machine.rollback_count;

        for effect in effects {
            match effect {
                Effect::Notify { state } => self.notify(state).await,
                Effect::DrainSiblings => self.drain_siblings().await,
                Effect::RunCleanup => self.run_cleanup().await,
                Effect::ReleaseAllocation => self.release_allocation(),
                Effect::RewindTo { index } => self.rewind(index),
                Effect::ResetAttempts => self.execution.step_attempts.clear(),
            }
        }
        self.publish();
    }

    async fn drain_siblings(&mut self) {
        let pending = &mut self.pending;
        let drained = tokio::time::timeout_at(self.deadline, async {
            let mut runs = Vec::new();
            while let Some(run) = pending.next().await {
                runs.push(run);
            }
            runs
        })
        .await
        .unwrap_or_default();
        self.pending = FuturesUnordered::new();

        debug!(
            workflow_id = %self.execution.id,
            siblings = drained.len(),
            "Drained parallel siblings before abort"
        );
        for run in drained {
            if run.result.is_ok() {
                self.record_success(run);
            } else {
                self.records.push(run.record());
            }
        }
    }

    async fn run_cleanup(&mut self) {
        let Some(step) = self.execution.definition.cleanup_step.clone() else {
            return;
        };
        let template = self.template_for(&step);
        let index = self.execution.definition.steps.len();
        let timeout = step.timeout();

        match tokio::time::timeout(timeout, self.inner.run_step(index, step.clone(), template)).await {
            Ok(run) => {
                if let Err(err) = &run.result {
                    warn!(
                        workflow_id = %self.execution.id,
                        error = %err,
                        "Cleanup step failed"
                    );
                }
                self.records.push(run.record());
            }
            Err(_) => {
                warn!(
                    workflow_id = %self.execution.id,
                    timeout_ms = step.timeout_ms,
                    "Cleanup step timed out"
                );
            }
        }
    }

    fn release_allocation(&mut self) {
        let components = &self.inner.components;
        let allocation_id = self.execution.context.allocation.id;
        let released = if self.machine.state == WorkflowState::Failed {
            components.allocator.release_failed(allocation_id)
        } else {
            components.allocator.release(allocation_id)
        };
        if let Some(released) = released {
            components.events.publish(OrchestrationEvent::ResourcesReleased {
                allocation_id: released.id,
                job_id: released.job_id.clone(),
                status: released.status,
            });
            self.execution.context.allocation = released;
        }
    }

    fn rewind(&mut self, index: usize) {
        let definition = &self.execution.definition;
        let checkpoint = definition.steps[index].name.clone();
        for step in &definition.steps[index..] {
            self.execution.context.step_data.remove(&step.name);
            self.execution.context.skipped_steps.remove(&step.name);
        }
        self.execution.metrics.rollbacks += 1;

        info!(
            workflow_id = %self.execution.id,
            checkpoint = %checkpoint,
            rollback_count = self.machine.rollback_count,
            "↩️ Rolling back to checkpoint"
        );
        self.inner
            .components
            .events
            .publish(OrchestrationEvent::WorkflowRolledBack {
                workflow_id: self.execution.id,
                checkpoint,
                rollback_count: self.machine.rollback_count,
            });
    }

    fn failure_info(&self) -> ErrorInfo {
        if let Some(info) = &self.failure {
            return info.clone();
        }
        match &self.execution.last_error {
            Some(error) => ErrorInfo::new(
                OrchestratorError::Workflow(error.clone()).error_code(),
                error.to_string(),
            ),
            None => ErrorInfo::new("INTERNAL_ERROR", "workflow failed without a recorded error"),
        }
    }

    async fn notify(&mut self, state: WorkflowState) {
        let workflow_id = self.execution.id;
        let job_id = self.execution.job_id.clone();
        let first_start = state == WorkflowState::Running && self.execution.started_at.is_none();
        if first_start {
            self.execution.started_at = Some(Utc::now());
        }
        if state.is_terminal() {
            self.execution.finished_at = Some(Utc::now());
        }

        let error = (state == WorkflowState::Failed).then(|| self.failure_info());
        let event = match state {
            WorkflowState::Running if first_start => Some(OrchestrationEvent::WorkflowStarted {
                workflow_id,
                job_id: job_id.clone(),
                strategy: self.execution.definition.strategy,
                total_steps: self.execution.total_steps(),
            }),
            WorkflowState::Running => Some(OrchestrationEvent::WorkflowResumed { workflow_id }),
            WorkflowState::Paused => Some(OrchestrationEvent::WorkflowPaused { workflow_id }),
            WorkflowState::Completed => Some(OrchestrationEvent::WorkflowCompleted {
                workflow_id,
                job_id: job_id.clone(),
                result_url: self.execution.context.result_url(),
            }),
            WorkflowState::Failed => Some(OrchestrationEvent::WorkflowFailed {
                workflow_id,
                job_id: job_id.clone(),
                error: error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default(),
            }),
            WorkflowState::Cancelled => Some(OrchestrationEvent::WorkflowCancelled {
                workflow_id,
                job_id: job_id.clone(),
            }),
            WorkflowState::Initialized => None,
        };

        log_workflow_operation(
            "state_changed",
            &self.workflow_id(),
            &job_id,
            self.execution.current_step_name(),
            &state.to_string(),
            error.as_ref().map(|e| e.message.as_str()),
        );
        self.publish();

        if let Some(event) = event {
            self.components().events.publish(event);
        }
        if state == WorkflowState::Completed {
            self.components().events.publish(OrchestrationEvent::JobCompleted {
                job_id: job_id.clone(),
                result_url: self.execution.context.result_url(),
            });
        }

        let sink = self.inner.components.status_sink.clone();
        sink.record_status(&job_id, JobStatus::from(state), error.as_ref()).await;
        if state.is_terminal() {
            self.components()
                .analytics
                .record_job(self.summary(JobStatus::from(state), error));
        }
    }

    fn summary(&self, status: JobStatus, error: Option<ErrorInfo>) -> JobSummary {
        let analysis = &self.execution.context.analysis;
        JobSummary {
            job_id: self.execution.job_id.clone(),
            workflow_id: Some(self.execution.id),
            strategy: self.execution.definition.strategy,
            complexity: analysis.complexity,
            status,
            estimated_duration_secs: analysis.estimated_duration_secs,
            actual_duration_secs: self.started.elapsed().as_secs_f64(),
            steps: self.records.clone(),
            rollbacks: self.execution.rollback_count,
            error_code: error.map(|e| e.code),
            finished_at: Utc::now(),
        }
    }
}

/// Wait at the join barrier. Returns the successful runs and the first
/// failure; on failure the remaining siblings stay in `pending`.
async fn join_group(
    pending: &mut FuturesUnordered<StepFuture>,
) -> (Vec<StepRun>, Option<StepRun>) {
    let mut finished = Vec::new();
    while let Some(run) = pending.next().await {
        if run.result.is_err() {
            return (finished, Some(run));
        }
        finished.push(run);
    }
    (finished, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::InMemoryHistorySink;
    use crate::config::{AnalyticsConfig, AnalyzerConfig, ResourcePoolConfig};
    use crate::models::{
        AllocationOwner, ElementType, LoadBalancingStrategy, OutputFormat, ProcessingStrategy,
        HealthStatus, RetryPolicy, ServiceCapacity, ServiceInstance, VideoElement,
        WorkflowContext, WorkflowDefinition,
    };
    use crate::orchestration::status_sink::InMemoryStatusSink;
    use crate::orchestration::JobAnalyzer;
    use crate::resilience::CircuitBreakerConfig;
    use crate::resources::ResourcePool;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Fails the first `failures[step]` calls of a step, succeeds afterwards
    #[derive(Default)]
    struct FlakyExecutor {
        failures: HashMap<String, u32>,
        calls: DashMap<String, u32>,
        delay: Duration,
    }

    #[async_trait]
    impl StepExecutor for FlakyExecutor {
        async fn execute(
            &self,
            _instance: &ServiceInstance,
            request: StepRequest,
        ) -> std::result::Result<StepOutput, StepError> {
            let call = {
                let mut entry = self.calls.entry(request.step_name.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if call <= self.failures.get(&request.step_name).copied().unwrap_or(0) {
                return Err(StepError::transient("scripted failure"));
            }
            Ok(match request.step_type {
                StepType::Upload => StepOutput::Upload {
                    result_url: format!("https://cdn.example/{}.mp4", request.job_id),
                },
                StepType::Validation => StepOutput::Validation {
                    elements_checked: 1,
                    warnings: vec![],
                },
                StepType::Cleanup => StepOutput::Cleanup { removed_artifacts: 1 },
                _ => StepOutput::Rendering {
                    frames: 30,
                    segment: None,
                },
            })
        }
    }

    struct Harness {
        engine: WorkflowEngine,
        allocator: Arc<ResourceAllocator>,
        sink: Arc<InMemoryStatusSink>,
        executor: Arc<FlakyExecutor>,
    }

    fn harness(executor: FlakyExecutor) -> Harness {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(
            ServiceInstance::new(
                "svc",
                "http://svc:1",
                ServiceCapacity {
                    max_concurrent_jobs: 8,
                    supported_job_types: vec![],
                },
            )
            .with_health(HealthStatus::Healthy),
        );
        let pool = ResourcePoolConfig::default();
        let allocator = Arc::new(ResourceAllocator::new(Arc::new(ResourcePool::new(
            pool.node_id.clone(),
            pool.totals(),
        ))));
        let sink = Arc::new(InMemoryStatusSink::new());
        let executor = Arc::new(executor);
        let engine = WorkflowEngine::new(EngineComponents {
            config: WorkflowConfig::default(),
            load_balancer: Arc::new(LoadBalancer::new(
                registry,
                LoadBalancingStrategy::LeastConnections,
            )),
            breakers: Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig {
                failure_threshold: 50,
                recovery_timeout: Duration::from_millis(50),
                half_open_max_calls: 1,
                monitoring_window: Duration::from_secs(10),
                call_timeout: Duration::from_secs(5),
            })),
            allocator: allocator.clone(),
            executor: executor.clone(),
            status_sink: sink.clone(),
            analytics: Arc::new(
                AnalyticsEngine::new(AnalyticsConfig::default())
                    .with_sink(Arc::new(InMemoryHistorySink::new(10))),
            ),
            events: EventPublisher::default(),
        });
        Harness {
            engine,
            allocator,
            sink,
            executor,
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_ms: 1,
            backoff_multiplier: 1.0,
            max_backoff_ms: 2,
            jitter: 0.0,
            retry_conditions: vec![],
        }
    }

    fn step(name: &str, step_type: StepType) -> WorkflowStep {
        WorkflowStep::new(name, step_type, "svc")
            .with_timeout_ms(2_000)
            .with_retry_policy(fast_retry(2))
    }

    fn execution(h: &Harness, definition: WorkflowDefinition) -> WorkflowExecution {
        let request = VideoJobRequest::new("job-engine", OutputFormat::Mp4, 1280, 720).with_element(
            VideoElement::new("clip", ElementType::Video)
                .with_source("s3://clip.mp4")
                .with_timing(0.0, 10.0),
        );
        let analysis = JobAnalyzer::new(AnalyzerConfig::default()).analyze(&request);
        let allocation = h.allocator.allocate(&analysis).unwrap();
        let mut execution =
            WorkflowExecution::new(definition, WorkflowContext::new(request, analysis, allocation));
        let allocation = h
            .allocator
            .activate(
                execution.context.allocation.id,
                AllocationOwner::Workflow(execution.id),
            )
            .unwrap();
        execution.context.allocation = allocation;
        execution
    }

    fn pipeline() -> WorkflowDefinition {
        WorkflowDefinition::new("test", ProcessingStrategy::BalancedAsync)
            .with_step(step("validation", StepType::Validation))
            .with_step(step("render", StepType::Rendering).with_rollback(
                RollbackStrategy::Checkpoint {
                    step: "validation".to_string(),
                },
            ))
            .with_step(step("upload", StepType::Upload))
    }

    #[tokio::test]
    async fn test_inline_run_completes_and_releases() {
        let h = harness(FlakyExecutor::default());
        let execution = execution(&h, pipeline());
        let done = h.engine.run_inline(execution).await.unwrap();

        assert_eq!(done.state, WorkflowState::Completed);
        assert_eq!(done.metrics.steps_completed, 3);
        assert!(done.context.result_url().is_some());
        assert_eq!(h.allocator.active_count(), 0);
        assert_eq!(h.sink.latest_status("job-engine"), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_checkpoint_rollback_resumes_from_validation() {
        let mut failures = HashMap::new();
        failures.insert("render".to_string(), 3);
        let h = harness(FlakyExecutor {
            failures,
            ..FlakyExecutor::default()
        });
        let done = h.engine.run_inline(execution(&h, pipeline())).await.unwrap();

        assert_eq!(done.state, WorkflowState::Completed);
        assert_eq!(done.rollback_count, 1);
        assert_eq!(done.metrics.rollbacks, 1);
        // validation ran again after the rollback
        assert_eq!(*h.executor.calls.get("validation").unwrap(), 2);
        // attempt counters were reset by the rollback
        assert_eq!(done.step_attempts.get("render"), Some(&1));
    }

    #[test]
    fn test_driver_future_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}

        let h = harness(FlakyExecutor::default());
        let driver = h.engine.register(execution(&h, pipeline())).unwrap();
        let run = driver.run();
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_step_timeout_bounds_the_whole_retry_sequence() {
        let mut failures = HashMap::new();
        failures.insert("render".to_string(), 5);
        let h = harness(FlakyExecutor {
            failures,
            delay: Duration::from_millis(80),
            ..FlakyExecutor::default()
        });
        let definition = WorkflowDefinition::new("bounded", ProcessingStrategy::BalancedAsync)
            .with_step(step("validation", StepType::Validation))
            .with_step(
                step("render", StepType::Rendering)
                    .with_timeout_ms(100)
                    .with_retry_policy(fast_retry(5)),
            )
            .with_step(step("upload", StepType::Upload));

        let started = Instant::now();
        let done = h.engine.run_inline(execution(&h, definition)).await.unwrap();

        assert_eq!(done.state, WorkflowState::Failed);
        let error = done.last_error.unwrap();
        assert_eq!(error.step_name, "render");
        assert_eq!(error.class, FailureClass::Timeout);
        assert!(error.attempts < 6);
        // validation (80ms) plus one 100ms step budget, far from six attempts
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(h.executor.calls.get("upload").is_none());
        assert_eq!(h.allocator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_request_is_honoured() {
        let h = harness(FlakyExecutor {
            delay: Duration::from_millis(50),
            ..FlakyExecutor::default()
        });
        let execution = execution(&h, pipeline());
        let workflow_id = h.engine.start(execution).unwrap();
        h.engine.cancel(workflow_id).unwrap();

        for _ in 0..100 {
            if h.engine.get(workflow_id).unwrap().state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let done = h.engine.get(workflow_id).unwrap();
        assert_eq!(done.state, WorkflowState::Cancelled);
        assert_eq!(h.allocator.active_count(), 0);
        assert!(h.engine.cancel(workflow_id).is_err());
    }

    #[tokio::test]
    async fn test_second_active_workflow_for_job_is_rejected() {
        let h = harness(FlakyExecutor {
            delay: Duration::from_millis(100),
            ..FlakyExecutor::default()
        });
        let first = execution(&h, pipeline());
        let duplicate = WorkflowExecution::new(first.definition.clone(), first.context.clone());
        h.engine.start(first).unwrap();
        assert!(h.engine.start(duplicate).is_err());
        h.engine.shutdown(Duration::from_millis(500)).await;
    }

    #[test]
    fn test_control_requests_never_downgrade_cancel() {
        let h = harness(FlakyExecutor::default());
        let (control, receiver) = watch::channel(Control::Run);
        let handle = ExecutionHandle {
            snapshot: RwLock::new(execution(&h, pipeline())),
            control,
            task: Mutex::new(None),
        };

        handle.request(Control::Pause);
        assert_eq!(*receiver.borrow(), Control::Pause);
        handle.request(Control::Cancel);
        handle.request(Control::Run);
        assert_eq!(*receiver.borrow(), Control::Cancel);
        handle.request(Control::Abort);
        handle.request(Control::Cancel);
        assert_eq!(*receiver.borrow(), Control::Abort);
    }
}
