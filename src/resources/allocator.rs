//! # Resource Allocator
//!
//! Turns a [`JobAnalysis`] into an [`AllocatedResources`] reservation against
//! the shared [`ResourcePool`].
//!
//! - `allocate` fails fast with a [`ResourceError`] when any dimension lacks
//!   headroom; nothing is partially reserved. Capacity the head of the wait
//!   queue needs is not headroom for callers of equal or lower priority.
//! - `allocate_with_wait` queues the request instead. Waiters are served
//!   strictly by priority, then arrival order; a higher priority waiter jumps
//!   ahead of lower ones but never revokes a granted allocation.
//! - `release` is idempotent: only the first call for an allocation returns
//!   capacity to the pool.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pool::ResourcePool;
use crate::error::{OrchestratorError, ResourceError, Result};
use crate::logging::log_allocation_operation;
use crate::models::{
    AllocatedResources, AllocationMetrics, AllocationOwner, CpuAllocation, GpuAllocation,
    JobAnalysis, JobComplexity, JobPriority, MemoryAllocation, NetworkAllocation, NodeAssignment,
    PriorityClass, ResourceAllocation, ResourceAmounts, ResourceStatus, ResourceType,
    ResourceUtilization, StorageAllocation,
};

const INVARIANT_EPSILON: f64 = 1e-6;

/// Externally measured capacity for one dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacitySample {
    pub resource_type: ResourceType,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueuedRequest {
    priority: JobPriority,
    ticket: u64,
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.ticket.cmp(&self.ticket))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct ResourceAllocator {
    pool: Arc<ResourcePool>,
    allocations: DashMap<Uuid, AllocatedResources>,
    queue: Mutex<BinaryHeap<QueuedRequest>>,
    /// Amounts each queued ticket is waiting for
    waiting: DashMap<u64, ResourceAmounts>,
    queue_changed: Notify,
    next_ticket: AtomicU64,
}

impl std::fmt::Debug for ResourceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("node_id", &self.pool.node_id())
            .field("active_allocations", &self.allocations.len())
            .field("queued", &self.queue.lock().len())
            .finish()
    }
}

impl ResourceAllocator {
    pub fn new(pool: Arc<ResourcePool>) -> Self {
        Self {
            pool,
            allocations: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            waiting: DashMap::new(),
            queue_changed: Notify::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    /// Reserve resources for `analysis` or fail immediately
    pub fn allocate(&self, analysis: &JobAnalysis) -> std::result::Result<AllocatedResources, ResourceError> {
        let amounts = analysis.requirements.amounts();
        if let Some(err) = self.held_for_waiter(analysis.priority, &amounts) {
            warn!(
                job_id = %analysis.job_id,
                priority = %analysis.priority,
                resource_type = %err.resource_type,
                requested = err.requested,
                available = err.available,
                "🚫 Allocation refused, capacity held for a queued request"
            );
            return Err(err);
        }
        if let Err(err) = self.pool.try_reserve(&amounts) {
            warn!(
                job_id = %analysis.job_id,
                resource_type = %err.resource_type,
                requested = err.requested,
                available = err.available,
                "🚫 Allocation refused"
            );
            return Err(err);
        }
        Ok(self.record(analysis, amounts))
    }

    /// Reserve resources for `analysis`, waiting up to `max_wait` in the
    /// priority queue for capacity to free up.
    pub async fn allocate_with_wait(
        &self,
        analysis: &JobAnalysis,
        max_wait: Duration,
    ) -> std::result::Result<AllocatedResources, ResourceError> {
        let amounts = analysis.requirements.amounts();
        let request = QueuedRequest {
            priority: analysis.priority,
            ticket: self.next_ticket.fetch_add(1, AtomicOrdering::SeqCst),
        };

        // Nobody of equal or higher priority is waiting: try to go straight in
        let blocked = self
            .queue
            .lock()
            .peek()
            .is_some_and(|head| head.priority >= request.priority);
        if !blocked && self.pool.try_reserve(&amounts).is_ok() {
            return Ok(self.record(analysis, amounts));
        }
        if max_wait.is_zero() {
            return self.allocate(analysis);
        }

        self.waiting.insert(request.ticket, amounts);
        self.queue.lock().push(request);
        debug!(
            job_id = %analysis.job_id,
            priority = %analysis.priority,
            ticket = request.ticket,
            "⏳ Queued for resources"
        );

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let notified = self.queue_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let at_head = self.queue.lock().peek() == Some(&request);
            if at_head && self.pool.try_reserve(&amounts).is_ok() {
                self.dequeue(request);
                return Ok(self.record(analysis, amounts));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.dequeue(request);
                let err = self
                    .first_shortfall(&amounts)
                    .unwrap_or_else(|| ResourceError::new(ResourceType::Cpu, amounts.cpu_cores, 0.0));
                warn!(
                    job_id = %analysis.job_id,
                    waited_ms = max_wait.as_millis() as u64,
                    resource_type = %err.resource_type,
                    "🚫 Allocation wait expired"
                );
                return Err(err);
            }
        }
    }

    fn dequeue(&self, request: QueuedRequest) {
        self.queue.lock().retain(|queued| *queued != request);
        self.waiting.remove(&request.ticket);
        self.queue_changed.notify_waiters();
    }

    /// Shortfall `amounts` would hit once the head waiter's needs are set
    /// aside. Only a waiter of equal or higher priority holds capacity back.
    fn held_for_waiter(
        &self,
        priority: JobPriority,
        amounts: &ResourceAmounts,
    ) -> Option<ResourceError> {
        let head = *self.queue.lock().peek()?;
        if head.priority < priority {
            return None;
        }
        let held = self
            .waiting
            .get(&head.ticket)
            .map(|entry| *entry)
            .unwrap_or_default();
        ResourceType::ALL.iter().find_map(|rt| {
            let requested = amounts.get(*rt);
            let available = (self.pool.available(*rt) - held.get(*rt)).max(0.0);
            (requested > available).then(|| ResourceError::new(*rt, requested, available))
        })
    }

    fn first_shortfall(&self, amounts: &ResourceAmounts) -> Option<ResourceError> {
        ResourceType::ALL.iter().find_map(|rt| {
            let requested = amounts.get(*rt);
            let available = self.pool.available(*rt);
            (requested > available).then(|| ResourceError::new(*rt, requested, available))
        })
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.lock().len()
    }

    fn record(&self, analysis: &JobAnalysis, amounts: ResourceAmounts) -> AllocatedResources {
        let allocation = build_allocation(analysis);
        let node_assignments = ResourceType::ALL
            .iter()
            .filter(|rt| amounts.get(**rt) > 0.0)
            .map(|rt| NodeAssignment {
                node_id: self.pool.node_id().to_string(),
                resource_type: *rt,
                amount: amounts.get(*rt),
            })
            .collect();

        let allocated = AllocatedResources {
            id: Uuid::new_v4(),
            job_id: analysis.job_id.clone(),
            analysis: analysis.clone(),
            allocation,
            reserved_at: Utc::now(),
            released_at: None,
            status: ResourceStatus::Allocated,
            owner: None,
            metrics: AllocationMetrics::default(),
            node_assignments,
        };

        self.allocations.insert(allocated.id, allocated.clone());
        let details = format!(
            "cpu={:.2} memory_gb={:.2} gpu={:.0}",
            amounts.cpu_cores, amounts.memory_gb, amounts.gpu_units
        );
        log_allocation_operation(
            "allocate",
            &allocated.id.to_string(),
            &allocated.job_id,
            "allocated",
            Some(&details),
        );
        allocated
    }

    /// Mark an allocation active and bind it to the run that uses it
    pub fn activate(&self, id: Uuid, owner: AllocationOwner) -> Result<AllocatedResources> {
        let mut entry = self.allocations.get_mut(&id).ok_or_else(|| {
            OrchestratorError::Internal(format!("allocation {id} is not live"))
        })?;
        entry.status = ResourceStatus::Active;
        entry.owner = Some(owner);
        entry.metrics.activations += 1;
        Ok(entry.clone())
    }

    /// Return an allocation to the pool. Only the first call for a given id
    /// has any effect; later calls return `None`.
    pub fn release(&self, id: Uuid) -> Option<AllocatedResources> {
        self.finish(id, ResourceStatus::Released)
    }

    /// Release on a failure path, recording the allocation as `failed`
    pub fn release_failed(&self, id: Uuid) -> Option<AllocatedResources> {
        self.finish(id, ResourceStatus::Failed)
    }

    fn finish(&self, id: Uuid, status: ResourceStatus) -> Option<AllocatedResources> {
        let (_, mut allocated) = self.allocations.remove(&id)?;
        self.pool.release(&allocated.amounts());

        let now = Utc::now();
        allocated.status = status;
        allocated.released_at = Some(now);
        allocated.metrics.held_for_ms = Some(
            (now - allocated.reserved_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.queue_changed.notify_waiters();

        log_allocation_operation(
            "release",
            &id.to_string(),
            &allocated.job_id,
            if status == ResourceStatus::Failed { "failed" } else { "released" },
            None,
        );
        Some(allocated)
    }

    /// Release every live allocation, used on shutdown
    pub fn release_all(&self) -> usize {
        let ids: Vec<Uuid> = self.allocations.iter().map(|entry| *entry.key()).collect();
        let released = ids
            .into_iter()
            .filter_map(|id| self.release(id))
            .count();
        if released > 0 {
            info!(released = released, "📦 Released all outstanding allocations");
        }
        released
    }

    pub fn get(&self, id: Uuid) -> Option<AllocatedResources> {
        self.allocations.get(&id).map(|entry| entry.clone())
    }

    pub fn find_by_job(&self, job_id: &str) -> Option<AllocatedResources> {
        self.allocations
            .iter()
            .find(|entry| entry.job_id == job_id)
            .map(|entry| entry.clone())
    }

    pub fn active_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn utilization(&self) -> ResourceUtilization {
        self.pool.snapshot(self.allocations.len())
    }

    /// Feed measured capacity into the pool; queued requests are re-checked
    pub fn apply_telemetry(&self, samples: &[CapacitySample]) {
        for sample in samples {
            let applied = self.pool.set_total(sample.resource_type, sample.total);
            debug!(
                resource_type = %sample.resource_type,
                requested = sample.total,
                applied = applied,
                "Applied capacity telemetry"
            );
        }
        self.queue_changed.notify_waiters();
    }

    /// Reserved totals must equal the sum of live allocations and never
    /// exceed capacity. Only meaningful while no allocation is in flight.
    pub fn verify_invariants(&self) -> Result<()> {
        let live = self
            .allocations
            .iter()
            .fold(ResourceAmounts::default(), |sum, entry| {
                sum.add(&entry.amounts())
            });
        let utilization = self.pool.snapshot(self.allocations.len());

        for usage in &utilization.dimensions {
            if usage.reserved > usage.total + INVARIANT_EPSILON {
                return Err(OrchestratorError::Internal(format!(
                    "{} reserved {:.3} exceeds total {:.3}",
                    usage.resource_type, usage.reserved, usage.total
                )));
            }
            let expected = live.get(usage.resource_type);
            if (usage.reserved - expected).abs() > INVARIANT_EPSILON {
                return Err(OrchestratorError::Internal(format!(
                    "{} reserved {:.3} does not match live allocations {:.3}",
                    usage.resource_type, usage.reserved, expected
                )));
            }
        }
        Ok(())
    }
}

fn build_allocation(analysis: &JobAnalysis) -> ResourceAllocation {
    let requirements = &analysis.requirements;
    let priority_class = PriorityClass::from(analysis.priority);

    let min_iops = match analysis.complexity {
        JobComplexity::Simple => 500,
        JobComplexity::Moderate => 1_000,
        JobComplexity::Complex => 3_000,
        JobComplexity::Enterprise => 6_000,
    };
    let max_latency_ms = match analysis.priority {
        JobPriority::Critical => 20,
        JobPriority::High => 50,
        JobPriority::Normal => 100,
        JobPriority::Low => 250,
    };

    let amounts = requirements.amounts();
    ResourceAllocation {
        cpu: CpuAllocation {
            cores: amounts.cpu_cores,
            priority_class,
        },
        memory: MemoryAllocation {
            gb: amounts.memory_gb,
            priority_class,
        },
        storage: StorageAllocation {
            gb: amounts.storage_gb,
            min_iops,
        },
        network: NetworkAllocation {
            bandwidth_mbps: amounts.network_mbps,
            max_latency_ms,
        },
        gpu: (amounts.gpu_units > 0.0).then_some(GpuAllocation {
            units: amounts.gpu_units,
            priority_class,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcessingStrategy, ResourceRequirements};

    fn pool(gpu_units: f64) -> Arc<ResourcePool> {
        Arc::new(ResourcePool::new(
            "node-a",
            ResourceAmounts {
                cpu_cores: 8.0,
                memory_gb: 32.0,
                storage_gb: 100.0,
                network_mbps: 1000.0,
                gpu_units,
            },
        ))
    }

    fn analysis(job_id: &str, cpu: f64, gpu_units: f64, priority: JobPriority) -> JobAnalysis {
        JobAnalysis {
            job_id: job_id.to_string(),
            complexity_score: 12.0,
            complexity: JobComplexity::Moderate,
            priority,
            strategy: ProcessingStrategy::BalancedAsync,
            estimated_duration_secs: 60.0,
            source_duration_secs: 30.0,
            requirements: ResourceRequirements {
                cpu_cores: cpu,
                memory_gb: 2.0,
                storage_gb: 5.0,
                bandwidth_mbps: 50.0,
                gpu_required: gpu_units > 0.0,
                gpu_units,
            },
            risk_factors: vec![],
            optimization_hints: vec![],
            analyzed_at: Utc::now(),
        }
    }

    #[test]
    fn test_allocate_builds_sub_allocations() {
        let allocator = ResourceAllocator::new(pool(2.0));
        let allocated = allocator
            .allocate(&analysis("job-1", 2.0, 1.0, JobPriority::High))
            .unwrap();

        assert_eq!(allocated.status, ResourceStatus::Allocated);
        assert_eq!(allocated.allocation.cpu.priority_class, PriorityClass::Guaranteed);
        assert_eq!(allocated.allocation.gpu.as_ref().map(|g| g.units), Some(1.0));
        assert_eq!(allocated.node_assignments.len(), 5);
        assert!(allocator.verify_invariants().is_ok());
    }

    #[test]
    fn test_gpu_shortfall_leaves_pool_untouched() {
        let allocator = ResourceAllocator::new(pool(1.0));
        let before = allocator.utilization();

        let err = allocator
            .allocate(&analysis("job-1", 2.0, 2.0, JobPriority::Normal))
            .unwrap_err();
        assert_eq!(err.resource_type, ResourceType::Gpu);
        assert_eq!(err.requested, 2.0);
        assert_eq!(err.available, 1.0);

        let after = allocator.utilization();
        assert_eq!(before.dimensions, after.dimensions);
        assert_eq!(allocator.active_count(), 0);
    }

    #[test]
    fn test_double_release_is_noop() {
        let allocator = ResourceAllocator::new(pool(0.0));
        let allocated = allocator
            .allocate(&analysis("job-1", 4.0, 0.0, JobPriority::Normal))
            .unwrap();

        let released = allocator.release(allocated.id).unwrap();
        assert_eq!(released.status, ResourceStatus::Released);
        assert!(released.released_at.is_some());
        assert!(allocator.release(allocated.id).is_none());
        assert!(allocator.release_failed(allocated.id).is_none());

        assert_eq!(allocator.pool().available(ResourceType::Cpu), 8.0);
        assert!(allocator.verify_invariants().is_ok());
    }

    #[test]
    fn test_activate_binds_owner() {
        let allocator = ResourceAllocator::new(pool(0.0));
        let allocated = allocator
            .allocate(&analysis("job-1", 1.0, 0.0, JobPriority::Normal))
            .unwrap();
        let workflow_id = Uuid::new_v4();
        let active = allocator
            .activate(allocated.id, AllocationOwner::Workflow(workflow_id))
            .unwrap();
        assert_eq!(active.status, ResourceStatus::Active);
        assert_eq!(active.owner, Some(AllocationOwner::Workflow(workflow_id)));

        allocator.release(allocated.id);
        assert!(allocator
            .activate(allocated.id, AllocationOwner::Workflow(workflow_id))
            .is_err());
    }

    #[tokio::test]
    async fn test_waiter_is_served_after_release() {
        let allocator = Arc::new(ResourceAllocator::new(pool(0.0)));
        let holder = allocator
            .allocate(&analysis("holder", 8.0, 0.0, JobPriority::Normal))
            .unwrap();

        let waiter = {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move {
                allocator
                    .allocate_with_wait(
                        &analysis("waiter", 4.0, 0.0, JobPriority::Normal),
                        Duration::from_secs(2),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(allocator.queued_requests(), 1);
        allocator.release(holder.id);

        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.job_id, "waiter");
        assert_eq!(allocator.queued_requests(), 0);
    }

    #[tokio::test]
    async fn test_higher_priority_waiter_jumps_queue() {
        let allocator = Arc::new(ResourceAllocator::new(pool(0.0)));
        let holder = allocator
            .allocate(&analysis("holder", 8.0, 0.0, JobPriority::Normal))
            .unwrap();

        let spawn_waiter = |job_id: &'static str, priority| {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move {
                allocator
                    .allocate_with_wait(&analysis(job_id, 8.0, 0.0, priority), Duration::from_secs(2))
                    .await
            })
        };

        let low = spawn_waiter("low", JobPriority::Low);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let critical = spawn_waiter("critical", JobPriority::Critical);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(allocator.queued_requests(), 2);

        allocator.release(holder.id);
        let granted = critical.await.unwrap().unwrap();
        assert_eq!(granted.job_id, "critical");
        assert_eq!(allocator.queued_requests(), 1);

        allocator.release(granted.id);
        let granted = low.await.unwrap().unwrap();
        assert_eq!(granted.job_id, "low");
    }

    #[tokio::test]
    async fn test_fail_fast_allocation_cannot_take_capacity_held_for_waiter() {
        let allocator = Arc::new(ResourceAllocator::new(pool(0.0)));
        let holder = allocator
            .allocate(&analysis("holder", 8.0, 0.0, JobPriority::Normal))
            .unwrap();

        let critical = {
            let allocator = Arc::clone(&allocator);
            tokio::spawn(async move {
                allocator
                    .allocate_with_wait(
                        &analysis("critical", 8.0, 0.0, JobPriority::Critical),
                        Duration::from_secs(2),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(allocator.queued_requests(), 1);

        // The waiter has not run yet when the fail-fast callers arrive
        allocator.release(holder.id);
        let err = allocator
            .allocate(&analysis("low", 8.0, 0.0, JobPriority::Low))
            .unwrap_err();
        assert_eq!(err.resource_type, ResourceType::Cpu);
        assert_eq!(err.available, 0.0);
        assert!(allocator
            .allocate(&analysis("peer", 1.0, 0.0, JobPriority::Critical))
            .is_err());

        let granted = critical.await.unwrap().unwrap();
        assert_eq!(granted.job_id, "critical");
        assert_eq!(allocator.queued_requests(), 0);
        assert!(allocator.verify_invariants().is_ok());

        // With the queue empty the fail-fast path is open again
        allocator.release(granted.id);
        assert!(allocator
            .allocate(&analysis("low", 8.0, 0.0, JobPriority::Low))
            .is_ok());
    }

    #[test]
    fn test_lower_priority_waiter_does_not_block_fail_fast_caller() {
        let allocator = ResourceAllocator::new(pool(0.0));
        let low = QueuedRequest {
            priority: JobPriority::Low,
            ticket: 0,
        };
        let needs = analysis("low", 8.0, 0.0, JobPriority::Low).requirements.amounts();
        allocator.waiting.insert(low.ticket, needs);
        allocator.queue.lock().push(low);

        assert!(allocator
            .allocate(&analysis("high", 8.0, 0.0, JobPriority::High))
            .is_ok());
    }

    #[tokio::test]
    async fn test_wait_expires_with_resource_error() {
        let allocator = ResourceAllocator::new(pool(0.0));
        let _holder = allocator
            .allocate(&analysis("holder", 8.0, 0.0, JobPriority::Normal))
            .unwrap();

        let err = allocator
            .allocate_with_wait(
                &analysis("late", 2.0, 0.0, JobPriority::High),
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert_eq!(err.resource_type, ResourceType::Cpu);
        assert_eq!(allocator.queued_requests(), 0);
    }

    #[test]
    fn test_release_all() {
        let allocator = ResourceAllocator::new(pool(0.0));
        for i in 0..3 {
            allocator
                .allocate(&analysis(&format!("job-{i}"), 1.0, 0.0, JobPriority::Normal))
                .unwrap();
        }
        assert_eq!(allocator.release_all(), 3);
        assert_eq!(allocator.utilization().reserved(ResourceType::Cpu), 0.0);
    }
}
