//! # Data Model
//!
//! Plain data types shared by every orchestration component.

pub mod allocation;
pub mod analysis;
pub mod job_request;
pub mod service;
pub mod workflow;

pub use allocation::{
    AllocatedResources, AllocationMetrics, AllocationOwner, CpuAllocation, DimensionUsage,
    GpuAllocation, MemoryAllocation, NetworkAllocation, NodeAssignment, PriorityClass,
    ResourceAllocation, ResourceAmounts, ResourceStatus, ResourceType, ResourceUtilization,
    StorageAllocation,
};
pub use analysis::{
    JobAnalysis, JobComplexity, JobPriority, OptimizationHint, ProcessingStrategy,
    ResourceRequirements, RiskFactor,
};
pub use job_request::{
    EffectType, ElementEffect, ElementPosition, ElementType, OutputFormat, VideoElement,
    VideoJobRequest,
};
pub use service::{
    HealthCheckResult, HealthStatus, LoadBalancingStrategy, PerformanceProfile, ServiceCapacity,
    ServiceInstance, ServiceLoad,
};
pub use workflow::{
    RetryPolicy, RollbackStrategy, StepCondition, StepOutput, StepType, WorkflowContext,
    WorkflowDefinition, WorkflowExecution, WorkflowMetrics, WorkflowStep,
};
