//! # Resource Allocations
//!
//! Reservation records handed out by the resource allocator. An allocation is
//! owned by exactly one orchestration run and released exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::analysis::{JobAnalysis, JobPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Storage,
    Network,
    Gpu,
}

impl ResourceType {
    /// Fixed lock order used when reserving across dimensions
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Storage,
        ResourceType::Network,
        ResourceType::Gpu,
    ];

    pub fn unit(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cores",
            ResourceType::Memory => "GB",
            ResourceType::Storage => "GB",
            ResourceType::Network => "Mbps",
            ResourceType::Gpu => "units",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Storage => "storage",
            ResourceType::Network => "network",
            ResourceType::Gpu => "gpu",
        };
        f.write_str(label)
    }
}

/// Flat per-dimension amounts, the unit of reservation against the pool
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceAmounts {
    pub cpu_cores: f64,
    pub memory_gb: f64,
    pub storage_gb: f64,
    pub network_mbps: f64,
    pub gpu_units: f64,
}

impl ResourceAmounts {
    pub fn get(&self, resource_type: ResourceType) -> f64 {
        match resource_type {
            ResourceType::Cpu => self.cpu_cores,
            ResourceType::Memory => self.memory_gb,
            ResourceType::Storage => self.storage_gb,
            ResourceType::Network => self.network_mbps,
            ResourceType::Gpu => self.gpu_units,
        }
    }

    pub fn set(&mut self, resource_type: ResourceType, value: f64) {
        match resource_type {
            ResourceType::Cpu => self.cpu_cores = value,
            ResourceType::Memory => self.memory_gb = value,
            ResourceType::Storage => self.storage_gb = value,
            ResourceType::Network => self.network_mbps = value,
            ResourceType::Gpu => self.gpu_units = value,
        }
    }

    pub fn add(&self, other: &ResourceAmounts) -> ResourceAmounts {
        let mut sum = *self;
        for resource_type in ResourceType::ALL {
            sum.set(resource_type, self.get(resource_type) + other.get(resource_type));
        }
        sum
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    BestEffort,
    Standard,
    Guaranteed,
}

impl From<JobPriority> for PriorityClass {
    fn from(priority: JobPriority) -> Self {
        match priority {
            JobPriority::Low => PriorityClass::BestEffort,
            JobPriority::Normal => PriorityClass::Standard,
            JobPriority::High | JobPriority::Critical => PriorityClass::Guaranteed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuAllocation {
    pub cores: f64,
    pub priority_class: PriorityClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryAllocation {
    pub gb: f64,
    pub priority_class: PriorityClass,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageAllocation {
    pub gb: f64,
    pub min_iops: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAllocation {
    pub bandwidth_mbps: f64,
    pub max_latency_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuAllocation {
    pub units: f64,
    pub priority_class: PriorityClass,
}

/// Concrete capacity reserved for a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu: CpuAllocation,
    pub memory: MemoryAllocation,
    pub storage: StorageAllocation,
    pub network: NetworkAllocation,
    pub gpu: Option<GpuAllocation>,
}

impl ResourceAllocation {
    pub fn amounts(&self) -> ResourceAmounts {
        ResourceAmounts {
            cpu_cores: self.cpu.cores,
            memory_gb: self.memory.gb,
            storage_gb: self.storage.gb,
            network_mbps: self.network.bandwidth_mbps,
            gpu_units: self.gpu.as_ref().map(|g| g.units).unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Allocated,
    Active,
    Released,
    Failed,
}

/// Who currently holds an active allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AllocationOwner {
    Workflow(Uuid),
    Immediate(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub node_id: String,
    pub resource_type: ResourceType,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationMetrics {
    pub activations: u32,
    pub held_for_ms: Option<u64>,
    pub peak_cpu_utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedResources {
    pub id: Uuid,
    pub job_id: String,
    pub analysis: JobAnalysis,
    pub allocation: ResourceAllocation,
    pub reserved_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
    pub status: ResourceStatus,
    pub owner: Option<AllocationOwner>,
    pub metrics: AllocationMetrics,
    pub node_assignments: Vec<NodeAssignment>,
}

impl AllocatedResources {
    pub fn amounts(&self) -> ResourceAmounts {
        self.allocation.amounts()
    }
}

/// Per-dimension view of pool capacity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionUsage {
    pub resource_type: ResourceType,
    pub total: f64,
    pub available: f64,
    pub reserved: f64,
}

impl DimensionUsage {
    /// Reserved fraction of the total (0.0 - 1.0). Zero-capacity dimensions
    /// report zero saturation.
    pub fn saturation(&self) -> f64 {
        if self.total <= 0.0 {
            0.0
        } else {
            (self.reserved / self.total).clamp(0.0, 1.0)
        }
    }
}

/// Snapshot of the resource pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub dimensions: Vec<DimensionUsage>,
    pub active_allocations: usize,
    pub captured_at: DateTime<Utc>,
}

impl ResourceUtilization {
    pub fn dimension(&self, resource_type: ResourceType) -> Option<&DimensionUsage> {
        self.dimensions
            .iter()
            .find(|d| d.resource_type == resource_type)
    }

    pub fn reserved(&self, resource_type: ResourceType) -> f64 {
        self.dimension(resource_type).map(|d| d.reserved).unwrap_or(0.0)
    }
}
