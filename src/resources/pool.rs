//! # Resource Pool Tracker
//!
//! Total / reserved / available capacity per resource dimension. Every
//! dimension sits behind its own mutex; multi-dimension reservations take the
//! locks in [`ResourceType::ALL`] order, check every dimension against the same
//! snapshot and then commit, so a reservation is all-or-nothing and two
//! concurrent reservations can never both be granted against the same
//! headroom.

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::ResourceError;
use crate::models::{DimensionUsage, ResourceAmounts, ResourceType, ResourceUtilization};

/// Absorbs float rounding when a request exactly matches the headroom
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
struct DimensionState {
    total: f64,
    reserved: f64,
}

impl DimensionState {
    fn available(&self) -> f64 {
        (self.total - self.reserved).max(0.0)
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    node_id: String,
    dimensions: [Mutex<DimensionState>; 5],
}

fn slot(resource_type: ResourceType) -> usize {
    match resource_type {
        ResourceType::Cpu => 0,
        ResourceType::Memory => 1,
        ResourceType::Storage => 2,
        ResourceType::Network => 3,
        ResourceType::Gpu => 4,
    }
}

impl ResourcePool {
    pub fn new(node_id: impl Into<String>, totals: ResourceAmounts) -> Self {
        let dimension = |resource_type| {
            Mutex::new(DimensionState {
                total: totals.get(resource_type).max(0.0),
                reserved: 0.0,
            })
        };
        Self {
            node_id: node_id.into(),
            dimensions: ResourceType::ALL.map(dimension),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn lock_all(&self) -> Vec<(ResourceType, MutexGuard<'_, DimensionState>)> {
        ResourceType::ALL
            .iter()
            .map(|rt| (*rt, self.dimensions[slot(*rt)].lock()))
            .collect()
    }

    /// Reserve `amounts` across every dimension, or nothing at all
    pub fn try_reserve(&self, amounts: &ResourceAmounts) -> Result<(), ResourceError> {
        let mut guards = self.lock_all();

        for (resource_type, state) in guards.iter() {
            let requested = amounts.get(*resource_type);
            if requested <= 0.0 {
                continue;
            }
            let available = state.available();
            if requested > available + EPSILON {
                debug!(
                    resource_type = %resource_type,
                    requested = requested,
                    available = available,
                    "Reservation refused"
                );
                return Err(ResourceError::new(*resource_type, requested, available));
            }
        }

        for (resource_type, state) in guards.iter_mut() {
            let requested = amounts.get(*resource_type);
            if requested > 0.0 {
                state.reserved = (state.reserved + requested).min(state.total);
            }
        }
        Ok(())
    }

    /// Return `amounts` to the pool. Callers guarantee each reservation is
    /// released once; the reserved counter never drops below zero.
    pub fn release(&self, amounts: &ResourceAmounts) {
        for (resource_type, mut state) in self.lock_all() {
            let amount = amounts.get(resource_type);
            if amount <= 0.0 {
                continue;
            }
            if amount > state.reserved + EPSILON {
                warn!(
                    resource_type = %resource_type,
                    amount = amount,
                    reserved = state.reserved,
                    "Release exceeds reserved amount, clamping to zero"
                );
            }
            state.reserved = (state.reserved - amount).max(0.0);
        }
    }

    /// Whether `amounts` would fit right now. Advisory only; the answer can
    /// change before a subsequent `try_reserve`.
    pub fn fits(&self, amounts: &ResourceAmounts) -> bool {
        self.lock_all()
            .iter()
            .all(|(rt, state)| amounts.get(*rt) <= state.available() + EPSILON)
    }

    pub fn available(&self, resource_type: ResourceType) -> f64 {
        self.dimensions[slot(resource_type)].lock().available()
    }

    pub fn total(&self, resource_type: ResourceType) -> f64 {
        self.dimensions[slot(resource_type)].lock().total
    }

    pub fn reserved(&self, resource_type: ResourceType) -> f64 {
        self.dimensions[slot(resource_type)].lock().reserved
    }

    pub fn totals(&self) -> ResourceAmounts {
        let mut totals = ResourceAmounts::default();
        for (rt, state) in self.lock_all() {
            totals.set(rt, state.total);
        }
        totals
    }

    pub fn reserved_amounts(&self) -> ResourceAmounts {
        let mut reserved = ResourceAmounts::default();
        for (rt, state) in self.lock_all() {
            reserved.set(rt, state.reserved);
        }
        reserved
    }

    /// Adjust a dimension's capacity from external telemetry. Capacity never
    /// drops below what is currently reserved; active reservations stay valid.
    /// Returns the total actually applied.
    pub fn set_total(&self, resource_type: ResourceType, total: f64) -> f64 {
        let mut state = self.dimensions[slot(resource_type)].lock();
        let requested = if total.is_finite() { total.max(0.0) } else { state.total };
        let applied = requested.max(state.reserved);
        if applied > requested {
            warn!(
                resource_type = %resource_type,
                requested = requested,
                reserved = state.reserved,
                "Telemetry capacity below reserved amount, holding at reserved"
            );
        }
        state.total = applied;
        applied
    }

    /// Consistent snapshot of every dimension
    pub fn snapshot(&self, active_allocations: usize) -> ResourceUtilization {
        let dimensions = self
            .lock_all()
            .into_iter()
            .map(|(resource_type, state)| DimensionUsage {
                resource_type,
                total: state.total,
                available: state.available(),
                reserved: state.reserved,
            })
            .collect();

        ResourceUtilization {
            dimensions,
            active_allocations,
            captured_at: Utc::now(),
        }
    }
}
