//! # Circuit Breaker Manager
//!
//! One breaker per `(service, operation)` pair, created on first use.
//! Provides centralized control and metrics aggregation.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, MetricsCollector,
    SystemCircuitBreakerMetrics, TracingMetricsCollector,
};

/// Key under which a breaker is registered
pub fn breaker_key(service: &str, operation: &str) -> String {
    format!("{service}::{operation}")
}

/// Manager for every circuit breaker in the orchestrator
pub struct CircuitBreakerManager {
    circuit_breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    service_configs: RwLock<HashMap<String, CircuitBreakerConfig>>,
    collector: Arc<dyn MetricsCollector>,
}

impl std::fmt::Debug for CircuitBreakerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerManager")
            .field("circuit_breakers", &self.circuit_breakers.read().len())
            .field("default_config", &self.default_config)
            .finish()
    }
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::with_collector(default_config, Arc::new(TracingMetricsCollector))
    }

    pub fn with_collector(
        default_config: CircuitBreakerConfig,
        collector: Arc<dyn MetricsCollector>,
    ) -> Self {
        info!(
            failure_threshold = default_config.failure_threshold,
            "Initializing circuit breaker manager"
        );
        Self {
            circuit_breakers: RwLock::new(HashMap::new()),
            default_config,
            service_configs: RwLock::new(HashMap::new()),
            collector,
        }
    }

    /// Override thresholds for one service. Applies to breakers created
    /// after the call.
    pub fn configure_service(&self, service: &str, config: CircuitBreakerConfig) {
        self.service_configs
            .write()
            .insert(service.to_string(), config);
    }

    fn config_for_service(&self, service: &str) -> CircuitBreakerConfig {
        self.service_configs
            .read()
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Get or create the breaker for a service operation
    pub fn get_circuit_breaker(&self, service: &str, operation: &str) -> Arc<CircuitBreaker> {
        let key = breaker_key(service, operation);
        {
            let breakers = self.circuit_breakers.read();
            if let Some(breaker) = breakers.get(&key) {
                return Arc::clone(breaker);
            }
        }

        let config = self.config_for_service(service);
        let mut breakers = self.circuit_breakers.write();

        // Double-check pattern (another thread might have created it)
        if let Some(breaker) = breakers.get(&key) {
            return Arc::clone(breaker);
        }

        let breaker = Arc::new(CircuitBreaker::with_collector(
            key.clone(),
            config,
            Arc::clone(&self.collector),
        ));
        breakers.insert(key.clone(), Arc::clone(&breaker));

        info!(
            component = %key,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    /// Existing breaker, without creating one
    pub fn find(&self, service: &str, operation: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuit_breakers
            .read()
            .get(&breaker_key(service, operation))
            .cloned()
    }

    /// Get all circuit breaker names
    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuit_breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.circuit_breakers.read().values().cloned().collect();
        let mut system = SystemCircuitBreakerMetrics::new();
        for breaker in breakers {
            system.add_circuit_breaker(breaker.name().to_string(), breaker.metrics());
        }
        system
    }

    /// Keys of breakers currently open
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuit_breakers
            .read()
            .iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(key, _)| key.clone())
            .collect();
        open.sort();
        open
    }

    /// Whether any operation of `service` is behind an open circuit
    pub fn service_has_open_circuit(&self, service: &str) -> bool {
        let prefix = format!("{service}::");
        self.circuit_breakers
            .read()
            .iter()
            .any(|(key, breaker)| key.starts_with(&prefix) && breaker.state() == CircuitState::Open)
    }

    /// Force all circuit breakers open (emergency stop)
    pub fn force_open_all(&self) {
        warn!("🚨 Forcing all circuit breakers open");
        for breaker in self.circuit_breakers.read().values() {
            breaker.force_open();
        }
    }

    /// Force all circuit breakers closed (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("🚨 Forcing all circuit breakers closed");
        for breaker in self.circuit_breakers.read().values() {
            breaker.force_closed();
        }
    }

    /// Drop every breaker belonging to a deregistered service
    pub fn remove_service(&self, service: &str) -> usize {
        let prefix = format!("{service}::");
        let mut breakers = self.circuit_breakers.write();
        let before = breakers.len();
        breakers.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - breakers.len();
        if removed > 0 {
            info!(service = service, removed = removed, "Removed circuit breakers");
        }
        removed
    }
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
