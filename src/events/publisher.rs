use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::OrchestrationEvent;
use crate::constants::system;
use crate::resilience::{CircuitState, MetricsCollector};

/// Fan-out publisher for lifecycle events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: &'static str,
    pub event: OrchestrationEvent,
    pub published_at: DateTime<Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Never blocks; with no subscribers the event is
    /// dropped and slow subscribers observe a lag instead of stalling the
    /// publisher.
    pub fn publish(&self, event: OrchestrationEvent) {
        let published = PublishedEvent {
            name: event.name(),
            event,
            published_at: Utc::now(),
        };
        trace!(event = published.name, "Publishing orchestration event");

        // send() only fails when nobody is subscribed, which is fine
        let _ = self.sender.send(published);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(system::EVENT_CHANNEL_CAPACITY)
    }
}

/// Breaker transitions go out on the bus alongside the usual trace records
impl MetricsCollector for EventPublisher {
    fn record_state_transition(&self, name: &str, from: CircuitState, to: CircuitState) {
        self.publish(OrchestrationEvent::CircuitStateChanged {
            breaker: name.to_string(),
            from,
            to,
        });
    }

    fn record_operation_timing(&self, name: &str, duration: Duration, success: bool) {
        trace!(
            circuit_breaker = name,
            duration_ms = duration.as_millis() as u64,
            success = success,
            "Circuit breaker operation timing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let publisher = EventPublisher::new(8);
        publisher.publish(OrchestrationEvent::WorkflowPaused {
            workflow_id: Uuid::new_v4(),
        });
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_named_event() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        let workflow_id = Uuid::new_v4();
        publisher.publish(OrchestrationEvent::WorkflowResumed { workflow_id });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "workflow.resumed");
        assert_eq!(received.event.workflow_id(), Some(workflow_id));
    }

    #[tokio::test]
    async fn test_breaker_transitions_are_published() {
        let publisher = EventPublisher::new(8);
        let mut rx = publisher.subscribe();
        publisher.record_state_transition("render-service::execute", CircuitState::Closed, CircuitState::Open);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.name, "circuit.state_changed");
        assert!(matches!(
            received.event,
            OrchestrationEvent::CircuitStateChanged { to: CircuitState::Open, .. }
        ));
    }
}
