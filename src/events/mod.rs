pub mod publisher;
pub mod types;

// Re-export key types for convenience
pub use publisher::{EventPublisher, PublishedEvent};
pub use types::OrchestrationEvent;
