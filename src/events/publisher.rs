//! # Event Publisher
//!
//! Broadcasts domain events after their transition is committed. Observers
//! subscribe and receive every later event; slow observers lag and lose the
//! oldest events rather than blocking the engine.
//!
//! ```rust
//! use pathway_core::events::{DomainEvent, EventPublisher};
//! use uuid::Uuid;
//!
//! # tokio_test::block_on(async {
//! let publisher = EventPublisher::new(16);
//! let mut events = publisher.subscribe();
//!
//! publisher
//!     .publish(&DomainEvent::WorkflowStarted { workflow_id: Uuid::now_v7(), by: Some(7) })
//!     .unwrap();
//! assert_eq!(events.recv().await.unwrap().name, "workflow.started");
//! # });
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use super::domain::DomainEvent;

/// Broadcast publisher for committed domain events
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<PublishedEvent>,
}

/// Event that has been published
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub name: &'static str,
    pub event: DomainEvent,
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a committed event to every subscriber
    pub fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        let published = PublishedEvent {
            name: event.name(),
            context: serde_json::to_value(event)?,
            event: event.clone(),
            published_at: Utc::now(),
        };

        // Sending fails only when nobody subscribed, which is fine
        if self.sender.send(published).is_err() {
            trace!(event = event.name(), "No subscribers for published event");
        }
        Ok(())
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Error types for event publishing
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
