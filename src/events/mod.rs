pub mod domain;
pub mod publisher;

pub use domain::{DomainEvent, SkipReason};
pub use publisher::{EventPublisher, PublishError, PublishedEvent};
