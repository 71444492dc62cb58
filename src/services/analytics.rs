//! Analytics contract.
//!
//! Recording is fire-and-forget: the engine calls it from a spawned task
//! after commit and only logs failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::events::DomainEvent;
use crate::models::{AccountId, UserId};

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("Analytics backend rejected event: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub name: &'static str,
    pub account_id: AccountId,
    pub workflow_id: Uuid,
    pub task_id: Option<Uuid>,
    pub user_id: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

impl AnalyticsEvent {
    /// The analytics record for a domain event, if the event is tracked.
    pub fn from_domain(
        event: &DomainEvent,
        account_id: AccountId,
        occurred_at: DateTime<Utc>,
    ) -> Option<Self> {
        let (task_id, user_id) = match event {
            DomainEvent::WorkflowStarted { by, .. }
            | DomainEvent::WorkflowCompleted { by, .. }
            | DomainEvent::WorkflowTerminated { by, .. } => (None, *by),
            DomainEvent::WorkflowDelayed { task_id, by, .. }
            | DomainEvent::WorkflowResumed { task_id, by, .. } => (*task_id, *by),
            DomainEvent::WorkflowReverted {
                from_task_id, by, ..
            } => (Some(*from_task_id), Some(*by)),
            DomainEvent::TaskCompleted { task_id, by, .. } => (Some(*task_id), Some(*by)),
            _ => return None,
        };
        Some(Self {
            name: event.name(),
            account_id,
            workflow_id: event.workflow_id(),
            task_id,
            user_id,
            occurred_at,
        })
    }
}

#[async_trait]
pub trait AnalyticsService: Send + Sync {
    async fn record(&self, event: &AnalyticsEvent) -> Result<(), AnalyticsError>;
}

/// Writes analytics events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

#[async_trait]
impl AnalyticsService for TracingAnalytics {
    async fn record(&self, event: &AnalyticsEvent) -> Result<(), AnalyticsError> {
        info!(
            event = event.name,
            account_id = event.account_id,
            workflow_id = %event.workflow_id,
            task_id = ?event.task_id,
            user_id = ?event.user_id,
            "ANALYTICS"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_events() {
        let workflow_id = Uuid::now_v7();
        let task_id = Uuid::now_v7();
        let now = Utc::now();

        let completed = DomainEvent::TaskCompleted {
            workflow_id,
            task_id,
            by: 4,
        };
        let record = AnalyticsEvent::from_domain(&completed, 1, now).unwrap();
        assert_eq!(record.name, "task.completed");
        assert_eq!(record.task_id, Some(task_id));
        assert_eq!(record.user_id, Some(4));

        let activated = DomainEvent::TaskActivated {
            workflow_id,
            task_id,
        };
        assert!(AnalyticsEvent::from_domain(&activated, 1, now).is_none());
    }
}
