//! # Workflow Store
//!
//! Persistence behind one async trait. The engine loads a
//! [`WorkflowAggregate`], runs the state machine on it in memory and hands
//! the result back as a [`ChangeSet`]. A change set is committed in a
//! single transaction: every write is checked against the version it was
//! loaded at, and nothing is applied when any check fails.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryWorkflowStore`]: tests and embedders
//! - `PgWorkflowStore`: PostgreSQL via sqlx (`postgres` feature)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::aggregate::WorkflowAggregate;
use crate::models::notification::Notification;
use crate::models::task::PerformerRef;
use crate::models::template::Template;
use crate::models::{AccountId, UserId};

pub mod errors;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use errors::PersistenceError;
pub use memory::InMemoryWorkflowStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgAdvisoryLock, PgUserDirectory, PgWorkflowStore};

/// One workflow to write.
#[derive(Debug, Clone)]
pub struct AggregateWrite {
    pub aggregate: WorkflowAggregate,
    /// Version the aggregate was loaded at; `None` inserts a new workflow
    pub expected_version: Option<i64>,
}

/// Everything one external trigger changes.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub writes: Vec<AggregateWrite>,
    /// Audit rows of durable notifications created by the trigger
    pub notifications: Vec<Notification>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, aggregate: WorkflowAggregate) -> Self {
        self.writes.push(AggregateWrite {
            aggregate,
            expected_version: None,
        });
        self
    }

    pub fn update(mut self, aggregate: WorkflowAggregate, expected_version: i64) -> Self {
        self.writes.push(AggregateWrite {
            aggregate,
            expected_version: Some(expected_version),
        });
        self
    }

    pub fn with_notifications(mut self, notifications: Vec<Notification>) -> Self {
        self.notifications.extend(notifications);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.notifications.is_empty()
    }
}

/// An active task past its due date in a running workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct OverdueCandidate {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
    pub account_id: AccountId,
    pub due_date: DateTime<Utc>,
    /// Active performer rows that have not completed and have not been
    /// sent an overdue notification yet
    pub performers: Vec<PerformerRef>,
}

impl OverdueCandidate {
    /// Drop performers already notified about this task. `notified` holds
    /// the users with an OVERDUE row for the task. A group row counts as
    /// notified once anyone on the task was, since its members were expanded
    /// at that point.
    pub fn retain_unnotified(&mut self, notified: &HashSet<UserId>) {
        self.performers.retain(|performer| match performer {
            PerformerRef::User { user_id } => !notified.contains(user_id),
            PerformerRef::Group { .. } => notified.is_empty(),
        });
    }

    /// Whether anyone on the task is still owed a notification.
    pub fn is_pending(&self) -> bool {
        !self.performers.is_empty()
    }
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_template(&self, template: &Template) -> Result<(), PersistenceError>;

    /// A template version; the latest one when `version` is `None`.
    async fn load_template(
        &self,
        template_id: Uuid,
        version: Option<i32>,
    ) -> Result<Template, PersistenceError>;

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<WorkflowAggregate, PersistenceError>;

    async fn find_workflow_by_task(&self, task_id: Uuid) -> Result<Uuid, PersistenceError>;

    /// `(parent task id, child workflow id)` for every running or delayed
    /// sub-workflow started from a task of `workflow_id`.
    async fn blocking_sub_workflows(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(Uuid, Uuid)>, PersistenceError>;

    /// Apply a change set atomically. Returns the written aggregates with
    /// their new versions.
    async fn commit(&self, changes: ChangeSet) -> Result<Vec<WorkflowAggregate>, PersistenceError>;

    /// Up to `limit` overdue tasks, oldest due date first, that still have a
    /// performer without an OVERDUE notification. Already notified pairs are
    /// excluded before the limit applies.
    async fn find_overdue_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OverdueCandidate>, PersistenceError>;

    /// Insert notification rows, skipping any whose idempotency key already
    /// exists. Returns only the rows that were inserted.
    async fn insert_notifications_if_absent(
        &self,
        notifications: Vec<Notification>,
    ) -> Result<Vec<Notification>, PersistenceError>;

    /// Delayed workflows whose active delay ran out at or before `now`.
    async fn find_expired_delays(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, PersistenceError>;

    /// Running and delayed workflows of a template, any version.
    async fn workflows_for_template(&self, template_id: Uuid) -> Result<Vec<Uuid>, PersistenceError>;

    async fn notifications_for_user(
        &self,
        user_id: UserId,
        only_unread: bool,
    ) -> Result<Vec<Notification>, PersistenceError>;

    /// Move the user's notifications from NEW to READ. Returns how many
    /// changed.
    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        notification_ids: &[Uuid],
    ) -> Result<usize, PersistenceError>;
}
