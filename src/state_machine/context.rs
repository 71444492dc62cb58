//! # Transition Context
//!
//! Everything a transition reads besides the aggregate and the template.
//!
//! The state machine is synchronous and performs no I/O, so the engine
//! loads group memberships and sub-workflow blockers before running it and
//! fixes the transition time up front. Tests build contexts directly to run
//! the machine at chosen instants.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::models::user::GroupMemberships;
use crate::models::UserId;

#[derive(Debug, Clone)]
pub struct TransitionContext {
    /// Timestamp applied to every change made by the transition
    pub now: DateTime<Utc>,
    /// Correlation id carried into logs
    pub correlation_id: Uuid,
    /// Members of every group assigned to or owning the workflow
    pub groups: GroupMemberships,
    /// Placeholder performer for externally started workflows
    pub external_user_id: UserId,
    /// Tasks of the workflow that still wait for sub-workflows
    pub blocked_tasks: HashSet<Uuid>,
}

impl TransitionContext {
    pub fn new(now: DateTime<Utc>, external_user_id: UserId) -> Self {
        Self {
            now,
            correlation_id: Uuid::now_v7(),
            groups: GroupMemberships::default(),
            external_user_id,
            blocked_tasks: HashSet::new(),
        }
    }

    pub fn with_groups(mut self, groups: GroupMemberships) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_blocked_tasks(mut self, blocked: impl IntoIterator<Item = Uuid>) -> Self {
        self.blocked_tasks = blocked.into_iter().collect();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }
}
