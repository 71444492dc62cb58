//! # Task Model
//!
//! A [`Task`] is one step of a running workflow, created from the
//! [`TaskTemplate`](super::template::TaskTemplate) at the same position.
//! Tasks move `Pending -> Active -> {Completed, Skipped}` and are only ever
//! mutated through the workflow state machine.
//!
//! ## Performers
//!
//! Each task carries [`TaskPerformer`] rows, one per assigned user or group.
//! Rows resolved from the template have `directly_status = NoStatus`; manual
//! overrides are recorded as `Created` or `Deleted` and survive performer
//! re-resolution on revert and template version updates.
//!
//! A group row counts as completed once any member of the group completes
//! the task. With `require_completion_by_all` every non-deleted row must be
//! completed before the task can complete, otherwise one row suffices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::user::GroupMemberships;
use super::{GroupId, UserId};
use crate::state_machine::states::TaskStatus;

/// A concrete performer of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PerformerRef {
    User { user_id: UserId },
    Group { group_id: GroupId },
}

impl PerformerRef {
    pub fn includes(&self, user: UserId, groups: &GroupMemberships) -> bool {
        match self {
            Self::User { user_id } => *user_id == user,
            Self::Group { group_id } => groups.is_member(*group_id, user),
        }
    }
}

/// Manual override marker of a performer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DirectlyStatus {
    #[default]
    NoStatus,
    Created,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPerformer {
    pub performer: PerformerRef,
    #[serde(default)]
    pub directly_status: DirectlyStatus,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub date_completed: Option<DateTime<Utc>>,
    /// The user who completed the row; differs from the row for groups
    #[serde(default)]
    pub completed_by: Option<UserId>,
}

impl TaskPerformer {
    pub fn resolved(performer: PerformerRef) -> Self {
        Self {
            performer,
            directly_status: DirectlyStatus::NoStatus,
            is_completed: false,
            date_completed: None,
            completed_by: None,
        }
    }

    pub fn manual(performer: PerformerRef) -> Self {
        Self {
            directly_status: DirectlyStatus::Created,
            ..Self::resolved(performer)
        }
    }

    pub fn is_active(&self) -> bool {
        self.directly_status != DirectlyStatus::Deleted
    }

    fn clear_completion(&mut self) {
        self.is_completed = false;
        self.date_completed = None;
        self.completed_by = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub api_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 1-based position in the workflow
    pub number: u32,
    pub status: TaskStatus,
    pub due_date: Option<DateTime<Utc>>,
    /// Set once a user changed the due date; manual due dates are never recomputed
    #[serde(default)]
    pub due_date_manual: bool,
    pub date_started: Option<DateTime<Utc>>,
    pub date_completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub ancestors: Vec<String>,
    #[serde(default)]
    pub performers: Vec<TaskPerformer>,
    #[serde(default)]
    pub require_completion_by_all: bool,
    /// The template delay preceding this task has already been served
    #[serde(default)]
    pub delay_elapsed: bool,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    pub fn active_performers(&self) -> impl Iterator<Item = &TaskPerformer> {
        self.performers.iter().filter(|p| p.is_active())
    }

    pub fn has_active_performers(&self) -> bool {
        self.active_performers().next().is_some()
    }

    pub fn row(&self, performer: &PerformerRef) -> Option<&TaskPerformer> {
        self.performers.iter().find(|p| &p.performer == performer)
    }

    pub fn row_mut(&mut self, performer: &PerformerRef) -> Option<&mut TaskPerformer> {
        self.performers.iter_mut().find(|p| &p.performer == performer)
    }

    /// Whether `user` is an active performer, directly or through a group.
    pub fn is_performer(&self, user: UserId, groups: &GroupMemberships) -> bool {
        self.active_performers()
            .any(|p| p.performer.includes(user, groups))
    }

    /// Whether every active row that includes `user` is already completed.
    pub fn is_completed_for(&self, user: UserId, groups: &GroupMemberships) -> bool {
        let mut rows = self
            .active_performers()
            .filter(|p| p.performer.includes(user, groups))
            .peekable();
        rows.peek().is_some() && rows.all(|p| p.is_completed)
    }

    /// Mark every incomplete active row that includes `user`. Returns whether
    /// anything changed.
    pub fn mark_completed_by(
        &mut self,
        user: UserId,
        groups: &GroupMemberships,
        at: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;
        for row in self.performers.iter_mut() {
            if row.is_active() && !row.is_completed && row.performer.includes(user, groups) {
                row.is_completed = true;
                row.date_completed = Some(at);
                row.completed_by = Some(user);
                changed = true;
            }
        }
        changed
    }

    /// Completion policy over the active performer rows.
    pub fn can_be_completed(&self) -> bool {
        let mut rows = self.active_performers().peekable();
        if rows.peek().is_none() {
            return false;
        }
        if self.require_completion_by_all {
            rows.all(|p| p.is_completed)
        } else {
            rows.any(|p| p.is_completed)
        }
    }

    /// Lowest user id among completed rows, used when a completion has to be
    /// attributed without an acting user.
    pub fn first_completed_user(&self) -> Option<UserId> {
        self.active_performers()
            .filter(|p| p.is_completed)
            .filter_map(|p| p.completed_by)
            .min()
    }

    /// Replace template-resolved rows with `resolved`, keeping manual overrides.
    ///
    /// A resolved performer that was manually deleted stays deleted. With
    /// `keep_progress` rows that remain assigned keep their completion marks,
    /// otherwise every kept row starts over.
    pub fn merge_performers(&mut self, resolved: &[PerformerRef], keep_progress: bool) {
        self.performers.retain(|p| {
            p.directly_status != DirectlyStatus::NoStatus
                || (keep_progress && resolved.contains(&p.performer))
        });
        if !keep_progress {
            for row in self.performers.iter_mut() {
                row.clear_completion();
            }
        }
        for performer in resolved {
            if self.row(performer).is_none() {
                self.performers.push(TaskPerformer::resolved(*performer));
            }
        }
    }

    /// Assign `performer` manually. Returns whether anything changed.
    pub fn add_manual_performer(&mut self, performer: PerformerRef) -> bool {
        match self.row_mut(&performer) {
            Some(row) if row.is_active() => false,
            Some(row) => {
                row.directly_status = DirectlyStatus::Created;
                row.clear_completion();
                true
            }
            None => {
                self.performers.push(TaskPerformer::manual(performer));
                true
            }
        }
    }

    /// Mark `performer` as manually removed. Returns whether anything changed.
    pub fn remove_performer(&mut self, performer: PerformerRef) -> bool {
        match self.row_mut(&performer) {
            Some(row) if row.is_active() => {
                row.directly_status = DirectlyStatus::Deleted;
                true
            }
            _ => false,
        }
    }

    /// Back to `Pending` with cleared dates and completion marks.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.date_started = None;
        self.date_completed = None;
        self.delay_elapsed = false;
        if !self.due_date_manual {
            self.due_date = None;
        }
        for row in self.performers.iter_mut() {
            row.clear_completion();
        }
    }

    /// User ids assigned directly (not through a group) and still active.
    pub fn direct_user_ids(&self) -> impl Iterator<Item = UserId> + '_ {
        self.active_performers().filter_map(|p| match p.performer {
            PerformerRef::User { user_id } => Some(user_id),
            PerformerRef::Group { .. } => None,
        })
    }
}
