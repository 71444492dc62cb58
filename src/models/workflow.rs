//! # Workflow Model
//!
//! A [`Workflow`] is a running instance of a template version. Its
//! `current_task` is a 1-based pointer into the task list; the value
//! `tasks_count + 1` means the workflow moved past its last task.
//!
//! `version` is the optimistic concurrency token. Every committed change
//! increments it and a commit whose expected version no longer matches is
//! rejected by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::field::FieldSet;
use super::template::OwnerRef;
use super::{AccountId, UserId};
use crate::state_machine::states::WorkflowStatus;

/// Who started a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStarter {
    User { user_id: UserId },
    /// Started by an integration or public form
    External,
}

impl WorkflowStarter {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::User { user_id } => Some(*user_id),
            Self::External => None,
        }
    }
}

/// The task a sub-workflow was started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentTaskRef {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub account_id: AccountId,
    pub template_id: Uuid,
    pub template_version: i32,
    pub template_name: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub current_task: u32,
    pub tasks_count: u32,
    pub is_urgent: bool,
    pub due_date: Option<DateTime<Utc>>,
    pub starter: WorkflowStarter,
    pub owners: Vec<OwnerRef>,
    /// Every user ever assigned to one of the tasks
    pub members: BTreeSet<UserId>,
    pub fields: FieldSet,
    pub parent_task: Option<ParentTaskRef>,
    pub date_created: DateTime<Utc>,
    pub date_completed: Option<DateTime<Utc>>,
    pub version: i64,
}

impl Workflow {
    pub fn is_running(&self) -> bool {
        self.status == WorkflowStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether `current_task` points past the last task.
    pub fn is_past_last_task(&self) -> bool {
        self.current_task > self.tasks_count
    }

    pub fn is_owner(&self, user: UserId, groups: &super::user::GroupMemberships) -> bool {
        self.owners.iter().any(|owner| match owner {
            OwnerRef::User { user_id } => *user_id == user,
            OwnerRef::Group { group_id } => groups.is_member(*group_id, user),
        })
    }
}

/// Input for instantiating a workflow from a template.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkflow {
    pub name: Option<String>,
    pub starter: WorkflowStarter,
    pub kickoff: FieldSet,
    pub due_date: Option<DateTime<Utc>>,
    pub is_urgent: bool,
    pub parent_task: Option<ParentTaskRef>,
}
