use crate::error::{WorkflowError, WorkflowResult};
use crate::models::task::Task;
use crate::models::user::GroupMemberships;
use crate::models::workflow::Workflow;
use crate::models::UserId;

use super::states::{TaskStatus, WorkflowStatus};

/// Trait for implementing state transition guards
pub trait StateGuard<T> {
    /// Check if a transition is allowed
    fn check(&self, entity: &T) -> WorkflowResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// Guard requiring the workflow to be in one of the given statuses
pub struct WorkflowStatusGuard(pub &'static [WorkflowStatus]);

/// Workflow must be running for task progression
pub const WORKFLOW_RUNNING: WorkflowStatusGuard = WorkflowStatusGuard(&[WorkflowStatus::Running]);

/// Workflow must be running or delayed for edits
pub const WORKFLOW_OPEN: WorkflowStatusGuard =
    WorkflowStatusGuard(&[WorkflowStatus::Running, WorkflowStatus::Delayed]);

impl StateGuard<Workflow> for WorkflowStatusGuard {
    fn check(&self, workflow: &Workflow) -> WorkflowResult<()> {
        if self.0.contains(&workflow.status) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidWorkflowState {
                workflow_id: workflow.id,
                current: workflow.status,
                expected: self.0.to_vec(),
            })
        }
    }

    fn description(&self) -> &'static str {
        "Workflow must be in an allowed status"
    }
}

/// Guard requiring the task to be in one of the given statuses
pub struct TaskStatusGuard(pub &'static [TaskStatus]);

/// Task must be active
pub const TASK_ACTIVE: TaskStatusGuard = TaskStatusGuard(&[TaskStatus::Active]);

/// Task must not have finished yet
pub const TASK_UNFINISHED: TaskStatusGuard =
    TaskStatusGuard(&[TaskStatus::Pending, TaskStatus::Active]);

impl StateGuard<Task> for TaskStatusGuard {
    fn check(&self, task: &Task) -> WorkflowResult<()> {
        if self.0.contains(&task.status) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidTaskState {
                task_id: task.id,
                current: task.status,
                expected: self.0.to_vec(),
            })
        }
    }

    fn description(&self) -> &'static str {
        "Task must be in an allowed status"
    }
}

/// Guard requiring the user to be an active performer of the task
pub struct ActivePerformerGuard<'a> {
    pub user: UserId,
    pub groups: &'a GroupMemberships,
}

impl StateGuard<Task> for ActivePerformerGuard<'_> {
    fn check(&self, task: &Task) -> WorkflowResult<()> {
        if task.is_performer(self.user, self.groups) {
            Ok(())
        } else {
            Err(WorkflowError::PerformerDenied {
                task_id: task.id,
                user_id: self.user,
            })
        }
    }

    fn description(&self) -> &'static str {
        "User must be an active performer of the task"
    }
}

/// Guard allowing active performers of the task and workflow owners
pub struct PerformerOrOwnerGuard<'a> {
    pub user: UserId,
    pub groups: &'a GroupMemberships,
    pub workflow: &'a Workflow,
}

impl StateGuard<Task> for PerformerOrOwnerGuard<'_> {
    fn check(&self, task: &Task) -> WorkflowResult<()> {
        if task.is_performer(self.user, self.groups) || self.workflow.is_owner(self.user, self.groups)
        {
            Ok(())
        } else {
            Err(WorkflowError::PerformerDenied {
                task_id: task.id,
                user_id: self.user,
            })
        }
    }

    fn description(&self) -> &'static str {
        "User must be a performer of the task or an owner of the workflow"
    }
}
