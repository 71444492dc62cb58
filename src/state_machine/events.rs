use serde::{Deserialize, Serialize};

use super::states::{TaskStatus, WorkflowStatus};

/// Events that can trigger workflow status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Pause the workflow
    Delay,
    /// Continue a paused workflow
    Resume,
    /// Move past the last task
    Finish,
    /// Stop the workflow
    Terminate,
}

impl WorkflowEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Delay => "delay",
            Self::Resume => "resume",
            Self::Finish => "finish",
            Self::Terminate => "terminate",
        }
    }

    /// Statuses the event may be applied in
    pub fn allowed_from(&self) -> &'static [WorkflowStatus] {
        match self {
            Self::Delay | Self::Finish => &[WorkflowStatus::Running],
            Self::Resume => &[WorkflowStatus::Delayed],
            Self::Terminate => &[WorkflowStatus::Running, WorkflowStatus::Delayed],
        }
    }
}

/// Events that can trigger task status transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Activate,
    Complete,
    Skip,
    /// Back to pending on revert
    Reset,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Complete => "complete",
            Self::Skip => "skip",
            Self::Reset => "reset",
        }
    }

    /// Statuses the event may be applied in
    pub fn allowed_from(&self) -> &'static [TaskStatus] {
        match self {
            Self::Activate => &[TaskStatus::Pending],
            Self::Complete => &[TaskStatus::Active],
            Self::Skip => &[TaskStatus::Pending, TaskStatus::Active],
            Self::Reset => &[
                TaskStatus::Pending,
                TaskStatus::Active,
                TaskStatus::Completed,
                TaskStatus::Skipped,
            ],
        }
    }
}

/// Target status of a workflow event, `None` when not allowed
pub fn determine_workflow_target(
    current: WorkflowStatus,
    event: WorkflowEvent,
) -> Option<WorkflowStatus> {
    let target = match event {
        WorkflowEvent::Delay => WorkflowStatus::Delayed,
        WorkflowEvent::Resume => WorkflowStatus::Running,
        WorkflowEvent::Finish => WorkflowStatus::Done,
        WorkflowEvent::Terminate => WorkflowStatus::Terminated,
    };
    (event.allowed_from().contains(&current) && current.can_transition_to(target))
        .then_some(target)
}

/// Target status of a task event, `None` when not allowed
pub fn determine_task_target(current: TaskStatus, event: TaskEvent) -> Option<TaskStatus> {
    let target = match event {
        TaskEvent::Activate => TaskStatus::Active,
        TaskEvent::Complete => TaskStatus::Completed,
        TaskEvent::Skip => TaskStatus::Skipped,
        TaskEvent::Reset => TaskStatus::Pending,
    };
    (event.allowed_from().contains(&current) && current.can_transition_to(target))
        .then_some(target)
}
