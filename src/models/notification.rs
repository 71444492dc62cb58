//! Notification types and audit rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{AccountId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewTask,
    TaskCompleted,
    WorkflowCompleted,
    OverdueTask,
    DueDateChanged,
    DelayWorkflow,
    ResumeWorkflow,
    Urgent,
    NotUrgent,
    ReturnTask,
    Comment,
    Mention,
    Reaction,
}

/// The subscription flag that gates email for a notification type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    NewTasks,
    CompleteTasks,
    CommentsMentions,
    Always,
}

impl NotificationType {
    /// Durable types get an audit row before dispatch.
    pub fn is_durable(&self) -> bool {
        !matches!(
            self,
            Self::NewTask | Self::TaskCompleted | Self::WorkflowCompleted
        )
    }

    /// Whether the acting user is removed from the recipients.
    pub fn excludes_author(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted
                | Self::DueDateChanged
                | Self::Urgent
                | Self::NotUrgent
                | Self::ReturnTask
                | Self::Comment
                | Self::Mention
                | Self::Reaction
        )
    }

    pub fn subscription(&self) -> Subscription {
        match self {
            Self::NewTask => Subscription::NewTasks,
            Self::TaskCompleted | Self::WorkflowCompleted => Subscription::CompleteTasks,
            Self::Comment | Self::Mention | Self::Reaction => Subscription::CommentsMentions,
            _ => Subscription::Always,
        }
    }

    /// Whether the notification concerns the workflow rather than one task.
    pub fn is_workflow_scoped(&self) -> bool {
        matches!(self, Self::WorkflowCompleted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewTask => "new_task",
            Self::TaskCompleted => "task_completed",
            Self::WorkflowCompleted => "workflow_completed",
            Self::OverdueTask => "overdue_task",
            Self::DueDateChanged => "due_date_changed",
            Self::DelayWorkflow => "delay_workflow",
            Self::ResumeWorkflow => "resume_workflow",
            Self::Urgent => "urgent",
            Self::NotUrgent => "not_urgent",
            Self::ReturnTask => "return_task",
            Self::Comment => "comment",
            Self::Mention => "mention",
            Self::Reaction => "reaction",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_task" => Ok(Self::NewTask),
            "task_completed" => Ok(Self::TaskCompleted),
            "workflow_completed" => Ok(Self::WorkflowCompleted),
            "overdue_task" => Ok(Self::OverdueTask),
            "due_date_changed" => Ok(Self::DueDateChanged),
            "delay_workflow" => Ok(Self::DelayWorkflow),
            "resume_workflow" => Ok(Self::ResumeWorkflow),
            "urgent" => Ok(Self::Urgent),
            "not_urgent" => Ok(Self::NotUrgent),
            "return_task" => Ok(Self::ReturnTask),
            "comment" => Ok(Self::Comment),
            "mention" => Ok(Self::Mention),
            "reaction" => Ok(Self::Reaction),
            _ => Err(format!("Invalid notification type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    New,
    Read,
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Read => write!(f, "read"),
        }
    }
}

impl std::str::FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "read" => Ok(Self::Read),
            _ => Err(format!("Invalid notification status: {s}")),
        }
    }
}

/// Audit row for a durable notification.
///
/// For `OverdueTask` the `(task_id, user_id, notification_type)` triple is
/// unique and doubles as the reconciler's idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub account_id: AccountId,
    pub user_id: UserId,
    pub workflow_id: Uuid,
    pub task_id: Option<Uuid>,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub author: Option<UserId>,
    pub text: Option<String>,
    pub datetime: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        account_id: AccountId,
        user_id: UserId,
        workflow_id: Uuid,
        task_id: Option<Uuid>,
        notification_type: NotificationType,
        datetime: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            account_id,
            user_id,
            workflow_id,
            task_id,
            notification_type,
            status: NotificationStatus::New,
            author: None,
            text: None,
            datetime,
        }
    }

    pub fn with_author(mut self, author: Option<UserId>) -> Self {
        self.author = author;
        self
    }

    pub fn with_text(mut self, text: Option<String>) -> Self {
        self.text = text;
        self
    }

    /// Idempotency key of overdue rows.
    pub fn overdue_key(&self) -> Option<(Uuid, UserId)> {
        match (self.notification_type, self.task_id) {
            (NotificationType::OverdueTask, Some(task_id)) => Some((task_id, self.user_id)),
            _ => None,
        }
    }
}
