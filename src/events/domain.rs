//! Domain events emitted by workflow transitions.
//!
//! The state machine returns these alongside the mutated aggregate. After a
//! successful commit they drive notification dispatch, analytics and the
//! in-process [`EventPublisher`](super::EventPublisher).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::events;
use crate::models::task::PerformerRef;
use crate::models::UserId;

/// Why a task was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoPerformers,
    Condition,
    /// Inserted by a template update before the workflow's position
    VersionUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    WorkflowStarted {
        workflow_id: Uuid,
        by: Option<UserId>,
    },
    WorkflowCompleted {
        workflow_id: Uuid,
        by: Option<UserId>,
    },
    WorkflowTerminated {
        workflow_id: Uuid,
        by: Option<UserId>,
    },
    WorkflowDelayed {
        workflow_id: Uuid,
        task_id: Option<Uuid>,
        until: Option<DateTime<Utc>>,
        by: Option<UserId>,
    },
    WorkflowResumed {
        workflow_id: Uuid,
        task_id: Option<Uuid>,
        by: Option<UserId>,
    },
    WorkflowReverted {
        workflow_id: Uuid,
        from_task_id: Uuid,
        to_task_id: Uuid,
        by: UserId,
        comment: Option<String>,
    },
    UrgencyChanged {
        workflow_id: Uuid,
        task_id: Option<Uuid>,
        is_urgent: bool,
        by: UserId,
    },
    VersionUpdated {
        workflow_id: Uuid,
        from_version: i32,
        to_version: i32,
    },
    TaskActivated {
        workflow_id: Uuid,
        task_id: Uuid,
    },
    TaskSkipped {
        workflow_id: Uuid,
        task_id: Uuid,
        reason: SkipReason,
    },
    TaskCompleted {
        workflow_id: Uuid,
        task_id: Uuid,
        by: UserId,
    },
    PerformerCompleted {
        workflow_id: Uuid,
        task_id: Uuid,
        user_id: UserId,
    },
    PerformerAdded {
        workflow_id: Uuid,
        task_id: Uuid,
        performer: PerformerRef,
        by: UserId,
    },
    PerformerRemoved {
        workflow_id: Uuid,
        task_id: Uuid,
        performer: PerformerRef,
        by: UserId,
    },
    DueDateChanged {
        workflow_id: Uuid,
        task_id: Uuid,
        old: Option<DateTime<Utc>>,
        new: Option<DateTime<Utc>>,
        by: Option<UserId>,
    },
    CommentPosted {
        workflow_id: Uuid,
        task_id: Uuid,
        author: UserId,
        text: String,
        mentions: Vec<UserId>,
    },
    CommentReacted {
        workflow_id: Uuid,
        task_id: Uuid,
        by: UserId,
        comment_author: UserId,
    },
}

impl DomainEvent {
    /// Published event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => events::WORKFLOW_STARTED,
            Self::WorkflowCompleted { .. } => events::WORKFLOW_COMPLETED,
            Self::WorkflowTerminated { .. } => events::WORKFLOW_TERMINATED,
            Self::WorkflowDelayed { .. } => events::WORKFLOW_DELAYED,
            Self::WorkflowResumed { .. } => events::WORKFLOW_RESUMED,
            Self::WorkflowReverted { .. } => events::WORKFLOW_REVERTED,
            Self::UrgencyChanged { .. } => events::WORKFLOW_URGENCY_CHANGED,
            Self::VersionUpdated { .. } => events::WORKFLOW_VERSION_UPDATED,
            Self::TaskActivated { .. } => events::TASK_ACTIVATED,
            Self::TaskSkipped { .. } => events::TASK_SKIPPED,
            Self::TaskCompleted { .. } => events::TASK_COMPLETED,
            Self::PerformerCompleted { .. } => events::TASK_PERFORMER_COMPLETED,
            Self::PerformerAdded { .. } => events::TASK_PERFORMER_ADDED,
            Self::PerformerRemoved { .. } => events::TASK_PERFORMER_REMOVED,
            Self::DueDateChanged { .. } => events::TASK_DUE_DATE_CHANGED,
            Self::CommentPosted { .. } => events::COMMENT_POSTED,
            Self::CommentReacted { .. } => events::COMMENT_REACTED,
        }
    }

    pub fn workflow_id(&self) -> Uuid {
        match self {
            Self::WorkflowStarted { workflow_id, .. }
            | Self::WorkflowCompleted { workflow_id, .. }
            | Self::WorkflowTerminated { workflow_id, .. }
            | Self::WorkflowDelayed { workflow_id, .. }
            | Self::WorkflowResumed { workflow_id, .. }
            | Self::WorkflowReverted { workflow_id, .. }
            | Self::UrgencyChanged { workflow_id, .. }
            | Self::VersionUpdated { workflow_id, .. }
            | Self::TaskActivated { workflow_id, .. }
            | Self::TaskSkipped { workflow_id, .. }
            | Self::TaskCompleted { workflow_id, .. }
            | Self::PerformerCompleted { workflow_id, .. }
            | Self::PerformerAdded { workflow_id, .. }
            | Self::PerformerRemoved { workflow_id, .. }
            | Self::DueDateChanged { workflow_id, .. }
            | Self::CommentPosted { workflow_id, .. }
            | Self::CommentReacted { workflow_id, .. } => *workflow_id,
        }
    }

    /// Whether the event marks a finished workflow.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowTerminated { .. }
        )
    }
}
