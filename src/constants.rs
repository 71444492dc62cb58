//! # System Constants
//!
//! Event names, periodic lock names and other fixed identifiers shared by the
//! engine, the background services and event subscribers.

/// Names of published domain events
pub mod events {
    // Workflow lifecycle events
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    pub const WORKFLOW_TERMINATED: &str = "workflow.terminated";
    pub const WORKFLOW_DELAYED: &str = "workflow.delayed";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_REVERTED: &str = "workflow.reverted";
    pub const WORKFLOW_URGENCY_CHANGED: &str = "workflow.urgency_changed";
    pub const WORKFLOW_VERSION_UPDATED: &str = "workflow.version_updated";

    // Task lifecycle events
    pub const TASK_ACTIVATED: &str = "task.activated";
    pub const TASK_SKIPPED: &str = "task.skipped";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_PERFORMER_COMPLETED: &str = "task.performer_completed";
    pub const TASK_PERFORMER_ADDED: &str = "task.performer_added";
    pub const TASK_PERFORMER_REMOVED: &str = "task.performer_removed";
    pub const TASK_DUE_DATE_CHANGED: &str = "task.due_date_changed";

    // Conversation events
    pub const COMMENT_POSTED: &str = "comment.posted";
    pub const COMMENT_REACTED: &str = "comment.reacted";
}

/// Names of cluster-wide periodic locks
pub mod locks {
    pub const OVERDUE_TASKS: &str = "overdue_tasks";
    pub const DELAYED_WORKFLOWS: &str = "delayed_workflows";
}

/// Service names used in collaborator errors
pub mod services {
    pub const USER_DIRECTORY: &str = "user directory";
    pub const FIELD_SERVICE: &str = "field service";
    pub const GUEST_AUTH: &str = "guest auth";
}

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PATHWAY";
