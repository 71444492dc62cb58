use thiserror::Error;
use uuid::Uuid;

use crate::models::template::TemplateError;
use crate::state_machine::states::{TaskStatus, WorkflowStatus};
use crate::store::PersistenceError;

/// Errors raised by workflow operations.
///
/// Everything except `Persistence` and `Collaborator` is a rejected request:
/// the transition was not applied and stored state is unchanged.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Template configuration error: {0}")]
    Configuration(#[from] TemplateError),

    #[error("Task {task_id} is {current}, expected one of {expected:?}")]
    InvalidTaskState {
        task_id: Uuid,
        current: TaskStatus,
        expected: Vec<TaskStatus>,
    },

    #[error("Workflow {workflow_id} is {current}, expected one of {expected:?}")]
    InvalidWorkflowState {
        workflow_id: Uuid,
        current: WorkflowStatus,
        expected: Vec<WorkflowStatus>,
    },

    #[error("User {user_id} is not allowed to act on task {task_id}")]
    PerformerDenied { task_id: Uuid, user_id: i64 },

    #[error("Invalid value for field '{api_name}': {reason}")]
    FieldValidation { api_name: String, reason: String },

    #[error("Task {task_id} cannot be reverted to '{target}'")]
    InvalidRevertTarget { task_id: Uuid, target: String },

    #[error("Task {task_id} must keep at least one performer")]
    LastPerformer { task_id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("{service} failed: {reason}")]
    Collaborator { service: &'static str, reason: String },
}

impl WorkflowError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn collaborator(service: &'static str, reason: impl ToString) -> Self {
        Self::Collaborator {
            service,
            reason: reason.to_string(),
        }
    }

    /// Whether the caller sent a request the current state does not allow,
    /// as opposed to an infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Persistence(_) | Self::Collaborator { .. })
    }
}

pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;
