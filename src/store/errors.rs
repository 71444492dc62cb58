use thiserror::Error;
use uuid::Uuid;

/// Errors raised by [`WorkflowStore`](super::WorkflowStore) implementations.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The stored workflow version moved on since it was loaded
    #[error("Workflow {workflow_id} was modified concurrently (expected version {expected})")]
    ConcurrentModification { workflow_id: Uuid, expected: i64 },

    #[error("Workflow {workflow_id} already exists")]
    Duplicate { workflow_id: Uuid },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PersistenceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether retrying the whole operation on fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}
