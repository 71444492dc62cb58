// State machine module for workflow progression
//
// Statuses, transition events, guards and actions for workflows and tasks,
// plus the WorkflowStateMachine that applies one trigger to an aggregate.

pub mod actions;
pub mod context;
pub mod events;
pub mod guards;
pub mod states;
pub mod workflow_state_machine;

// Re-export main types for convenient access
pub use context::TransitionContext;
pub use events::{TaskEvent, WorkflowEvent};
pub use states::{TaskStatus, WorkflowStatus};
pub use workflow_state_machine::{CompletionCheck, TransitionOutcome, WorkflowStateMachine};

// Common traits
pub use actions::StateAction;
pub use guards::StateGuard;
