use crate::logging::{log_task_operation, log_workflow_operation};
use crate::models::task::Task;
use crate::models::workflow::Workflow;

/// Trait for implementing state transition actions
pub trait StateAction<T> {
    /// Execute the action after the entity moved from `from_state` to `to_state`
    fn execute(&self, entity: &T, from_state: &str, to_state: &str, event: &str);

    /// Get a description of this action for logging
    fn description(&self) -> &'static str;
}

/// Emits one structured log record per applied transition
pub struct LogTransitionAction;

impl StateAction<Workflow> for LogTransitionAction {
    fn execute(&self, workflow: &Workflow, from_state: &str, to_state: &str, event: &str) {
        let details = format!("{from_state} -> {to_state}");
        log_workflow_operation(
            event,
            Some(workflow.id),
            Some(&workflow.name),
            to_state,
            Some(&details),
        );
    }

    fn description(&self) -> &'static str {
        "Log workflow status transition"
    }
}

impl StateAction<Task> for LogTransitionAction {
    fn execute(&self, task: &Task, from_state: &str, to_state: &str, event: &str) {
        let details = format!("#{} {from_state} -> {to_state}", task.number);
        log_task_operation(
            event,
            Some(task.workflow_id),
            Some(task.id),
            Some(&task.api_name),
            to_state,
            Some(&details),
        );
    }

    fn description(&self) -> &'static str {
        "Log task status transition"
    }
}
