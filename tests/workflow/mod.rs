mod delays;
mod due_dates;
mod notifications;
mod progression;
mod reconciliation;
mod revert;
mod sub_workflows;
mod version_update;
