//! # Template Version Updates
//!
//! Moves an open workflow onto a newer template version. Tasks are matched
//! by api-name: matched tasks keep their runtime state, new tasks are
//! created, removed tasks disappear. New tasks placed before the workflow's
//! position are skipped. The state machine then settles the current task
//! against the new definition.

use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::WorkflowResult;
use crate::events::{DomainEvent, SkipReason};
use crate::models::aggregate::WorkflowAggregate;
use crate::models::graph::CompiledTemplate;
use crate::models::task::Task;
use crate::state_machine::{
    TaskStatus, TransitionContext, TransitionOutcome, WorkflowStateMachine,
};

pub struct WorkflowVersionUpdater;

impl WorkflowVersionUpdater {
    /// Rebuild `aggregate` for `template` and settle it. A workflow already
    /// on that version, or one that is finished, is returned unchanged.
    pub fn apply(
        template: &CompiledTemplate,
        context: &TransitionContext,
        aggregate: WorkflowAggregate,
    ) -> WorkflowResult<TransitionOutcome> {
        let from_version = aggregate.workflow.template_version;
        let to_version = template.template.version;
        if from_version == to_version || aggregate.workflow.is_finished() {
            return Ok(WorkflowStateMachine::new(template, context, aggregate).into_outcome());
        }

        let (rebuilt, skipped) = Self::rebuild(template, aggregate);
        let workflow_id = rebuilt.id();
        info!(
            %workflow_id,
            from_version,
            to_version,
            tasks = rebuilt.tasks.len(),
            "Updating workflow to new template version"
        );

        let mut machine = WorkflowStateMachine::new(template, context, rebuilt);
        machine.record_external_change(DomainEvent::VersionUpdated {
            workflow_id,
            from_version,
            to_version,
        });
        for task_id in skipped {
            machine.record_external_change(DomainEvent::TaskSkipped {
                workflow_id,
                task_id,
                reason: SkipReason::VersionUpdate,
            });
        }
        machine.settle_after_update()?;
        Ok(machine.into_outcome())
    }

    /// The rebuilt aggregate and the ids of new tasks skipped because they
    /// precede the workflow's position.
    fn rebuild(template: &CompiledTemplate, mut aggregate: WorkflowAggregate) -> (WorkflowAggregate, Vec<Uuid>) {
        let old_current = aggregate.workflow.current_task;
        let workflow_id = aggregate.id();
        let mut existing: HashMap<String, Task> = aggregate
            .tasks
            .drain(..)
            .map(|task| (task.api_name.clone(), task))
            .collect();

        let mut tasks = Vec::with_capacity(template.template.tasks.len());
        let mut skipped = Vec::new();
        let mut position: Option<u32> = None;

        for (index, definition) in template.template.tasks.iter().enumerate() {
            let number = index as u32 + 1;
            let mut task = match existing.remove(&definition.api_name) {
                Some(task) => {
                    if position.is_none() && task.number >= old_current {
                        position = Some(number);
                    }
                    task
                }
                None => {
                    let before_position = position.is_none();
                    let task = new_task(workflow_id, definition.api_name.clone(), before_position);
                    if before_position {
                        skipped.push(task.id);
                    }
                    task
                }
            };
            task.number = number;
            task.name = definition.name.clone();
            task.description = definition.description.clone();
            task.parents = template.graph.parent_names(index);
            task.ancestors = template.graph.ancestor_names(index);
            if task.status == TaskStatus::Pending {
                task.require_completion_by_all = definition.require_completion_by_all;
            }
            tasks.push(task);
        }

        let workflow = &mut aggregate.workflow;
        workflow.tasks_count = tasks.len() as u32;
        workflow.current_task = position.unwrap_or(workflow.tasks_count + 1);
        workflow.template_version = template.template.version;
        workflow.template_name = template.template.name.clone();
        workflow.owners = template.template.owners.clone();
        aggregate.tasks = tasks;
        (aggregate, skipped)
    }
}

fn new_task(workflow_id: Uuid, api_name: String, skipped: bool) -> Task {
    Task {
        id: Uuid::now_v7(),
        workflow_id,
        name: api_name.clone(),
        api_name,
        description: None,
        number: 0,
        status: if skipped {
            TaskStatus::Skipped
        } else {
            TaskStatus::Pending
        },
        due_date: None,
        due_date_manual: false,
        date_started: None,
        date_completed: None,
        parents: Vec::new(),
        ancestors: Vec::new(),
        performers: Vec::new(),
        require_completion_by_all: false,
        delay_elapsed: false,
    }
}
