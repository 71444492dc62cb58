//! A workflow together with the entities that change with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::delay::Delay;
use super::graph::CompiledTemplate;
use super::task::Task;
use super::workflow::{NewWorkflow, Workflow};
use crate::state_machine::states::{TaskStatus, WorkflowStatus};

/// The unit of loading and committing: one workflow, its tasks ordered by
/// number, and its delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAggregate {
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
    pub delays: Vec<Delay>,
}

impl WorkflowAggregate {
    /// A fresh workflow with every task `Pending` and `current_task = 1`.
    pub fn instantiate(
        compiled: &CompiledTemplate,
        input: NewWorkflow,
        now: DateTime<Utc>,
    ) -> Self {
        let template = &compiled.template;
        let workflow_id = Uuid::now_v7();

        let tasks = template
            .tasks
            .iter()
            .enumerate()
            .map(|(index, task)| Task {
                id: Uuid::now_v7(),
                workflow_id,
                api_name: task.api_name.clone(),
                name: task.name.clone(),
                description: task.description.clone(),
                number: index as u32 + 1,
                status: TaskStatus::Pending,
                due_date: None,
                due_date_manual: false,
                date_started: None,
                date_completed: None,
                parents: compiled.graph.parent_names(index),
                ancestors: compiled.graph.ancestor_names(index),
                performers: Vec::new(),
                require_completion_by_all: task.require_completion_by_all,
                delay_elapsed: false,
            })
            .collect::<Vec<_>>();

        let workflow = Workflow {
            id: workflow_id,
            account_id: template.account_id,
            template_id: template.id,
            template_version: template.version,
            template_name: template.name.clone(),
            name: input
                .name
                .unwrap_or_else(|| format!("{} {}", template.name, now.format("%Y-%m-%d %H:%M"))),
            status: WorkflowStatus::Running,
            current_task: 1,
            tasks_count: tasks.len() as u32,
            is_urgent: input.is_urgent,
            due_date: input.due_date,
            starter: input.starter,
            owners: template.owners.clone(),
            members: BTreeSet::new(),
            fields: input.kickoff,
            parent_task: input.parent_task,
            date_created: now,
            date_completed: None,
            version: 0,
        };

        Self {
            workflow,
            tasks,
            delays: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.workflow.id
    }

    pub fn task_by_number(&self, number: u32) -> Option<&Task> {
        self.tasks.iter().find(|t| t.number == number)
    }

    pub fn task_by_number_mut(&mut self, number: u32) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.number == number)
    }

    pub fn task(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_by_api_name(&self, api_name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.api_name == api_name)
    }

    /// The task `current_task` points at, if any.
    pub fn current_task(&self) -> Option<&Task> {
        self.task_by_number(self.workflow.current_task)
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.is_active())
    }

    pub fn active_delay(&self) -> Option<&Delay> {
        self.delays.iter().find(|d| d.is_active())
    }

    pub fn active_delay_mut(&mut self) -> Option<&mut Delay> {
        self.delays.iter_mut().find(|d| d.is_active())
    }
}
