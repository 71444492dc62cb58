//! Template builders for integration tests.

#![allow(dead_code)]

use chrono::Duration;
use pathway_core::models::{
    ConditionAction, ConditionTemplate, DueDateAnchor, DueDateRule, FieldKind, FieldTemplate,
    KickoffTemplate, OwnerRef, PerformerRule, PredicateOperator, PredicateSubject,
    PredicateTemplate, RuleTemplate, TaskTemplate, Template,
};
use serde_json::Value;
use uuid::Uuid;

pub const ACCOUNT_ID: i64 = 1;

/// Builder for test templates. Tasks are appended in order.
pub struct TemplateBuilder {
    template: Template,
}

impl TemplateBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            template: Template {
                id: Uuid::now_v7(),
                version: 1,
                account_id: ACCOUNT_ID,
                name: name.to_string(),
                owners: Vec::new(),
                kickoff: KickoffTemplate::default(),
                tasks: Vec::new(),
            },
        }
    }

    /// Next version of an existing template.
    pub fn next_version(template: &Template) -> Self {
        let mut template = template.clone();
        template.version += 1;
        Self { template }
    }

    pub fn owner(mut self, user_id: i64) -> Self {
        self.template.owners.push(OwnerRef::User { user_id });
        self
    }

    pub fn kickoff_field(mut self, field: FieldTemplate) -> Self {
        self.template.kickoff.fields.push(field);
        self
    }

    pub fn task(mut self, task: TaskTemplate) -> Self {
        self.template.tasks.push(task);
        self
    }

    /// Replace the task list, e.g. when building a new version.
    pub fn tasks(mut self, tasks: Vec<TaskTemplate>) -> Self {
        self.template.tasks = tasks;
        self
    }

    pub fn build(self) -> Template {
        self.template
    }
}

/// A task performed by the given users.
pub fn user_task(api_name: &str, users: &[i64]) -> TaskTemplate {
    let mut task = TaskTemplate::new(api_name, title(api_name));
    task.performers = users
        .iter()
        .map(|user_id| PerformerRule::User { user_id: *user_id })
        .collect();
    task
}

pub fn group_task(api_name: &str, group_id: i64) -> TaskTemplate {
    let mut task = TaskTemplate::new(api_name, title(api_name));
    task.performers = vec![PerformerRule::Group { group_id }];
    task
}

pub fn starter_task(api_name: &str) -> TaskTemplate {
    let mut task = TaskTemplate::new(api_name, title(api_name));
    task.performers = vec![PerformerRule::WorkflowStarter];
    task
}

pub fn field_performer_task(api_name: &str, field: &str) -> TaskTemplate {
    let mut task = TaskTemplate::new(api_name, title(api_name));
    task.performers = vec![PerformerRule::Field {
        api_name: field.to_string(),
    }];
    task
}

pub fn due_after_start(mut task: TaskTemplate, duration: Duration) -> TaskTemplate {
    task.due_date = Some(DueDateRule::new(DueDateAnchor::AfterTaskStarted, duration));
    task
}

pub fn due_after_workflow_start(mut task: TaskTemplate, duration: Duration) -> TaskTemplate {
    task.due_date = Some(DueDateRule::new(DueDateAnchor::AfterWorkflowStarted, duration));
    task
}

pub fn due_after_completion_of(mut task: TaskTemplate, source: &str, duration: Duration) -> TaskTemplate {
    task.due_date = Some(DueDateRule::new(DueDateAnchor::AfterTaskCompleted, duration).with_source(source));
    task
}

/// Skip the task when `field OPERATOR value` holds.
pub fn skip_when(mut task: TaskTemplate, field: &str, operator: PredicateOperator, value: Value) -> TaskTemplate {
    task.conditions.push(ConditionTemplate {
        api_name: format!("{}-skip", task.api_name),
        action: ConditionAction::SkipTask,
        rules: vec![RuleTemplate {
            predicates: vec![PredicateTemplate {
                subject: PredicateSubject::Field {
                    api_name: field.to_string(),
                },
                operator,
                value: Some(value),
            }],
        }],
    });
    task
}

pub fn number_field(api_name: &str) -> FieldTemplate {
    FieldTemplate::new(api_name, FieldKind::Number)
}

pub fn user_field(api_name: &str) -> FieldTemplate {
    FieldTemplate::new(api_name, FieldKind::User)
}

pub fn text_field(api_name: &str) -> FieldTemplate {
    FieldTemplate::new(api_name, FieldKind::String)
}

fn title(api_name: &str) -> String {
    let mut chars = api_name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
