//! # Templates
//!
//! A [`Template`] is the authored blueprint a workflow is started from: an
//! ordered list of [`TaskTemplate`]s plus the kickoff form. Each task
//! declares who performs it, which fields it collects, the conditions that
//! gate its activation and an optional due-date rule.
//!
//! Templates are validated once, at save time, by [`Template::validate`].
//! Runtime code relies on the guarantees established there: every field a
//! condition or performer rule mentions is produced by the kickoff form or by
//! an ancestor task, and every revert target is a true ancestor.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use super::field::{FieldKind, FieldTemplate};
use super::graph::TemplateGraph;
use super::{AccountId, GroupId, UserId};
use crate::utils::serde::{duration_seconds, option_duration_seconds};

/// Authoring errors detected at template-save time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template has no tasks")]
    NoTasks,

    #[error("api-name '{0}' is used more than once")]
    DuplicateApiName(String),

    #[error("task '{task}' lists unknown parent '{parent}'")]
    UnknownParent { task: String, parent: String },

    #[error("task '{task}' lists parent '{parent}' which does not precede it")]
    ParentNotEarlier { task: String, parent: String },

    #[error("task '{task}' references field '{field}' which is not available to it")]
    UnavailableField { task: String, field: String },

    #[error("task '{task}' references task '{reference}' which is not one of its ancestors")]
    TaskNotAncestor { task: String, reference: String },

    #[error("task '{task}' uses operator {operator:?} which does not apply to {subject}")]
    InvalidOperator {
        task: String,
        operator: PredicateOperator,
        subject: String,
    },

    #[error("condition '{condition}' on task '{task}' has no predicates")]
    EmptyCondition { task: String, condition: String },

    #[error("task '{task}' assigns performers from field '{field}' which is not a user field")]
    NonUserPerformerField { task: String, field: String },

    #[error("task '{task}' has a due date anchored to invalid source '{source_id}'")]
    InvalidDueDateSource { task: String, source_id: String },

    #[error("task '{task}' cannot revert to itself")]
    SelfRevert { task: String },

    #[error("task '{task}' reverts to '{target}' which is not one of its ancestors")]
    RevertNotAncestor { task: String, target: String },
}

/// Owner of a template; owners see every workflow started from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OwnerRef {
    User { user_id: UserId },
    Group { group_id: GroupId },
}

/// The data-collection step that precedes task 1.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickoffTemplate {
    #[serde(default)]
    pub fields: Vec<FieldTemplate>,
}

/// How a task's performers are chosen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PerformerRule {
    User { user_id: UserId },
    Group { group_id: GroupId },
    WorkflowStarter,
    /// The user stored in a previously collected USER field
    Field { api_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionAction {
    StartTask,
    SkipTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateOperator {
    Equal,
    NotEqual,
    Exist,
    NotExist,
    Contain,
    NotContain,
    MoreThan,
    LessThan,
    Completed,
}

/// What a predicate inspects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateSubject {
    Kickoff,
    Task { api_name: String },
    Field { api_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateTemplate {
    pub subject: PredicateSubject,
    pub operator: PredicateOperator,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// Predicates of a rule are AND-combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleTemplate {
    pub predicates: Vec<PredicateTemplate>,
}

/// Rules of a condition are AND-combined; the first matching condition of a
/// task decides whether it starts or is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionTemplate {
    pub api_name: String,
    pub action: ConditionAction,
    pub rules: Vec<RuleTemplate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DueDateAnchor {
    AfterWorkflowStarted,
    AfterTaskStarted,
    AfterTaskCompleted,
    BeforeField,
    AfterField,
}

impl DueDateAnchor {
    pub fn is_task_anchor(&self) -> bool {
        matches!(self, Self::AfterTaskStarted | Self::AfterTaskCompleted)
    }

    pub fn is_field_anchor(&self) -> bool {
        matches!(self, Self::BeforeField | Self::AfterField)
    }
}

/// Due-date rule of a task.
///
/// `source_id` names the anchor task (for task anchors) or the anchor DATE
/// field (for field anchors). A task anchor without `source_id` refers to the
/// task the rule belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueDateRule {
    pub rule: DueDateAnchor,
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(with = "duration_seconds", default = "Duration::zero")]
    pub duration: Duration,
    #[serde(default)]
    pub duration_months: u32,
}

impl DueDateRule {
    pub fn new(rule: DueDateAnchor, duration: Duration) -> Self {
        Self {
            rule,
            source_id: None,
            duration,
            duration_months: 0,
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_months(mut self, months: u32) -> Self {
        self.duration_months = months;
        self
    }

    /// The anchor task api-name, resolving the implicit self reference.
    pub fn anchor_task<'a>(&'a self, own_api_name: &'a str) -> Option<&'a str> {
        if self.rule.is_task_anchor() {
            Some(self.source_id.as_deref().unwrap_or(own_api_name))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub api_name: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub performers: Vec<PerformerRule>,
    #[serde(default)]
    pub require_completion_by_all: bool,
    #[serde(default)]
    pub fields: Vec<FieldTemplate>,
    #[serde(default)]
    pub conditions: Vec<ConditionTemplate>,
    #[serde(default)]
    pub due_date: Option<DueDateRule>,
    /// Pause the workflow for this long before the task starts
    #[serde(default, with = "option_duration_seconds")]
    pub delay: Option<Duration>,
    /// Ancestor a performer may return the workflow to
    #[serde(default)]
    pub revert_task: Option<String>,
    /// Explicit parents; empty means the previous task
    #[serde(default)]
    pub parents: Vec<String>,
}

impl TaskTemplate {
    pub fn new(api_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            name: name.into(),
            description: None,
            performers: Vec::new(),
            require_completion_by_all: false,
            fields: Vec::new(),
            conditions: Vec::new(),
            due_date: None,
            delay: None,
            revert_task: None,
            parents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub version: i32,
    pub account_id: AccountId,
    pub name: String,
    #[serde(default)]
    pub owners: Vec<OwnerRef>,
    #[serde(default)]
    pub kickoff: KickoffTemplate,
    pub tasks: Vec<TaskTemplate>,
}

impl Template {
    pub fn task(&self, api_name: &str) -> Option<&TaskTemplate> {
        self.tasks.iter().find(|t| t.api_name == api_name)
    }

    /// Check authoring invariants and build the task graph.
    pub fn validate(&self) -> Result<TemplateGraph, TemplateError> {
        if self.tasks.is_empty() {
            return Err(TemplateError::NoTasks);
        }
        self.check_unique_api_names()?;

        let graph = TemplateGraph::build(&self.tasks)?;

        // Field kinds by api-name, and the task index that produces each field
        let mut field_kinds: HashMap<&str, &FieldKind> = HashMap::new();
        let mut field_producer: HashMap<&str, Option<usize>> = HashMap::new();
        for field in &self.kickoff.fields {
            field_kinds.insert(&field.api_name, &field.kind);
            field_producer.insert(&field.api_name, None);
        }
        for (index, task) in self.tasks.iter().enumerate() {
            for field in &task.fields {
                field_kinds.insert(&field.api_name, &field.kind);
                field_producer.insert(&field.api_name, Some(index));
            }
        }

        for (index, task) in self.tasks.iter().enumerate() {
            let available = |field: &str| match field_producer.get(field) {
                Some(None) => true,
                Some(Some(producer)) => graph.is_ancestor(index, *producer),
                None => false,
            };
            let unavailable = |field: &str| TemplateError::UnavailableField {
                task: task.api_name.clone(),
                field: field.to_string(),
            };

            for rule in &task.performers {
                if let PerformerRule::Field { api_name } = rule {
                    if !available(api_name) {
                        return Err(unavailable(api_name));
                    }
                    if field_kinds.get(api_name.as_str()) != Some(&&FieldKind::User) {
                        return Err(TemplateError::NonUserPerformerField {
                            task: task.api_name.clone(),
                            field: api_name.clone(),
                        });
                    }
                }
            }

            for condition in &task.conditions {
                if condition.rules.is_empty()
                    || condition.rules.iter().any(|r| r.predicates.is_empty())
                {
                    return Err(TemplateError::EmptyCondition {
                        task: task.api_name.clone(),
                        condition: condition.api_name.clone(),
                    });
                }
                for predicate in condition.rules.iter().flat_map(|r| &r.predicates) {
                    self.check_predicate(index, task, predicate, &graph, &field_kinds, &available)?;
                }
            }

            if let Some(rule) = &task.due_date {
                let invalid_source = || TemplateError::InvalidDueDateSource {
                    task: task.api_name.clone(),
                    source_id: rule.source_id.clone().unwrap_or_default(),
                };
                if let Some(anchor) = rule.anchor_task(&task.api_name) {
                    if graph.index_of(anchor).is_none() {
                        return Err(invalid_source());
                    }
                    if rule.rule == DueDateAnchor::AfterTaskCompleted && anchor == task.api_name {
                        return Err(invalid_source());
                    }
                } else if rule.rule.is_field_anchor() {
                    let source = rule.source_id.as_deref().ok_or_else(invalid_source)?;
                    if !available(source) {
                        return Err(unavailable(source));
                    }
                    if field_kinds.get(source) != Some(&&FieldKind::Date) {
                        return Err(invalid_source());
                    }
                }
            }

            if let Some(target) = &task.revert_task {
                if target == &task.api_name {
                    return Err(TemplateError::SelfRevert {
                        task: task.api_name.clone(),
                    });
                }
                let is_ancestor = graph
                    .index_of(target)
                    .map(|t| graph.is_ancestor(index, t))
                    .unwrap_or(false);
                if !is_ancestor {
                    return Err(TemplateError::RevertNotAncestor {
                        task: task.api_name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        Ok(graph)
    }

    fn check_unique_api_names(&self) -> Result<(), TemplateError> {
        let mut seen = HashSet::new();
        let names = self
            .kickoff
            .fields
            .iter()
            .map(|f| &f.api_name)
            .chain(self.tasks.iter().flat_map(|task| {
                std::iter::once(&task.api_name)
                    .chain(task.fields.iter().map(|f| &f.api_name))
                    .chain(task.conditions.iter().map(|c| &c.api_name))
            }));
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(TemplateError::DuplicateApiName(name.clone()));
            }
        }
        Ok(())
    }

    fn check_predicate(
        &self,
        index: usize,
        task: &TaskTemplate,
        predicate: &PredicateTemplate,
        graph: &TemplateGraph,
        field_kinds: &HashMap<&str, &FieldKind>,
        available: &dyn Fn(&str) -> bool,
    ) -> Result<(), TemplateError> {
        let invalid_operator = |subject: &str| TemplateError::InvalidOperator {
            task: task.api_name.clone(),
            operator: predicate.operator,
            subject: subject.to_string(),
        };

        match &predicate.subject {
            PredicateSubject::Kickoff => {
                if predicate.operator != PredicateOperator::Completed {
                    return Err(invalid_operator("the kickoff form"));
                }
            }
            PredicateSubject::Task { api_name } => {
                if predicate.operator != PredicateOperator::Completed {
                    return Err(invalid_operator(&format!("task '{api_name}'")));
                }
                let is_ancestor = graph
                    .index_of(api_name)
                    .map(|t| graph.is_ancestor(index, t))
                    .unwrap_or(false);
                if !is_ancestor {
                    return Err(TemplateError::TaskNotAncestor {
                        task: task.api_name.clone(),
                        reference: api_name.clone(),
                    });
                }
            }
            PredicateSubject::Field { api_name } => {
                if !available(api_name) {
                    return Err(TemplateError::UnavailableField {
                        task: task.api_name.clone(),
                        field: api_name.clone(),
                    });
                }
                let kind = field_kinds.get(api_name.as_str());
                let ordered = kind.map(|k| k.is_ordered()).unwrap_or(false);
                match predicate.operator {
                    PredicateOperator::Completed => {
                        return Err(invalid_operator(&format!("field '{api_name}'")));
                    }
                    PredicateOperator::MoreThan | PredicateOperator::LessThan if !ordered => {
                        return Err(invalid_operator(&format!("field '{api_name}'")));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Validate and compile into the immutable runtime form.
    pub fn compile(self) -> Result<super::graph::CompiledTemplate, TemplateError> {
        let graph = self.validate()?;
        Ok(super::graph::CompiledTemplate {
            template: self,
            graph,
        })
    }
}
