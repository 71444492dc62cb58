//! Proptest strategies for generated templates and completion orders.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use pathway_core::models::{PredicateOperator, Template};
use proptest::prelude::*;
use serde_json::json;

use super::builders::{number_field, skip_when, user_task, TemplateBuilder};

/// Shape of one generated task.
#[derive(Debug, Clone)]
pub struct TaskShape {
    /// May be empty; such a task is skipped
    pub performers: Vec<i64>,
    pub require_all: bool,
    /// Skip the task when the kickoff amount is below this
    pub skip_below: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct WorkflowShape {
    pub tasks: Vec<TaskShape>,
    pub amount: i64,
}

impl WorkflowShape {
    pub fn template(&self) -> Template {
        let mut builder = TemplateBuilder::new("Generated").kickoff_field(number_field("amount"));
        for (index, shape) in self.tasks.iter().enumerate() {
            let mut task = user_task(&format!("task-{index}"), &shape.performers);
            task.require_completion_by_all = shape.require_all;
            if let Some(threshold) = shape.skip_below {
                task = skip_when(task, "amount", PredicateOperator::LessThan, json!(threshold));
            }
            builder = builder.task(task);
        }
        builder.build()
    }
}

pub fn task_shape_strategy() -> impl Strategy<Value = TaskShape> {
    (
        prop::collection::btree_set(1i64..=4, 0..=3),
        any::<bool>(),
        prop::option::weighted(0.3, 0i64..200),
    )
        .prop_map(|(performers, require_all, skip_below)| TaskShape {
            performers: performers.into_iter().collect(),
            require_all,
            skip_below,
        })
}

pub fn workflow_shape_strategy() -> impl Strategy<Value = WorkflowShape> {
    (prop::collection::vec(task_shape_strategy(), 1..8), 0i64..200)
        .prop_map(|(tasks, amount)| WorkflowShape { tasks, amount })
}

/// Users attempting completions, in order; most are not performers.
pub fn completion_attempts_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(1i64..=6, 0..40)
}

/// Timestamps from 2000 through 2040 at minute precision.
pub fn anchor_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (0i64..(40 * 365 * 24 * 60)).prop_map(|minutes| {
        Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    })
}
