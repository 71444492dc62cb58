//! Due-date computation.
//!
//! A due date is `anchor + duration_months + duration`, or the anchor minus
//! both for BEFORE_FIELD rules. Months use calendar semantics and clamp to
//! the last day of the target month, so Jan 31 plus one month is the last
//! day of February.
//!
//! Anchors that have not happened yet (a task that has not started, an
//! empty date field) leave the due date unset; the state machine calls
//! [`DueDateCalculator::due_date_for`] again when the anchor event fires.

use chrono::{DateTime, Duration, Months, Utc};

use crate::models::aggregate::WorkflowAggregate;
use crate::models::template::{DueDateAnchor, DueDateRule};

#[derive(Debug, Clone, Copy, Default)]
pub struct DueDateCalculator;

impl DueDateCalculator {
    /// Apply a rule's offset to an anchor timestamp. `None` only when the
    /// result is out of chrono's range.
    pub fn compute(
        anchor: DueDateAnchor,
        anchor_time: DateTime<Utc>,
        duration: Duration,
        duration_months: u32,
    ) -> Option<DateTime<Utc>> {
        let months = Months::new(duration_months);
        match anchor {
            DueDateAnchor::BeforeField => anchor_time
                .checked_sub_months(months)?
                .checked_sub_signed(duration),
            _ => anchor_time
                .checked_add_months(months)?
                .checked_add_signed(duration),
        }
    }

    /// The anchor timestamp of `rule` for task `own_api_name`, if it occurred.
    pub fn resolve_anchor(
        rule: &DueDateRule,
        own_api_name: &str,
        aggregate: &WorkflowAggregate,
    ) -> Option<DateTime<Utc>> {
        match rule.rule {
            DueDateAnchor::AfterWorkflowStarted => Some(aggregate.workflow.date_created),
            DueDateAnchor::AfterTaskStarted => rule
                .anchor_task(own_api_name)
                .and_then(|api_name| aggregate.task_by_api_name(api_name))
                .and_then(|task| task.date_started),
            DueDateAnchor::AfterTaskCompleted => rule
                .anchor_task(own_api_name)
                .and_then(|api_name| aggregate.task_by_api_name(api_name))
                .filter(|task| task.is_completed())
                .and_then(|task| task.date_completed),
            DueDateAnchor::BeforeField | DueDateAnchor::AfterField => rule
                .source_id
                .as_deref()
                .and_then(|field| aggregate.workflow.fields.value(field))
                .and_then(|value| value.as_date()),
        }
    }

    /// Due date of a task under `rule` given the workflow's current state.
    pub fn due_date_for(
        rule: &DueDateRule,
        own_api_name: &str,
        aggregate: &WorkflowAggregate,
    ) -> Option<DateTime<Utc>> {
        Self::resolve_anchor(rule, own_api_name, aggregate)
            .and_then(|anchor| Self::compute(rule.rule, anchor, rule.duration, rule.duration_months))
    }
}

/// Human readable "due in" / "overdue" text for the distance between `now`
/// and `due`.
pub fn humanize_due(due: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = due - now;
    if delta < Duration::zero() {
        format!("overdue by {}", humanize_span(-delta))
    } else {
        format!("due in {}", humanize_span(delta))
    }
}

fn humanize_span(span: Duration) -> String {
    let days = span.num_days();
    let hours = span.num_hours() % 24;
    let minutes = span.num_minutes() % 60;

    let unit = |n: i64, name: &str| {
        if n == 1 {
            format!("1 {name}")
        } else {
            format!("{n} {name}s")
        }
    };

    match (days, hours, minutes) {
        (0, 0, m) => unit(m.max(1), "minute"),
        (0, h, 0) => unit(h, "hour"),
        (0, h, m) => format!("{} {}", unit(h, "hour"), unit(m, "minute")),
        (d, 0, _) => unit(d, "day"),
        (d, h, _) => format!("{} {}", unit(d, "day"), unit(h, "hour")),
    }
}
