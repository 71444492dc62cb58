//! Evaluation of task activation conditions.
//!
//! Conditions are checked in template order. A condition matches when all of
//! its rules hold, and a rule holds when all of its predicates hold. The first
//! matching condition decides; when none matches the task starts.

use serde_json::Value;
use tracing::trace;

use crate::models::aggregate::WorkflowAggregate;
use crate::models::field::{parse_date, parse_number, FieldValue};
use crate::models::template::{
    ConditionAction, ConditionTemplate, PredicateOperator, PredicateSubject, PredicateTemplate,
};
use crate::state_machine::states::TaskStatus;

/// Outcome of evaluating a task's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// A START_TASK condition matched
    Activate,
    /// A SKIP_TASK condition matched
    Skip,
    /// Nothing matched; the task starts by default
    NoCondition,
}

impl Decision {
    pub fn activates(&self) -> bool {
        !matches!(self, Self::Skip)
    }
}

/// Evaluates conditions against the current state of a workflow.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvaluator<'a> {
    aggregate: &'a WorkflowAggregate,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(aggregate: &'a WorkflowAggregate) -> Self {
        Self { aggregate }
    }

    pub fn evaluate(&self, conditions: &[ConditionTemplate]) -> Decision {
        for condition in conditions {
            if self.matches(condition) {
                trace!(condition = %condition.api_name, action = ?condition.action, "Condition matched");
                return match condition.action {
                    ConditionAction::StartTask => Decision::Activate,
                    ConditionAction::SkipTask => Decision::Skip,
                };
            }
        }
        Decision::NoCondition
    }

    fn matches(&self, condition: &ConditionTemplate) -> bool {
        !condition.rules.is_empty()
            && condition.rules.iter().all(|rule| {
                !rule.predicates.is_empty() && rule.predicates.iter().all(|p| self.holds(p))
            })
    }

    fn holds(&self, predicate: &PredicateTemplate) -> bool {
        match &predicate.subject {
            // A running workflow always has its kickoff submitted
            PredicateSubject::Kickoff => predicate.operator == PredicateOperator::Completed,
            PredicateSubject::Task { api_name } => {
                predicate.operator == PredicateOperator::Completed
                    && self
                        .aggregate
                        .task_by_api_name(api_name)
                        .map(|task| task.status == TaskStatus::Completed)
                        .unwrap_or(false)
            }
            PredicateSubject::Field { api_name } => compare(
                predicate.operator,
                self.aggregate.workflow.fields.value(api_name),
                predicate.value.as_ref(),
            ),
        }
    }
}

/// `value OPERATOR literal` for a field value.
pub fn compare(
    operator: PredicateOperator,
    value: Option<&FieldValue>,
    literal: Option<&Value>,
) -> bool {
    use PredicateOperator::*;

    let Some(value) = value else {
        return matches!(operator, NotExist | NotEqual | NotContain);
    };

    match operator {
        Exist => true,
        NotExist => false,
        Equal => literal.map(|l| equals(value, l)).unwrap_or(false),
        NotEqual => literal.map(|l| !equals(value, l)).unwrap_or(true),
        Contain => literal.map(|l| contains(value, l)).unwrap_or(false),
        NotContain => literal.map(|l| !contains(value, l)).unwrap_or(true),
        MoreThan => literal
            .and_then(|l| ordering(value, l))
            .map(|o| o.is_gt())
            .unwrap_or(false),
        LessThan => literal
            .and_then(|l| ordering(value, l))
            .map(|o| o.is_lt())
            .unwrap_or(false),
        Completed => false,
    }
}

fn literal_text(literal: &Value) -> Option<String> {
    match literal {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn equals(value: &FieldValue, literal: &Value) -> bool {
    match value {
        FieldValue::Text(s) | FieldValue::Url(s) | FieldValue::Choice(s) => {
            literal_text(literal).map(|l| &l == s).unwrap_or(false)
        }
        FieldValue::Number(n) => parse_number(literal)
            .map(|l| (l - n).abs() < f64::EPSILON)
            .unwrap_or(false),
        FieldValue::Date(dt) => parse_date(literal).map(|l| l == *dt).unwrap_or(false),
        FieldValue::User(id) => match literal {
            Value::Number(n) => n.as_i64() == Some(*id),
            Value::String(s) => s.trim().parse::<i64>().ok() == Some(*id),
            _ => false,
        },
        FieldValue::Choices(items) | FieldValue::Files(items) => match literal {
            Value::Array(expected) => {
                let mut expected: Vec<String> =
                    expected.iter().filter_map(literal_text).collect();
                let mut actual = items.clone();
                expected.sort();
                actual.sort();
                expected == actual
            }
            other => literal_text(other)
                .map(|l| items.contains(&l))
                .unwrap_or(false),
        },
    }
}

fn contains(value: &FieldValue, literal: &Value) -> bool {
    let Some(needle) = literal_text(literal).map(|l| l.to_lowercase()) else {
        return false;
    };
    match value {
        FieldValue::Text(s) | FieldValue::Url(s) | FieldValue::Choice(s) => {
            s.to_lowercase().contains(&needle)
        }
        FieldValue::Choices(items) | FieldValue::Files(items) => {
            items.iter().any(|item| item.to_lowercase() == needle)
        }
        FieldValue::Number(_) | FieldValue::Date(_) | FieldValue::User(_) => {
            value.to_string().to_lowercase().contains(&needle)
        }
    }
}

fn ordering(value: &FieldValue, literal: &Value) -> Option<std::cmp::Ordering> {
    match value {
        FieldValue::Number(n) => parse_number(literal).ok().and_then(|l| n.partial_cmp(&l)),
        FieldValue::Date(dt) => parse_date(literal).ok().map(|l| dt.cmp(&l)),
        _ => None,
    }
}
