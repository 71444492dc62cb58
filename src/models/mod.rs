//! # Domain Models
//!
//! Plain data types for templates and running workflows. Nothing in here
//! performs I/O; the state machine mutates these values and the store
//! persists them.
//!
//! - [`template`]: authored blueprints and their validation
//! - [`graph`]: the immutable task DAG compiled from a template
//! - [`field`]: field kinds, typed values and field sets
//! - [`workflow`], [`task`], [`delay`]: runtime entities
//! - [`aggregate`]: a workflow together with its tasks and delays
//! - [`notification`]: audit rows and notification types
//! - [`user`]: directory profiles consulted for notification recipients

pub mod aggregate;
pub mod delay;
pub mod field;
pub mod graph;
pub mod notification;
pub mod task;
pub mod template;
pub mod user;
pub mod workflow;

/// Directory user identifier.
pub type UserId = i64;
/// Directory group identifier.
pub type GroupId = i64;
/// Tenant identifier.
pub type AccountId = i64;

pub use aggregate::WorkflowAggregate;
pub use delay::{Delay, DelayKind};
pub use field::{FieldEntry, FieldKind, FieldOrigin, FieldSet, FieldTemplate, FieldValue};
pub use graph::{CompiledTemplate, TaskNode, TemplateGraph};
pub use notification::{Notification, NotificationStatus, NotificationType, Subscription};
pub use task::{DirectlyStatus, PerformerRef, Task, TaskPerformer};
pub use template::{
    ConditionAction, ConditionTemplate, DueDateAnchor, DueDateRule, KickoffTemplate, OwnerRef,
    PerformerRule, PredicateOperator, PredicateSubject, PredicateTemplate, RuleTemplate,
    TaskTemplate, Template, TemplateError,
};
pub use user::{GroupMemberships, Subscriptions, UserProfile};
pub use workflow::{NewWorkflow, ParentTaskRef, Workflow, WorkflowStarter};
