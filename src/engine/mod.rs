//! # Progression Engine
//!
//! The pure decision components used by the state machine (performer
//! resolution, conditions, due dates) and the services that drive workflows:
//! the [`WorkflowEngine`] for external triggers and the two periodic ticks.

pub mod clock;
pub mod condition_evaluator;
pub mod delay_monitor;
pub mod due_date;
pub mod overdue_reconciler;
pub mod performer_resolver;
pub mod template_catalog;
pub mod version_update;
pub mod workflow_engine;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition_evaluator::{ConditionEvaluator, Decision};
pub use delay_monitor::{DelayMonitor, DelaySummary};
pub use due_date::{humanize_due, DueDateCalculator};
pub use overdue_reconciler::{OverdueReconciler, ReconcileSummary};
pub use performer_resolver::PerformerResolver;
pub use template_catalog::TemplateCatalog;
pub use version_update::WorkflowVersionUpdater;
pub use workflow_engine::{
    RunTemplate, TaskLocator, VersionUpdateSummary, WorkflowEngine, WorkflowEngineBuilder,
};
