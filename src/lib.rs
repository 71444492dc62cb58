#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pathway Core
//!
//! Workflow and task progression engine for template-driven business
//! processes.
//!
//! A [`Template`](models::Template) is an ordered list of tasks with
//! performers, activation conditions, due-date rules, delays and fields.
//! Running a template creates a workflow that advances task by task until it
//! completes, is terminated or is delayed.
//!
//! ## Module Organization
//!
//! - [`models`] - templates, workflows, tasks, fields and notifications
//! - [`engine`] - performer resolution, conditions, due dates, the
//!   [`WorkflowEngine`] and the periodic overdue and delay ticks
//! - [`state_machine`] - statuses, guards and the workflow state machine
//! - [`notifications`] - recipient planning and channel fan-out
//! - [`store`] - the persistence trait, in-memory and PostgreSQL stores
//! - [`services`] - outbound collaborators (directory, fields, guest auth,
//!   analytics, periodic locks)
//! - [`config`] - layered TOML and environment configuration
//! - [`events`] - domain events and the in-process publisher
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pathway_core::config::EngineConfig;
//! use pathway_core::engine::{RunTemplate, WorkflowEngine};
//! use pathway_core::models::{PerformerRule, TaskTemplate, Template, WorkflowStarter};
//! use pathway_core::store::InMemoryWorkflowStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = WorkflowEngine::builder(
//!     Arc::new(EngineConfig::default()),
//!     Arc::new(InMemoryWorkflowStore::new()),
//! )
//! .build();
//!
//! let mut review = TaskTemplate::new("review", "Review the request");
//! review.performers = vec![PerformerRule::WorkflowStarter];
//! let template = Template {
//!     id: uuid::Uuid::now_v7(),
//!     version: 1,
//!     account_id: 1,
//!     name: "Purchase request".into(),
//!     owners: vec![],
//!     kickoff: Default::default(),
//!     tasks: vec![review],
//! };
//! let template_id = template.id;
//! engine.save_template(template).await?;
//!
//! let workflow = engine
//!     .run_template(RunTemplate::new(template_id, WorkflowStarter::User { user_id: 7 }))
//!     .await?;
//! println!("current task: {}", workflow.workflow.current_task);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod notifications;
pub mod services;
pub mod state_machine;
pub mod store;
pub mod utils;

pub use config::{ConfigManager, EngineConfig};
pub use engine::{
    DelayMonitor, OverdueReconciler, RunTemplate, TaskLocator, WorkflowEngine, WorkflowEngineBuilder,
};
pub use error::{WorkflowError, WorkflowResult};
pub use events::{DomainEvent, EventPublisher};
pub use models::{Task, Template, Workflow, WorkflowAggregate};
pub use state_machine::{TaskStatus, WorkflowStatus};
pub use store::{InMemoryWorkflowStore, PersistenceError, WorkflowStore};
