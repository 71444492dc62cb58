//! # Workflow Engine
//!
//! Entry point for every external trigger. Each operation follows the same
//! sequence:
//!
//! 1. take the in-process lock of the workflow
//! 2. load the aggregate, its compiled template and a [`TransitionContext`]
//!    (group memberships, tasks blocked by running sub-workflows)
//! 3. run one [`WorkflowStateMachine`] operation in memory
//! 4. cascade into the parent workflow when a sub-workflow finished
//! 5. plan notifications and commit workflows plus durable audit rows in one
//!    [`ChangeSet`]; a lost version check reloads and retries
//! 6. dispatch notifications, publish events, record analytics
//!
//! Nothing after the commit can fail the operation.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::template_catalog::TemplateCatalog;
use super::version_update::WorkflowVersionUpdater;
use crate::config::EngineConfig;
use crate::constants::services;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{DomainEvent, EventPublisher};
use crate::models::aggregate::WorkflowAggregate;
use crate::models::field::{FieldOrigin, FieldSet};
use crate::models::graph::CompiledTemplate;
use crate::models::notification::Notification;
use crate::models::task::{PerformerRef, Task};
use crate::models::template::{OwnerRef, PerformerRule, Template};
use crate::models::workflow::{NewWorkflow, ParentTaskRef, WorkflowStarter};
use crate::models::{GroupId, UserId};
use crate::notifications::{
    ChannelRegistry, DispatchPlan, NotificationChannel, NotificationDispatcher,
};
use crate::services::analytics::{AnalyticsEvent, AnalyticsService, TracingAnalytics};
use crate::services::directory::{InMemoryDirectory, UserDirectory};
use crate::services::field_service::{FieldService, TemplateFieldService};
use crate::services::guest_auth::{GuestAuthService, InMemoryGuestTokens};
use crate::state_machine::guards::{ActivePerformerGuard, StateGuard, TASK_ACTIVE, WORKFLOW_RUNNING};
use crate::state_machine::{CompletionCheck, TransitionContext, TransitionOutcome, WorkflowStateMachine};
use crate::store::{ChangeSet, WorkflowStore};

/// Request to start a workflow from the latest version of a template.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTemplate {
    pub template_id: Uuid,
    pub starter: WorkflowStarter,
    pub name: Option<String>,
    /// Raw kickoff form values keyed by field api-name
    pub kickoff: HashMap<String, Value>,
    pub due_date: Option<DateTime<Utc>>,
    pub is_urgent: bool,
    /// Start as a sub-workflow of this active task
    pub parent_task_id: Option<Uuid>,
}

impl RunTemplate {
    pub fn new(template_id: Uuid, starter: WorkflowStarter) -> Self {
        Self {
            template_id,
            starter,
            name: None,
            kickoff: HashMap::new(),
            due_date: None,
            is_urgent: false,
            parent_task_id: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_kickoff(mut self, api_name: impl Into<String>, value: Value) -> Self {
        self.kickoff.insert(api_name.into(), value);
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn urgent(mut self) -> Self {
        self.is_urgent = true;
        self
    }

    pub fn with_parent_task(mut self, task_id: Uuid) -> Self {
        self.parent_task_id = Some(task_id);
        self
    }
}

/// How a completion request names its task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLocator {
    Id(Uuid),
    ApiName { workflow_id: Uuid, api_name: String },
}

/// Result of migrating a template's open workflows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionUpdateSummary {
    pub examined: usize,
    pub updated: usize,
    pub failed: usize,
}

/// One workflow write of a commit, with the notifications it raised.
struct PendingWrite {
    outcome: TransitionOutcome,
    expected_version: Option<i64>,
    plan: DispatchPlan,
    now: DateTime<Utc>,
}

/// Run one state machine operation and hand back its outcome.
fn step<F>(
    template: &CompiledTemplate,
    context: &TransitionContext,
    aggregate: WorkflowAggregate,
    operation: F,
) -> WorkflowResult<TransitionOutcome>
where
    F: FnOnce(&mut WorkflowStateMachine<'_>) -> WorkflowResult<()>,
{
    let mut machine = WorkflowStateMachine::new(template, context, aggregate);
    operation(&mut machine)?;
    Ok(machine.into_outcome())
}

pub struct WorkflowEngine {
    config: Arc<EngineConfig>,
    store: Arc<dyn WorkflowStore>,
    catalog: TemplateCatalog,
    directory: Arc<dyn UserDirectory>,
    field_service: Arc<dyn FieldService>,
    analytics: Arc<dyn AnalyticsService>,
    dispatcher: Arc<NotificationDispatcher>,
    publisher: EventPublisher,
    clock: Arc<dyn Clock>,
    workflow_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .field("dispatcher", &self.dispatcher)
            .field("locked_workflows", &self.workflow_locks.len())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn builder(config: Arc<EngineConfig>, store: Arc<dyn WorkflowStore>) -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::new(config, store)
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn publisher(&self) -> &EventPublisher {
        &self.publisher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ----------------------------------------------------------------------
    // Templates
    // ----------------------------------------------------------------------

    /// Validate and store a template version.
    #[instrument(skip(self, template), fields(template_id = %template.id, version = template.version))]
    pub async fn save_template(&self, template: Template) -> WorkflowResult<Arc<CompiledTemplate>> {
        let compiled = template.compile()?;
        self.store.save_template(&compiled.template).await?;
        info!(tasks = compiled.graph.len(), "Template saved");
        Ok(self.catalog.insert(compiled))
    }

    /// Start a workflow from the latest template version.
    #[instrument(skip(self, request), fields(template_id = %request.template_id))]
    pub async fn run_template(&self, request: RunTemplate) -> WorkflowResult<WorkflowAggregate> {
        let template = self.catalog.latest(self.store.as_ref(), request.template_id).await?;
        let kickoff = self
            .field_service
            .validate_and_store(&template.template.kickoff.fields, FieldOrigin::Kickoff, &request.kickoff)
            .await?;

        self.with_retries(Uuid::nil(), || async {
            let now = self.clock.now();
            let parent_task = match request.parent_task_id {
                Some(task_id) => Some(self.check_parent_task(task_id, request.starter, now).await?),
                None => None,
            };
            let aggregate = WorkflowAggregate::instantiate(
                &template,
                NewWorkflow {
                    name: request.name.clone(),
                    starter: request.starter,
                    kickoff: kickoff.clone(),
                    due_date: request.due_date,
                    is_urgent: request.is_urgent,
                    parent_task,
                },
                now,
            );
            let context = self.context_for(&aggregate, &template, &[], None, now).await?;
            let outcome = step(&template, &context, aggregate, |machine| {
                machine.start(request.starter.user_id())
            })?;
            info!(workflow_id = %outcome.aggregate.id(), "Workflow started");
            self.commit(PendingWrite::new(outcome, None, now)).await
        })
        .await
    }

    /// Sub-workflows may only be started by an active performer of an
    /// active task.
    async fn check_parent_task(
        &self,
        task_id: Uuid,
        starter: WorkflowStarter,
        now: DateTime<Utc>,
    ) -> WorkflowResult<ParentTaskRef> {
        let workflow_id = self.store.find_workflow_by_task(task_id).await?;
        let parent = self.store.load_workflow(workflow_id).await?;
        let template = self
            .catalog
            .get(self.store.as_ref(), parent.workflow.template_id, parent.workflow.template_version)
            .await?;
        let context = self.context_for(&parent, &template, &[], None, now).await?;

        WORKFLOW_RUNNING.check(&parent.workflow)?;
        let task = parent
            .task(task_id)
            .ok_or_else(|| WorkflowError::not_found("task", task_id))?;
        TASK_ACTIVE.check(task)?;
        let user = starter.user_id().ok_or(WorkflowError::PerformerDenied {
            task_id,
            user_id: self.config.engine.external_user_id,
        })?;
        ActivePerformerGuard {
            user,
            groups: &context.groups,
        }
        .check(task)?;

        Ok(ParentTaskRef {
            workflow_id,
            task_id,
        })
    }

    // ----------------------------------------------------------------------
    // Task progression
    // ----------------------------------------------------------------------

    /// Complete a task on behalf of one of its performers, storing the
    /// task's output fields. Completing twice is a silent no-op.
    #[instrument(skip(self, values), fields(user_id = user))]
    pub async fn complete_task(
        &self,
        locator: TaskLocator,
        user: UserId,
        values: Option<HashMap<String, Value>>,
    ) -> WorkflowResult<Task> {
        let (workflow_id, task_id) = self.locate(&locator).await?;
        let fields = self.task_fields(workflow_id, task_id, user, values).await?;

        let aggregate = self
            .apply(workflow_id, &[], move |template, context, aggregate| {
                step(template, context, aggregate, |machine| {
                    machine.complete_task_for_user(task_id, user, fields.clone())
                })
            })
            .await?;
        aggregate
            .task(task_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found("task", task_id))
    }

    /// Validate output fields, unless the request will be rejected or is a
    /// repeated completion anyway.
    async fn task_fields(
        &self,
        workflow_id: Uuid,
        task_id: Uuid,
        user: UserId,
        values: Option<HashMap<String, Value>>,
    ) -> WorkflowResult<Option<FieldSet>> {
        let aggregate = self.store.load_workflow(workflow_id).await?;
        let template = self
            .catalog
            .get(self.store.as_ref(), aggregate.workflow.template_id, aggregate.workflow.template_version)
            .await?;
        let context = self.context_for(&aggregate, &template, &[], None, self.clock.now()).await?;

        let api_name = aggregate
            .task(task_id)
            .map(|task| task.api_name.clone())
            .ok_or_else(|| WorkflowError::not_found("task", task_id))?;
        let machine = WorkflowStateMachine::new(&template, &context, aggregate);
        if machine.check_completion(task_id, user)? == CompletionCheck::AlreadyCompleted {
            return Ok(None);
        }

        let definitions = template
            .task(&api_name)
            .map(|t| t.fields.as_slice())
            .unwrap_or_default();
        if definitions.is_empty() && values.is_none() {
            return Ok(None);
        }
        let fields = self
            .field_service
            .validate_and_store(
                definitions,
                FieldOrigin::Task { api_name },
                &values.unwrap_or_default(),
            )
            .await?;
        Ok(Some(fields))
    }

    /// Return the workflow from an active task to an earlier one.
    #[instrument(skip(self, comment))]
    pub async fn revert(
        &self,
        workflow_id: Uuid,
        from_task_id: Uuid,
        actor: UserId,
        comment: Option<String>,
    ) -> WorkflowResult<WorkflowAggregate> {
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| {
                machine.revert(from_task_id, actor, comment.clone())
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn delay(
        &self,
        workflow_id: Uuid,
        actor: UserId,
        duration: Option<Duration>,
    ) -> WorkflowResult<WorkflowAggregate> {
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| machine.delay(actor, duration))
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: Uuid, actor: Option<UserId>) -> WorkflowResult<WorkflowAggregate> {
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| machine.resume(actor))
        })
        .await
    }

    /// Resume the workflow only if its active delay has run out.
    #[instrument(skip(self))]
    pub async fn resume_expired(&self, workflow_id: Uuid) -> WorkflowResult<WorkflowAggregate> {
        self.apply(workflow_id, &[], |template, context, aggregate| {
            let expired = aggregate
                .active_delay()
                .map(|delay| delay.is_expired(context.now))
                .unwrap_or(false);
            step(template, context, aggregate, |machine| {
                if expired {
                    machine.resume(None)
                } else {
                    Ok(())
                }
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn terminate(&self, workflow_id: Uuid, actor: Option<UserId>) -> WorkflowResult<WorkflowAggregate> {
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| machine.terminate(actor))
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Edits
    // ----------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn set_urgent(
        &self,
        workflow_id: Uuid,
        actor: UserId,
        is_urgent: bool,
    ) -> WorkflowResult<WorkflowAggregate> {
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| machine.set_urgent(actor, is_urgent))
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn set_task_due_date(
        &self,
        task_id: Uuid,
        actor: UserId,
        due_date: Option<DateTime<Utc>>,
    ) -> WorkflowResult<Task> {
        let workflow_id = self.store.find_workflow_by_task(task_id).await?;
        let aggregate = self
            .apply(workflow_id, &[], move |template, context, aggregate| {
                step(template, context, aggregate, |machine| {
                    machine.set_task_due_date(task_id, actor, due_date)
                })
            })
            .await?;
        aggregate
            .task(task_id)
            .cloned()
            .ok_or_else(|| WorkflowError::not_found("task", task_id))
    }

    #[instrument(skip(self))]
    pub async fn add_performer(
        &self,
        task_id: Uuid,
        actor: UserId,
        performer: PerformerRef,
    ) -> WorkflowResult<WorkflowAggregate> {
        let workflow_id = self.store.find_workflow_by_task(task_id).await?;
        let extra: Vec<GroupId> = match performer {
            PerformerRef::Group { group_id } => vec![group_id],
            PerformerRef::User { .. } => Vec::new(),
        };
        self.apply(workflow_id, &extra, move |template, context, aggregate| {
            step(template, context, aggregate, |machine| {
                machine.add_performer(task_id, actor, performer)
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_performer(
        &self,
        task_id: Uuid,
        actor: UserId,
        performer: PerformerRef,
    ) -> WorkflowResult<WorkflowAggregate> {
        let workflow_id = self.store.find_workflow_by_task(task_id).await?;
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| {
                machine.remove_performer(task_id, actor, performer)
            })
        })
        .await
    }

    #[instrument(skip(self, text, mentions))]
    pub async fn post_comment(
        &self,
        task_id: Uuid,
        author: UserId,
        text: String,
        mentions: Vec<UserId>,
    ) -> WorkflowResult<WorkflowAggregate> {
        let workflow_id = self.store.find_workflow_by_task(task_id).await?;
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| {
                machine.post_comment(task_id, author, text.clone(), mentions.clone())
            })
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn react(
        &self,
        task_id: Uuid,
        by: UserId,
        comment_author: UserId,
    ) -> WorkflowResult<WorkflowAggregate> {
        let workflow_id = self.store.find_workflow_by_task(task_id).await?;
        self.apply(workflow_id, &[], move |template, context, aggregate| {
            step(template, context, aggregate, |machine| machine.react(task_id, by, comment_author))
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Template versions
    // ----------------------------------------------------------------------

    /// Move one open workflow onto the latest version of its template.
    #[instrument(skip(self))]
    pub async fn update_workflow_version(&self, workflow_id: Uuid) -> WorkflowResult<WorkflowAggregate> {
        let current = self.store.load_workflow(workflow_id).await?;
        let latest = self
            .catalog
            .latest(self.store.as_ref(), current.workflow.template_id)
            .await?;
        let extra = template_groups(&latest);
        self.apply(workflow_id, &extra, move |_, context, aggregate| {
            WorkflowVersionUpdater::apply(&latest, context, aggregate)
        })
        .await
    }

    /// Move every open workflow of a template onto its latest version.
    /// Failures are logged per workflow and counted.
    #[instrument(skip(self))]
    pub async fn update_running_workflows(&self, template_id: Uuid) -> WorkflowResult<VersionUpdateSummary> {
        let latest_version = self
            .catalog
            .latest(self.store.as_ref(), template_id)
            .await?
            .template
            .version;
        let workflow_ids = self.store.workflows_for_template(template_id).await?;

        let mut summary = VersionUpdateSummary {
            examined: workflow_ids.len(),
            ..VersionUpdateSummary::default()
        };
        for workflow_id in workflow_ids {
            match self.update_workflow_version(workflow_id).await {
                Ok(aggregate) if aggregate.workflow.template_version == latest_version => {
                    summary.updated += 1
                }
                Ok(_) => {}
                Err(error) => {
                    summary.failed += 1;
                    warn!(%workflow_id, error = %error, "Workflow version update failed");
                }
            }
        }
        info!(?summary, "Template version rolled out");
        Ok(summary)
    }

    // ----------------------------------------------------------------------
    // Reads
    // ----------------------------------------------------------------------

    pub async fn workflow(&self, workflow_id: Uuid) -> WorkflowResult<WorkflowAggregate> {
        Ok(self.store.load_workflow(workflow_id).await?)
    }

    pub async fn notifications_for(&self, user_id: UserId, only_unread: bool) -> WorkflowResult<Vec<Notification>> {
        Ok(self.store.notifications_for_user(user_id, only_unread).await?)
    }

    pub async fn mark_notifications_read(&self, user_id: UserId, notification_ids: &[Uuid]) -> WorkflowResult<usize> {
        Ok(self.store.mark_notifications_read(user_id, notification_ids).await?)
    }

    // ----------------------------------------------------------------------
    // Transition pipeline
    // ----------------------------------------------------------------------

    async fn locate(&self, locator: &TaskLocator) -> WorkflowResult<(Uuid, Uuid)> {
        match locator {
            TaskLocator::Id(task_id) => {
                let workflow_id = self.store.find_workflow_by_task(*task_id).await?;
                Ok((workflow_id, *task_id))
            }
            TaskLocator::ApiName {
                workflow_id,
                api_name,
            } => {
                let aggregate = self.store.load_workflow(*workflow_id).await?;
                let task = aggregate
                    .task_by_api_name(api_name)
                    .ok_or_else(|| WorkflowError::not_found("task", format!("{workflow_id}/{api_name}")))?;
                Ok((*workflow_id, task.id))
            }
        }
    }

    async fn lock_workflow(&self, workflow_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .workflow_locks
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Run `attempt` again while it loses optimistic version checks, up to
    /// the configured bound.
    async fn with_retries<T, F, Fut>(&self, workflow_id: Uuid, mut attempt: F) -> WorkflowResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WorkflowResult<T>>,
    {
        let max_retries = self.config.engine.max_conflict_retries;
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(WorkflowError::Persistence(error)) if error.is_retryable() && retries < max_retries => {
                    retries += 1;
                    warn!(%workflow_id, retries, error = %error, "Retrying after concurrent modification");
                }
                result => return result,
            }
        }
    }

    /// Apply one operation to a stored workflow.
    async fn apply<F>(&self, workflow_id: Uuid, extra_groups: &[GroupId], operation: F) -> WorkflowResult<WorkflowAggregate>
    where
        F: Fn(&CompiledTemplate, &TransitionContext, WorkflowAggregate) -> WorkflowResult<TransitionOutcome>
            + Send
            + Sync,
    {
        let _guard = self.lock_workflow(workflow_id).await;
        self.with_retries(workflow_id, || async {
            let aggregate = self.store.load_workflow(workflow_id).await?;
            let template = self
                .catalog
                .get(self.store.as_ref(), aggregate.workflow.template_id, aggregate.workflow.template_version)
                .await?;
            let now = self.clock.now();
            let context = self.context_for(&aggregate, &template, extra_groups, None, now).await?;
            let expected = aggregate.workflow.version;

            let outcome = operation(template.as_ref(), &context, aggregate)?;
            if outcome.is_noop() {
                debug!(%workflow_id, "Operation changed nothing");
                return Ok(outcome.aggregate);
            }
            self.commit(PendingWrite::new(outcome, Some(expected), now)).await
        })
        .await
    }

    /// Everything the state machine reads besides the aggregate.
    async fn context_for(
        &self,
        aggregate: &WorkflowAggregate,
        template: &CompiledTemplate,
        extra_groups: &[GroupId],
        finishing_child: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<TransitionContext> {
        let mut group_ids: BTreeSet<GroupId> = extra_groups.iter().copied().collect();
        group_ids.extend(template_groups(template));
        group_ids.extend(aggregate.workflow.owners.iter().filter_map(|owner| match owner {
            OwnerRef::Group { group_id } => Some(*group_id),
            OwnerRef::User { .. } => None,
        }));
        for task in &aggregate.tasks {
            group_ids.extend(task.performers.iter().filter_map(|row| match row.performer {
                PerformerRef::Group { group_id } => Some(group_id),
                PerformerRef::User { .. } => None,
            }));
        }

        let groups = if group_ids.is_empty() {
            Default::default()
        } else {
            let group_ids: Vec<GroupId> = group_ids.into_iter().collect();
            self.directory
                .group_members(&group_ids)
                .await
                .map_err(|e| WorkflowError::collaborator(services::USER_DIRECTORY, e))?
        };

        let blocked = self
            .store
            .blocking_sub_workflows(aggregate.id())
            .await?
            .into_iter()
            .filter(|(_, child)| Some(*child) != finishing_child)
            .map(|(task_id, _)| task_id);

        Ok(TransitionContext::new(now, self.config.engine.external_user_id)
            .with_groups(groups)
            .with_blocked_tasks(blocked))
    }

    /// Cascade into parent workflows, plan notifications and commit.
    async fn commit(&self, first: PendingWrite) -> WorkflowResult<WorkflowAggregate> {
        let mut writes = vec![first];
        let mut _parent_guards = Vec::new();

        loop {
            let Some(last) = writes.last() else { break };
            let finished = last.outcome.events.iter().any(DomainEvent::is_terminal);
            let (Some(parent), true) = (last.outcome.aggregate.workflow.parent_task, finished) else {
                break;
            };
            let child_id = last.outcome.aggregate.id();
            let now = last.now;

            _parent_guards.push(self.lock_workflow(parent.workflow_id).await);
            let aggregate = self.store.load_workflow(parent.workflow_id).await?;
            let template = self
                .catalog
                .get(self.store.as_ref(), aggregate.workflow.template_id, aggregate.workflow.template_version)
                .await?;
            let context = self
                .context_for(&aggregate, &template, &[], Some(child_id), now)
                .await?;
            let expected = aggregate.workflow.version;
            let outcome = step(&template, &context, aggregate, |machine| {
                machine.on_sub_workflow_finished(parent.task_id)
            })?;
            if outcome.is_noop() {
                break;
            }
            debug!(parent_workflow_id = %parent.workflow_id, %child_id, "Sub-workflow finished parent task");
            writes.push(PendingWrite::new(outcome, Some(expected), now));
        }

        for write in writes.iter_mut() {
            let intents = NotificationDispatcher::intents_for(&write.outcome.events, &write.outcome.aggregate);
            write.plan = self
                .dispatcher
                .plan(intents, &write.outcome.aggregate, write.now)
                .await?;
        }

        let mut changes = ChangeSet::new();
        for write in &writes {
            if write.outcome.changed {
                changes = match write.expected_version {
                    Some(version) => changes.update(write.outcome.aggregate.clone(), version),
                    None => changes.insert(write.outcome.aggregate.clone()),
                };
            }
            changes = changes.with_notifications(write.plan.notifications());
        }

        let mut committed = self.store.commit(changes).await?.into_iter();
        for write in writes.iter_mut().filter(|w| w.outcome.changed) {
            if let Some(aggregate) = committed.next() {
                write.outcome.aggregate = aggregate;
            }
        }

        for write in &writes {
            self.after_commit(write).await;
        }
        let first = writes.swap_remove(0);
        Ok(first.outcome.aggregate)
    }

    async fn after_commit(&self, write: &PendingWrite) {
        let aggregate = &write.outcome.aggregate;
        let events = &write.outcome.events;

        if !write.plan.is_empty() {
            self.dispatcher
                .dispatch(write.plan.clone(), aggregate, write.now)
                .await;
        }

        for event in events {
            if let Err(error) = self.publisher.publish(event) {
                warn!(event = event.name(), error = %error, "Failed to publish event");
            }
        }

        let records: Vec<AnalyticsEvent> = events
            .iter()
            .filter_map(|event| AnalyticsEvent::from_domain(event, aggregate.workflow.account_id, write.now))
            .collect();
        if !records.is_empty() {
            let analytics = Arc::clone(&self.analytics);
            tokio::spawn(async move {
                for record in records {
                    if let Err(error) = analytics.record(&record).await {
                        warn!(event = record.name, error = %error, "Analytics record failed");
                    }
                }
            });
        }

        if aggregate.workflow.is_finished() {
            self.workflow_locks.remove(&aggregate.id());
        }
    }
}

impl PendingWrite {
    fn new(outcome: TransitionOutcome, expected_version: Option<i64>, now: DateTime<Utc>) -> Self {
        Self {
            outcome,
            expected_version,
            plan: DispatchPlan::default(),
            now,
        }
    }
}

/// Groups named by the performer rules of a template.
fn template_groups(template: &CompiledTemplate) -> Vec<GroupId> {
    template
        .template
        .tasks
        .iter()
        .flat_map(|task| task.performers.iter())
        .filter_map(|rule| match rule {
            PerformerRule::Group { group_id } => Some(*group_id),
            _ => None,
        })
        .collect()
}

/// Assembles a [`WorkflowEngine`]. Collaborators default to the in-process
/// implementations.
pub struct WorkflowEngineBuilder {
    config: Arc<EngineConfig>,
    store: Arc<dyn WorkflowStore>,
    directory: Option<Arc<dyn UserDirectory>>,
    field_service: Option<Arc<dyn FieldService>>,
    guest_auth: Option<Arc<dyn GuestAuthService>>,
    analytics: Option<Arc<dyn AnalyticsService>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    clock: Option<Arc<dyn Clock>>,
    publisher: Option<EventPublisher>,
}

impl WorkflowEngineBuilder {
    pub fn new(config: Arc<EngineConfig>, store: Arc<dyn WorkflowStore>) -> Self {
        Self {
            config,
            store,
            directory: None,
            field_service: None,
            guest_auth: None,
            analytics: None,
            channels: Vec::new(),
            clock: None,
            publisher: None,
        }
    }

    pub fn directory(mut self, directory: Arc<dyn UserDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn field_service(mut self, field_service: Arc<dyn FieldService>) -> Self {
        self.field_service = Some(field_service);
        self
    }

    pub fn guest_auth(mut self, guest_auth: Arc<dyn GuestAuthService>) -> Self {
        self.guest_auth = Some(guest_auth);
        self
    }

    pub fn analytics(mut self, analytics: Arc<dyn AnalyticsService>) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));
        let registry = Arc::new(ChannelRegistry::new(&self.config.notifications));
        for channel in self.channels {
            registry.register(channel);
        }
        let dispatcher = Arc::new(NotificationDispatcher::new(
            self.config.notifications.clone(),
            registry,
            Arc::clone(&directory),
            self.guest_auth
                .unwrap_or_else(|| Arc::new(InMemoryGuestTokens::new())),
        ));

        WorkflowEngine {
            store: self.store,
            catalog: TemplateCatalog::new(),
            directory,
            field_service: self
                .field_service
                .unwrap_or_else(|| Arc::new(TemplateFieldService)),
            analytics: self.analytics.unwrap_or_else(|| Arc::new(TracingAnalytics)),
            dispatcher,
            publisher: self.publisher.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            workflow_locks: DashMap::new(),
            config: self.config,
        }
    }
}
