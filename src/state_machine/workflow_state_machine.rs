//! # Workflow State Machine
//!
//! Applies one external trigger to a [`WorkflowAggregate`] and records the
//! resulting [`DomainEvent`]s. The machine is synchronous and performs no
//! I/O: the engine loads the aggregate and a [`TransitionContext`], runs one
//! operation, and commits the outcome atomically. When an operation returns
//! an error the partially mutated aggregate is dropped, so callers never
//! observe half-applied transitions.
//!
//! ## Progression
//!
//! `activate_from(n)` walks tasks `n, n+1, ...`:
//!
//! 1. resolve performers; a task nobody can perform is skipped
//! 2. evaluate conditions; SKIP_TASK skips the task
//! 3. a task with a template delay pauses the workflow first
//! 4. otherwise the task becomes ACTIVE and the walk stops
//!
//! Walking past the last task finishes the workflow.

use chrono::Duration;
use tracing::debug;
use uuid::Uuid;

use super::actions::{LogTransitionAction, StateAction};
use super::context::TransitionContext;
use super::events::{determine_task_target, determine_workflow_target, TaskEvent, WorkflowEvent};
use super::guards::{
    ActivePerformerGuard, PerformerOrOwnerGuard, StateGuard, TASK_ACTIVE, TASK_UNFINISHED,
    WORKFLOW_OPEN, WORKFLOW_RUNNING,
};
use super::states::{TaskStatus, WorkflowStatus};
use crate::engine::condition_evaluator::{ConditionEvaluator, Decision};
use crate::engine::due_date::DueDateCalculator;
use crate::engine::performer_resolver::PerformerResolver;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::{DomainEvent, SkipReason};
use crate::models::aggregate::WorkflowAggregate;
use crate::models::delay::{Delay, DelayKind};
use crate::models::field::FieldSet;
use crate::models::graph::CompiledTemplate;
use crate::models::task::{PerformerRef, Task};
use crate::models::template::{DueDateAnchor, DueDateRule, TaskTemplate};
use crate::models::UserId;

/// Result of running one operation.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub aggregate: WorkflowAggregate,
    pub events: Vec<DomainEvent>,
    /// Whether the aggregate differs from what was loaded
    pub changed: bool,
}

impl TransitionOutcome {
    pub fn is_noop(&self) -> bool {
        !self.changed && self.events.is_empty()
    }
}

/// Outcome of the pre-flight check of a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCheck {
    Proceed,
    /// The user's part is already done; completing again is a silent no-op
    AlreadyCompleted,
}

pub struct WorkflowStateMachine<'a> {
    template: &'a CompiledTemplate,
    context: &'a TransitionContext,
    aggregate: WorkflowAggregate,
    events: Vec<DomainEvent>,
    changed: bool,
    actor: Option<UserId>,
}

impl<'a> WorkflowStateMachine<'a> {
    pub fn new(
        template: &'a CompiledTemplate,
        context: &'a TransitionContext,
        aggregate: WorkflowAggregate,
    ) -> Self {
        Self {
            template,
            context,
            aggregate,
            events: Vec::new(),
            changed: false,
            actor: None,
        }
    }

    pub fn aggregate(&self) -> &WorkflowAggregate {
        &self.aggregate
    }

    pub fn events(&self) -> &[DomainEvent] {
        &self.events
    }

    pub fn into_outcome(self) -> TransitionOutcome {
        TransitionOutcome {
            aggregate: self.aggregate,
            events: self.events,
            changed: self.changed,
        }
    }

    /// Record a change made to the aggregate outside the machine's own
    /// operations, e.g. a template version rebuild.
    pub(crate) fn record_external_change(&mut self, event: DomainEvent) {
        self.changed = true;
        self.events.push(event);
    }

    // ----------------------------------------------------------------------
    // Lifecycle
    // ----------------------------------------------------------------------

    /// Start a freshly instantiated workflow.
    pub fn start(&mut self, by: Option<UserId>) -> WorkflowResult<()> {
        self.actor = by;
        self.changed = true;
        self.events.push(DomainEvent::WorkflowStarted {
            workflow_id: self.aggregate.id(),
            by,
        });
        self.refresh_due_dates(|rule, _| !rule.rule.is_task_anchor());
        self.activate_from(1)
    }

    /// Activate the first qualifying task after the current one.
    pub fn activate_next(&mut self) -> WorkflowResult<()> {
        let next = self.aggregate.workflow.current_task + 1;
        self.activate_from(next)
    }

    fn activate_from(&mut self, start: u32) -> WorkflowResult<()> {
        if !self.aggregate.workflow.is_running() {
            return Ok(());
        }

        let count = self.aggregate.workflow.tasks_count;
        let mut number = start.max(1);
        while number <= count {
            let index = self.index_of_number(number)?;
            match self.aggregate.tasks[index].status {
                TaskStatus::Completed | TaskStatus::Skipped => {
                    number += 1;
                    continue;
                }
                TaskStatus::Active => {
                    self.aggregate.workflow.current_task = number;
                    return Ok(());
                }
                TaskStatus::Pending => {}
            }

            let template = self.template_for(index)?;
            let resolved = self.resolve_performers(template);
            if !self.would_have_performers(index, &resolved) {
                self.skip_task(index, SkipReason::NoPerformers)?;
                number += 1;
                continue;
            }

            if ConditionEvaluator::new(&self.aggregate).evaluate(&template.conditions)
                == Decision::Skip
            {
                self.skip_task(index, SkipReason::Condition)?;
                number += 1;
                continue;
            }

            if let Some(delay) = template.delay {
                if !self.aggregate.tasks[index].delay_elapsed {
                    return self.delay_before(index, delay);
                }
            }

            self.activate_task(index, Some(&resolved))?;
            let task_id = self.aggregate.tasks[index].id;
            self.events.push(DomainEvent::TaskActivated {
                workflow_id: self.aggregate.id(),
                task_id,
            });
            return Ok(());
        }

        self.finish()
    }

    fn activate_task(
        &mut self,
        index: usize,
        resolved: Option<&[PerformerRef]>,
    ) -> WorkflowResult<()> {
        self.transition_task(index, TaskEvent::Activate)?;

        let now = self.context.now;
        let task = &mut self.aggregate.tasks[index];
        task.date_started = Some(now);
        task.date_completed = None;
        if let Some(resolved) = resolved {
            task.merge_performers(resolved, false);
        }
        let number = task.number;
        let api_name = task.api_name.clone();

        self.aggregate.workflow.current_task = number;
        self.add_members(index);
        self.refresh_due_dates(|rule, task| {
            rule.rule == DueDateAnchor::AfterTaskStarted
                && rule.anchor_task(&task.api_name) == Some(api_name.as_str())
        });
        Ok(())
    }

    fn skip_task(&mut self, index: usize, reason: SkipReason) -> WorkflowResult<()> {
        self.transition_task(index, TaskEvent::Skip)?;
        debug!(
            task = %self.aggregate.tasks[index].api_name,
            reason = ?reason,
            "Skipping task"
        );
        self.events.push(DomainEvent::TaskSkipped {
            workflow_id: self.aggregate.id(),
            task_id: self.aggregate.tasks[index].id,
            reason,
        });
        Ok(())
    }

    fn delay_before(&mut self, index: usize, duration: Duration) -> WorkflowResult<()> {
        self.transition_workflow(WorkflowEvent::Delay)?;

        let (task_id, number) = {
            let task = &self.aggregate.tasks[index];
            (task.id, task.number)
        };
        let delay = Delay::start(
            self.aggregate.id(),
            Some(task_id),
            DelayKind::Task,
            self.context.now,
            Some(duration),
        );
        let until = delay.estimated_end_date();
        self.aggregate.delays.push(delay);
        self.aggregate.workflow.current_task = number;
        self.events.push(DomainEvent::WorkflowDelayed {
            workflow_id: self.aggregate.id(),
            task_id: Some(task_id),
            until,
            by: None,
        });
        Ok(())
    }

    fn finish(&mut self) -> WorkflowResult<()> {
        self.transition_workflow(WorkflowEvent::Finish)?;
        let workflow = &mut self.aggregate.workflow;
        workflow.current_task = workflow.tasks_count + 1;
        workflow.date_completed = Some(self.context.now);
        self.events.push(DomainEvent::WorkflowCompleted {
            workflow_id: workflow.id,
            by: self.actor,
        });
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Completion
    // ----------------------------------------------------------------------

    /// Validate a completion request without changing anything.
    pub fn check_completion(&self, task_id: Uuid, user: UserId) -> WorkflowResult<CompletionCheck> {
        let task = self.task(task_id)?;
        let groups = &self.context.groups;

        if task.is_completed() {
            return if task.is_performer(user, groups) {
                Ok(CompletionCheck::AlreadyCompleted)
            } else {
                Err(WorkflowError::PerformerDenied {
                    task_id,
                    user_id: user,
                })
            };
        }

        WORKFLOW_RUNNING.check(&self.aggregate.workflow)?;
        TASK_ACTIVE.check(task)?;
        ActivePerformerGuard { user, groups }.check(task)?;

        if task.is_completed_for(user, groups) {
            return Ok(CompletionCheck::AlreadyCompleted);
        }
        Ok(CompletionCheck::Proceed)
    }

    /// Record `user`'s completion of an active task, storing the task
    /// outputs, and complete the task once its policy is satisfied.
    pub fn complete_task_for_user(
        &mut self,
        task_id: Uuid,
        user: UserId,
        fields: Option<FieldSet>,
    ) -> WorkflowResult<()> {
        if self.check_completion(task_id, user)? == CompletionCheck::AlreadyCompleted {
            debug!(%task_id, user, "Completion already recorded");
            return Ok(());
        }

        self.actor = Some(user);
        let index = self.task_index(task_id)?;
        if let Some(fields) = fields {
            self.store_fields(fields);
        }

        let context = self.context;
        self.aggregate.tasks[index].mark_completed_by(user, &context.groups, context.now);
        self.changed = true;
        self.events.push(DomainEvent::PerformerCompleted {
            workflow_id: self.aggregate.id(),
            task_id,
            user_id: user,
        });

        self.try_complete(index, user)
    }

    fn try_complete(&mut self, index: usize, by: UserId) -> WorkflowResult<()> {
        let task = &self.aggregate.tasks[index];
        if !task.can_be_completed() {
            return Ok(());
        }
        if self.context.blocked_tasks.contains(&task.id) {
            debug!(task_id = %task.id, "Task waits for running sub-workflows");
            return Ok(());
        }
        self.complete_task(index, by)
    }

    fn complete_task(&mut self, index: usize, by: UserId) -> WorkflowResult<()> {
        self.transition_task(index, TaskEvent::Complete)?;

        let task = &mut self.aggregate.tasks[index];
        task.date_completed = Some(self.context.now);
        let (task_id, number, api_name) = (task.id, task.number, task.api_name.clone());

        self.events.push(DomainEvent::TaskCompleted {
            workflow_id: self.aggregate.workflow.id,
            task_id,
            by,
        });
        self.refresh_due_dates(|rule, task| {
            rule.rule == DueDateAnchor::AfterTaskCompleted
                && rule.anchor_task(&task.api_name) == Some(api_name.as_str())
        });
        self.activate_from(number + 1)
    }

    fn store_fields(&mut self, fields: FieldSet) {
        let changed = self.aggregate.workflow.fields.merge(fields);
        if changed.is_empty() {
            return;
        }
        self.changed = true;
        self.refresh_due_dates(|rule, _| {
            rule.rule.is_field_anchor()
                && rule
                    .source_id
                    .as_ref()
                    .map(|source| changed.contains(source))
                    .unwrap_or(false)
        });
    }

    /// Complete a task whose last sub-workflow just finished, if its
    /// completion policy holds.
    pub fn on_sub_workflow_finished(&mut self, task_id: Uuid) -> WorkflowResult<()> {
        let index = self.task_index(task_id)?;
        let task = &self.aggregate.tasks[index];
        if !task.is_active() || !self.aggregate.workflow.is_running() {
            return Ok(());
        }
        match task.first_completed_user() {
            Some(by) => {
                self.actor = Some(by);
                self.try_complete(index, by)
            }
            None => Ok(()),
        }
    }

    // ----------------------------------------------------------------------
    // Revert
    // ----------------------------------------------------------------------

    /// Return the workflow from an active task to an earlier one.
    ///
    /// The target is the task's configured revert task, or the nearest
    /// completed ancestor. Every task from the target through the reverted
    /// task goes back to pending and the target is activated again.
    pub fn revert(
        &mut self,
        from_task_id: Uuid,
        actor: UserId,
        comment: Option<String>,
    ) -> WorkflowResult<()> {
        self.actor = Some(actor);
        WORKFLOW_RUNNING.check(&self.aggregate.workflow)?;

        let from_index = self.task_index(from_task_id)?;
        {
            let from = &self.aggregate.tasks[from_index];
            TASK_ACTIVE.check(from)?;
            PerformerOrOwnerGuard {
                user: actor,
                groups: &self.context.groups,
                workflow: &self.aggregate.workflow,
            }
            .check(from)?;
        }

        let target_index = self.revert_target(from_index)?;
        let target_number = self.aggregate.tasks[target_index].number;
        let from_number = self.aggregate.tasks[from_index].number;

        for index in 0..self.aggregate.tasks.len() {
            let number = self.aggregate.tasks[index].number;
            if (target_number..=from_number).contains(&number) {
                self.transition_task(index, TaskEvent::Reset)?;
                self.aggregate.tasks[index].reset();
            }
        }
        self.aggregate.workflow.current_task = target_number;
        self.refresh_due_dates(|_, task| (target_number..=from_number).contains(&task.number));

        let template = self.template_for(target_index)?;
        let resolved = self.resolve_performers(template);
        if self.would_have_performers(target_index, &resolved) {
            self.activate_task(target_index, Some(&resolved))?;
        } else {
            // Keep the previous assignees rather than stranding the workflow
            self.activate_task(target_index, None)?;
        }

        self.events.push(DomainEvent::WorkflowReverted {
            workflow_id: self.aggregate.id(),
            from_task_id,
            to_task_id: self.aggregate.tasks[target_index].id,
            by: actor,
            comment,
        });
        Ok(())
    }

    fn revert_target(&self, from_index: usize) -> WorkflowResult<usize> {
        let from = &self.aggregate.tasks[from_index];
        let template = self.template_for(from_index)?;
        let invalid = |target: &str| WorkflowError::InvalidRevertTarget {
            task_id: from.id,
            target: target.to_string(),
        };

        let target_api = match &template.revert_task {
            Some(target) => {
                if target == &from.api_name || !self.template.is_ancestor(&from.api_name, target) {
                    return Err(invalid(target));
                }
                target.clone()
            }
            None => {
                let graph = &self.template.graph;
                let node = graph
                    .index_of(&from.api_name)
                    .ok_or_else(|| invalid(&from.api_name))?;
                graph
                    .ancestors_nearest_first(node)
                    .into_iter()
                    .filter_map(|i| graph.node(i))
                    .map(|n| n.api_name.clone())
                    .find(|api_name| {
                        self.aggregate
                            .task_by_api_name(api_name)
                            .map(|t| t.is_completed())
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| invalid("previous task"))?
            }
        };

        let target_index = self
            .aggregate
            .tasks
            .iter()
            .position(|t| t.api_name == target_api)
            .ok_or_else(|| invalid(&target_api))?;
        let target = &self.aggregate.tasks[target_index];
        if target.status == TaskStatus::Pending || target.number >= from.number {
            return Err(invalid(&target_api));
        }
        Ok(target_index)
    }

    // ----------------------------------------------------------------------
    // Delay, resume, terminate
    // ----------------------------------------------------------------------

    /// Pause a running workflow. Without a duration the delay lasts until
    /// explicitly resumed.
    pub fn delay(&mut self, actor: UserId, duration: Option<Duration>) -> WorkflowResult<()> {
        self.actor = Some(actor);
        if self.aggregate.active_delay().is_some() {
            return Err(WorkflowError::InvalidWorkflowState {
                workflow_id: self.aggregate.id(),
                current: WorkflowStatus::Delayed,
                expected: vec![WorkflowStatus::Running],
            });
        }
        self.transition_workflow(WorkflowEvent::Delay)?;

        let task_id = self
            .aggregate
            .current_task()
            .filter(|t| t.is_active())
            .map(|t| t.id);
        let delay = Delay::start(
            self.aggregate.id(),
            task_id,
            DelayKind::Manual,
            self.context.now,
            duration,
        );
        let until = delay.estimated_end_date();
        self.aggregate.delays.push(delay);
        self.events.push(DomainEvent::WorkflowDelayed {
            workflow_id: self.aggregate.id(),
            task_id,
            until,
            by: Some(actor),
        });
        Ok(())
    }

    /// Resume a delayed workflow; a no-op on a running one.
    ///
    /// Closing a manual delay shifts due dates anchored to the start of the
    /// active task by the time spent delayed. Closing a task delay starts the
    /// task it was guarding.
    pub fn resume(&mut self, actor: Option<UserId>) -> WorkflowResult<()> {
        if self.aggregate.workflow.status == WorkflowStatus::Running {
            return Ok(());
        }
        self.actor = actor;
        self.transition_workflow(WorkflowEvent::Resume)?;

        let now = self.context.now;
        let closed = self.aggregate.active_delay_mut().map(|delay| {
            delay.end_date = Some(now);
            (delay.kind, delay.task_id, now - delay.start_date)
        });

        let current = self.aggregate.workflow.current_task;
        let task_id = closed
            .and_then(|(_, task_id, _)| task_id)
            .or_else(|| self.aggregate.current_task().map(|t| t.id));
        self.events.push(DomainEvent::WorkflowResumed {
            workflow_id: self.aggregate.id(),
            task_id,
            by: actor,
        });

        match closed {
            Some((DelayKind::Task, _, _)) => {
                if let Some(task) = self.aggregate.task_by_number_mut(current) {
                    task.delay_elapsed = true;
                }
            }
            Some((DelayKind::Manual, _, elapsed)) => self.shift_due_dates(elapsed),
            None => {}
        }
        self.activate_from(current)
    }

    fn shift_due_dates(&mut self, elapsed: Duration) {
        let template = self.template;
        for task in self.aggregate.tasks.iter_mut() {
            if !task.is_active() || task.due_date_manual {
                continue;
            }
            let anchored_to_start = template
                .task(&task.api_name)
                .and_then(|t| t.due_date.as_ref())
                .map(|rule| rule.rule == DueDateAnchor::AfterTaskStarted)
                .unwrap_or(false);
            if anchored_to_start {
                if let Some(due) = task.due_date {
                    task.due_date = due.checked_add_signed(elapsed).or(Some(due));
                    self.changed = true;
                }
            }
        }
    }

    /// Stop the workflow. Terminating twice is a no-op; a finished workflow
    /// cannot be terminated.
    pub fn terminate(&mut self, actor: Option<UserId>) -> WorkflowResult<()> {
        if self.aggregate.workflow.status == WorkflowStatus::Terminated {
            return Ok(());
        }
        self.actor = actor;
        self.transition_workflow(WorkflowEvent::Terminate)?;

        let now = self.context.now;
        if let Some(delay) = self.aggregate.active_delay_mut() {
            delay.end_date = Some(now);
        }
        self.aggregate.workflow.date_completed = Some(now);
        self.events.push(DomainEvent::WorkflowTerminated {
            workflow_id: self.aggregate.id(),
            by: actor,
        });
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Edits
    // ----------------------------------------------------------------------

    pub fn set_urgent(&mut self, actor: UserId, is_urgent: bool) -> WorkflowResult<()> {
        WORKFLOW_OPEN.check(&self.aggregate.workflow)?;
        if self.aggregate.workflow.is_urgent == is_urgent {
            return Ok(());
        }
        self.actor = Some(actor);
        self.aggregate.workflow.is_urgent = is_urgent;
        self.changed = true;
        self.events.push(DomainEvent::UrgencyChanged {
            workflow_id: self.aggregate.id(),
            task_id: self.aggregate.active_tasks().next().map(|t| t.id),
            is_urgent,
            by: actor,
        });
        Ok(())
    }

    /// Set a task's due date by hand. `None` clears the manual value and
    /// falls back to the template rule.
    pub fn set_task_due_date(
        &mut self,
        task_id: Uuid,
        actor: UserId,
        due_date: Option<chrono::DateTime<chrono::Utc>>,
    ) -> WorkflowResult<()> {
        WORKFLOW_OPEN.check(&self.aggregate.workflow)?;
        let index = self.task_index(task_id)?;
        TASK_UNFINISHED.check(&self.aggregate.tasks[index])?;
        self.actor = Some(actor);

        let computed = match due_date {
            Some(due) => Some(due),
            None => {
                let task = &self.aggregate.tasks[index];
                self.template_for(index)?
                    .due_date
                    .as_ref()
                    .and_then(|rule| DueDateCalculator::due_date_for(rule, &task.api_name, &self.aggregate))
            }
        };

        let task = &mut self.aggregate.tasks[index];
        let was_manual = task.due_date_manual;
        task.due_date_manual = due_date.is_some();
        let old = std::mem::replace(&mut task.due_date, computed);
        let is_active = task.is_active();
        self.changed |= old != computed || was_manual != due_date.is_some();

        if is_active && old != computed {
            self.events.push(DomainEvent::DueDateChanged {
                workflow_id: self.aggregate.workflow.id,
                task_id,
                old,
                new: computed,
                by: Some(actor),
            });
        }
        Ok(())
    }

    pub fn add_performer(
        &mut self,
        task_id: Uuid,
        actor: UserId,
        performer: PerformerRef,
    ) -> WorkflowResult<()> {
        WORKFLOW_OPEN.check(&self.aggregate.workflow)?;
        let index = self.task_index(task_id)?;
        TASK_UNFINISHED.check(&self.aggregate.tasks[index])?;

        if !self.aggregate.tasks[index].add_manual_performer(performer) {
            return Ok(());
        }
        self.actor = Some(actor);
        self.changed = true;
        if self.aggregate.tasks[index].is_active() {
            self.add_members(index);
        }
        self.events.push(DomainEvent::PerformerAdded {
            workflow_id: self.aggregate.id(),
            task_id,
            performer,
            by: actor,
        });
        Ok(())
    }

    /// Remove a performer by hand. The last performer of an active task
    /// cannot be removed; removing the only outstanding performer of a
    /// task that requires everyone completes it.
    pub fn remove_performer(
        &mut self,
        task_id: Uuid,
        actor: UserId,
        performer: PerformerRef,
    ) -> WorkflowResult<()> {
        WORKFLOW_OPEN.check(&self.aggregate.workflow)?;
        let index = self.task_index(task_id)?;
        let task = &self.aggregate.tasks[index];
        TASK_UNFINISHED.check(task)?;

        let is_assigned = task.row(&performer).map(|r| r.is_active()).unwrap_or(false);
        if !is_assigned {
            return Ok(());
        }
        if task.is_active() && task.active_performers().count() == 1 {
            return Err(WorkflowError::LastPerformer { task_id });
        }

        self.actor = Some(actor);
        self.aggregate.tasks[index].remove_performer(performer);
        self.changed = true;
        self.events.push(DomainEvent::PerformerRemoved {
            workflow_id: self.aggregate.id(),
            task_id,
            performer,
            by: actor,
        });

        let task = &self.aggregate.tasks[index];
        if task.is_active() && self.aggregate.workflow.is_running() {
            if let Some(by) = task.first_completed_user() {
                return self.try_complete(index, by);
            }
        }
        Ok(())
    }

    pub fn post_comment(
        &mut self,
        task_id: Uuid,
        author: UserId,
        text: String,
        mentions: Vec<UserId>,
    ) -> WorkflowResult<()> {
        self.task(task_id)?;
        self.events.push(DomainEvent::CommentPosted {
            workflow_id: self.aggregate.id(),
            task_id,
            author,
            text,
            mentions,
        });
        Ok(())
    }

    pub fn react(&mut self, task_id: Uuid, by: UserId, comment_author: UserId) -> WorkflowResult<()> {
        self.task(task_id)?;
        self.events.push(DomainEvent::CommentReacted {
            workflow_id: self.aggregate.id(),
            task_id,
            by,
            comment_author,
        });
        Ok(())
    }

    /// Bring the current task in line with a rebuilt task list after a
    /// template version update.
    pub fn settle_after_update(&mut self) -> WorkflowResult<()> {
        if !self.aggregate.workflow.is_running() {
            return Ok(());
        }
        let current = self.aggregate.workflow.current_task;
        let index = match self.index_of_number(current) {
            Ok(index) if self.aggregate.tasks[index].is_active() => index,
            _ => return self.activate_from(current),
        };

        let template = self.template_for(index)?;
        let resolved = self.resolve_performers(template);
        let task = &mut self.aggregate.tasks[index];
        task.require_completion_by_all = template.require_completion_by_all;
        task.merge_performers(&resolved, true);
        self.changed = true;

        if !self.aggregate.tasks[index].has_active_performers() {
            self.skip_task(index, SkipReason::NoPerformers)?;
            return self.activate_from(current + 1);
        }
        self.add_members(index);

        match self.aggregate.tasks[index].first_completed_user() {
            Some(by) => {
                self.actor = Some(by);
                self.try_complete(index, by)
            }
            None => Ok(()),
        }
    }

    // ----------------------------------------------------------------------
    // Helpers
    // ----------------------------------------------------------------------

    fn transition_workflow(&mut self, event: WorkflowEvent) -> WorkflowResult<()> {
        let current = self.aggregate.workflow.status;
        let target = determine_workflow_target(current, event).ok_or_else(|| {
            WorkflowError::InvalidWorkflowState {
                workflow_id: self.aggregate.workflow.id,
                current,
                expected: event.allowed_from().to_vec(),
            }
        })?;
        self.aggregate.workflow.status = target;
        self.changed = true;
        LogTransitionAction.execute(
            &self.aggregate.workflow,
            &current.to_string(),
            &target.to_string(),
            event.event_type(),
        );
        Ok(())
    }

    fn transition_task(&mut self, index: usize, event: TaskEvent) -> WorkflowResult<()> {
        let task = &mut self.aggregate.tasks[index];
        let current = task.status;
        let target =
            determine_task_target(current, event).ok_or_else(|| WorkflowError::InvalidTaskState {
                task_id: task.id,
                current,
                expected: event.allowed_from().to_vec(),
            })?;
        task.status = target;
        self.changed = true;
        LogTransitionAction.execute(
            &*task,
            &current.to_string(),
            &target.to_string(),
            event.event_type(),
        );
        Ok(())
    }

    fn task(&self, task_id: Uuid) -> WorkflowResult<&Task> {
        self.aggregate
            .task(task_id)
            .ok_or_else(|| WorkflowError::not_found("task", task_id))
    }

    fn task_index(&self, task_id: Uuid) -> WorkflowResult<usize> {
        self.aggregate
            .tasks
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| WorkflowError::not_found("task", task_id))
    }

    fn index_of_number(&self, number: u32) -> WorkflowResult<usize> {
        self.aggregate
            .tasks
            .iter()
            .position(|t| t.number == number)
            .ok_or_else(|| {
                WorkflowError::not_found("task", format!("{}#{number}", self.aggregate.id()))
            })
    }

    fn template_for(&self, index: usize) -> WorkflowResult<&'a TaskTemplate> {
        let template = self.template;
        let api_name = &self.aggregate.tasks[index].api_name;
        template
            .task(api_name)
            .ok_or_else(|| WorkflowError::not_found("task template", api_name))
    }

    fn resolve_performers(&self, template: &TaskTemplate) -> Vec<PerformerRef> {
        PerformerResolver::new(&self.aggregate.workflow.starter, self.context.external_user_id)
            .resolve(&template.performers, &self.aggregate.workflow.fields)
    }

    /// Whether the task would have anyone to perform it after merging
    /// `resolved` with its manual overrides.
    fn would_have_performers(&self, index: usize, resolved: &[PerformerRef]) -> bool {
        let mut probe = self.aggregate.tasks[index].clone();
        probe.merge_performers(resolved, false);
        probe.has_active_performers()
    }

    fn add_members(&mut self, index: usize) {
        let groups = &self.context.groups;
        let members: Vec<UserId> = self.aggregate.tasks[index]
            .active_performers()
            .flat_map(|row| match row.performer {
                PerformerRef::User { user_id } => vec![user_id],
                PerformerRef::Group { group_id } => groups.members(group_id).collect(),
            })
            .collect();
        self.aggregate.workflow.members.extend(members);
    }

    /// Recompute due dates of unfinished, non-manual tasks selected by
    /// `affected`. A changed due date of an active task is announced.
    fn refresh_due_dates<F>(&mut self, affected: F)
    where
        F: Fn(&DueDateRule, &Task) -> bool,
    {
        let template = self.template;
        let updates: Vec<_> = self
            .aggregate
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| !task.due_date_manual && !task.status.is_terminal())
            .filter_map(|(index, task)| {
                let rule = template.task(&task.api_name)?.due_date.as_ref()?;
                if !affected(rule, task) {
                    return None;
                }
                let due = DueDateCalculator::due_date_for(rule, &task.api_name, &self.aggregate);
                (due != task.due_date).then_some((index, due))
            })
            .collect();

        let workflow_id = self.aggregate.workflow.id;
        for (index, due) in updates {
            let task = &mut self.aggregate.tasks[index];
            let old = std::mem::replace(&mut task.due_date, due);
            self.changed = true;
            if task.is_active() && old.is_some() {
                self.events.push(DomainEvent::DueDateChanged {
                    workflow_id,
                    task_id: task.id,
                    old,
                    new: due,
                    by: None,
                });
            }
        }
    }
}
