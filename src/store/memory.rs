//! In-memory [`WorkflowStore`].
//!
//! A single `RwLock` over all workflow state makes every commit atomic.
//! Templates are immutable once saved and live in a `DashMap`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{ChangeSet, OverdueCandidate, PersistenceError, WorkflowStore};
use crate::models::aggregate::WorkflowAggregate;
use crate::models::notification::{Notification, NotificationStatus};
use crate::models::template::Template;
use crate::models::UserId;
use crate::state_machine::states::WorkflowStatus;

#[derive(Debug, Default)]
struct MemoryState {
    workflows: HashMap<Uuid, WorkflowAggregate>,
    /// task id -> workflow id
    task_index: HashMap<Uuid, Uuid>,
    notifications: Vec<Notification>,
    overdue_keys: HashSet<(Uuid, UserId)>,
}

impl MemoryState {
    fn index_tasks(&mut self, aggregate: &WorkflowAggregate) {
        let workflow_id = aggregate.id();
        self.task_index.retain(|_, owner| *owner != workflow_id);
        for task in &aggregate.tasks {
            self.task_index.insert(task.id, workflow_id);
        }
    }

    fn push_notification(&mut self, notification: Notification) -> bool {
        if let Some(key) = notification.overdue_key() {
            if !self.overdue_keys.insert(key) {
                return false;
            }
        }
        self.notifications.push(notification);
        true
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    templates: DashMap<(Uuid, i32), Template>,
    state: RwLock<MemoryState>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored notification row, in insertion order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.read().notifications.clone()
    }

    pub fn workflow_count(&self) -> usize {
        self.state.read().workflows.len()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_template(&self, template: &Template) -> Result<(), PersistenceError> {
        self.templates
            .insert((template.id, template.version), template.clone());
        Ok(())
    }

    async fn load_template(
        &self,
        template_id: Uuid,
        version: Option<i32>,
    ) -> Result<Template, PersistenceError> {
        let found = match version {
            Some(version) => self
                .templates
                .get(&(template_id, version))
                .map(|t| t.value().clone()),
            None => self
                .templates
                .iter()
                .filter(|entry| entry.key().0 == template_id)
                .max_by_key(|entry| entry.key().1)
                .map(|entry| entry.value().clone()),
        };
        found.ok_or_else(|| PersistenceError::not_found("template", template_id))
    }

    async fn load_workflow(&self, workflow_id: Uuid) -> Result<WorkflowAggregate, PersistenceError> {
        self.state
            .read()
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| PersistenceError::not_found("workflow", workflow_id))
    }

    async fn find_workflow_by_task(&self, task_id: Uuid) -> Result<Uuid, PersistenceError> {
        self.state
            .read()
            .task_index
            .get(&task_id)
            .copied()
            .ok_or_else(|| PersistenceError::not_found("task", task_id))
    }

    async fn blocking_sub_workflows(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(Uuid, Uuid)>, PersistenceError> {
        let state = self.state.read();
        Ok(state
            .workflows
            .values()
            .filter(|child| child.workflow.status.is_open())
            .filter_map(|child| {
                child
                    .workflow
                    .parent_task
                    .filter(|parent| parent.workflow_id == workflow_id)
                    .map(|parent| (parent.task_id, child.id()))
            })
            .collect())
    }

    async fn commit(&self, changes: ChangeSet) -> Result<Vec<WorkflowAggregate>, PersistenceError> {
        let mut state = self.state.write();

        // Validate every write before applying any
        for write in &changes.writes {
            let workflow_id = write.aggregate.id();
            match (write.expected_version, state.workflows.get(&workflow_id)) {
                (None, Some(_)) => return Err(PersistenceError::Duplicate { workflow_id }),
                (None, None) => {}
                (Some(expected), Some(stored)) if stored.workflow.version == expected => {}
                (Some(expected), Some(_)) => {
                    return Err(PersistenceError::ConcurrentModification {
                        workflow_id,
                        expected,
                    })
                }
                (Some(_), None) => return Err(PersistenceError::not_found("workflow", workflow_id)),
            }
        }

        let mut committed = Vec::with_capacity(changes.writes.len());
        for write in changes.writes {
            let mut aggregate = write.aggregate;
            if let Some(expected) = write.expected_version {
                aggregate.workflow.version = expected + 1;
            }
            state.index_tasks(&aggregate);
            state.workflows.insert(aggregate.id(), aggregate.clone());
            committed.push(aggregate);
        }
        for notification in changes.notifications {
            state.push_notification(notification);
        }
        Ok(committed)
    }

    async fn find_overdue_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OverdueCandidate>, PersistenceError> {
        let state = self.state.read();
        let mut notified: HashMap<Uuid, HashSet<UserId>> = HashMap::new();
        for (task_id, user_id) in &state.overdue_keys {
            notified.entry(*task_id).or_default().insert(*user_id);
        }
        let none = HashSet::new();
        let mut candidates: Vec<OverdueCandidate> = state
            .workflows
            .values()
            .filter(|aggregate| aggregate.workflow.status == WorkflowStatus::Running)
            .flat_map(|aggregate| {
                aggregate.active_tasks().filter_map(move |task| {
                    let due_date = task.due_date.filter(|due| *due < now)?;
                    Some(OverdueCandidate {
                        workflow_id: aggregate.id(),
                        task_id: task.id,
                        account_id: aggregate.workflow.account_id,
                        due_date,
                        performers: task
                            .active_performers()
                            .filter(|row| !row.is_completed)
                            .map(|row| row.performer)
                            .collect(),
                    })
                })
            })
            .filter_map(|mut candidate| {
                let task_notified = notified.get(&candidate.task_id).unwrap_or(&none);
                candidate.retain_unnotified(task_notified);
                candidate.is_pending().then_some(candidate)
            })
            .collect();
        candidates.sort_by_key(|c| (c.due_date, c.task_id));
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn insert_notifications_if_absent(
        &self,
        notifications: Vec<Notification>,
    ) -> Result<Vec<Notification>, PersistenceError> {
        let mut state = self.state.write();
        Ok(notifications
            .into_iter()
            .filter(|notification| state.push_notification(notification.clone()))
            .collect())
    }

    async fn find_expired_delays(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, PersistenceError> {
        let state = self.state.read();
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = state
            .workflows
            .values()
            .filter(|aggregate| aggregate.workflow.status == WorkflowStatus::Delayed)
            .filter_map(|aggregate| {
                let end = aggregate.active_delay()?.estimated_end_date()?;
                (end <= now).then_some((end, aggregate.id()))
            })
            .collect();
        expired.sort();
        Ok(expired.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn workflows_for_template(&self, template_id: Uuid) -> Result<Vec<Uuid>, PersistenceError> {
        let state = self.state.read();
        let mut ids: Vec<Uuid> = state
            .workflows
            .values()
            .filter(|a| a.workflow.template_id == template_id && a.workflow.status.is_open())
            .map(|a| a.id())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn notifications_for_user(
        &self,
        user_id: UserId,
        only_unread: bool,
    ) -> Result<Vec<Notification>, PersistenceError> {
        let state = self.state.read();
        let mut rows: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .filter(|n| !only_unread || n.status == NotificationStatus::New)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.datetime.cmp(&a.datetime));
        Ok(rows)
    }

    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        notification_ids: &[Uuid],
    ) -> Result<usize, PersistenceError> {
        let mut state = self.state.write();
        let mut changed = 0;
        for notification in state.notifications.iter_mut() {
            if notification.user_id == user_id
                && notification.status == NotificationStatus::New
                && notification_ids.contains(&notification.id)
            {
                notification.status = NotificationStatus::Read;
                changed += 1;
            }
        }
        Ok(changed)
    }
}
