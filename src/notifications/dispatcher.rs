//! # Notification Dispatcher
//!
//! Turns committed domain events into channel sends in three steps:
//!
//! 1. [`NotificationDispatcher::intents_for`] maps events to intents (type,
//!    audience, author); pure
//! 2. [`NotificationDispatcher::plan`] expands audiences into directory
//!    users, drops inactive users and the author where the type excludes
//!    them, and builds the audit rows of durable types. The engine commits
//!    those rows together with the transition.
//! 3. [`NotificationDispatcher::dispatch`] renders payloads and sends every
//!    (recipient, enabled channel) pair concurrently under a timeout.
//!
//! Dispatch never fails: channel errors are logged and counted in the
//! returned [`DispatchReport`].

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::channels::{ChannelError, ChannelRegistry, NotificationChannel};
use super::payload::{NotificationPayload, PayloadContext};
use crate::config::NotificationConfig;
use crate::constants::services;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::DomainEvent;
use crate::models::aggregate::WorkflowAggregate;
use crate::models::notification::{Notification, NotificationType};
use crate::models::task::PerformerRef;
use crate::models::template::OwnerRef;
use crate::models::user::{GroupMemberships, UserProfile};
use crate::models::{GroupId, UserId};
use crate::services::directory::UserDirectory;
use crate::services::guest_auth::GuestAuthService;

/// Who an intent is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    /// Active performers of the task that have not completed it
    TaskPerformers(Uuid),
    /// Workflow owners
    Owners,
    /// Union of `TaskPerformers` and `Owners`
    PerformersAndOwners(Uuid),
    Users(Vec<UserId>),
    /// One performer row, expanded when it is a group
    Performer(PerformerRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationIntent {
    pub notification_type: NotificationType,
    pub task_id: Option<Uuid>,
    pub audience: Audience,
    /// The acting user
    pub author: Option<UserId>,
    pub text: Option<String>,
}

impl NotificationIntent {
    fn new(notification_type: NotificationType, task_id: Option<Uuid>, audience: Audience) -> Self {
        Self {
            notification_type,
            task_id,
            audience,
            author: None,
            text: None,
        }
    }

    fn by(mut self, author: Option<UserId>) -> Self {
        self.author = author;
        self
    }

    fn with_text(mut self, text: Option<String>) -> Self {
        self.text = text;
        self
    }
}

/// One notification for one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub notification_type: NotificationType,
    pub recipient: UserProfile,
    pub workflow_id: Uuid,
    pub task_id: Option<Uuid>,
    pub author: Option<UserId>,
    pub text: Option<String>,
    /// Audit row of a durable notification
    pub row: Option<Notification>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchPlan {
    pub deliveries: Vec<Delivery>,
}

impl DispatchPlan {
    /// Audit rows to commit before dispatch.
    pub fn notifications(&self) -> Vec<Notification> {
        self.deliveries.iter().filter_map(|d| d.row.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// Recipients of one notification type, sorted.
    pub fn recipients(&self, notification_type: NotificationType) -> Vec<UserId> {
        let ids: BTreeSet<UserId> = self
            .deliveries
            .iter()
            .filter(|d| d.notification_type == notification_type)
            .map(|d| d.recipient.id)
            .collect();
        ids.into_iter().collect()
    }
}

/// Counts of one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub deliveries: usize,
    pub sent: usize,
    pub failed: usize,
    /// Sends skipped because the recipient unsubscribed from the type
    pub unsubscribed: usize,
}

pub struct NotificationDispatcher {
    config: NotificationConfig,
    channels: Arc<ChannelRegistry>,
    directory: Arc<dyn UserDirectory>,
    guest_auth: Arc<dyn GuestAuthService>,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("config", &self.config)
            .field("channels", &self.channels)
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new(
        config: NotificationConfig,
        channels: Arc<ChannelRegistry>,
        directory: Arc<dyn UserDirectory>,
        guest_auth: Arc<dyn GuestAuthService>,
    ) -> Self {
        Self {
            config,
            channels,
            directory,
            guest_auth,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Notification intents raised by the events of one transition,
    /// judged against the aggregate after the transition.
    pub fn intents_for(events: &[DomainEvent], aggregate: &WorkflowAggregate) -> Vec<NotificationIntent> {
        use NotificationType as N;

        let task_is_active = |task_id: Uuid| {
            aggregate.workflow.is_running()
                && aggregate.task(task_id).map(|t| t.is_active()).unwrap_or(false)
        };
        let current_task = || aggregate.current_task().map(|t| t.id);

        let mut intents = Vec::new();
        for event in events {
            match event {
                DomainEvent::TaskActivated { task_id, .. } if task_is_active(*task_id) => {
                    intents.push(NotificationIntent::new(
                        N::NewTask,
                        Some(*task_id),
                        Audience::TaskPerformers(*task_id),
                    ));
                }
                DomainEvent::PerformerAdded {
                    task_id,
                    performer,
                    by,
                    ..
                } if task_is_active(*task_id) => {
                    intents.push(
                        NotificationIntent::new(N::NewTask, Some(*task_id), Audience::Performer(*performer))
                            .by(Some(*by)),
                    );
                }
                DomainEvent::TaskCompleted { task_id, by, .. } => {
                    intents.push(
                        NotificationIntent::new(N::TaskCompleted, Some(*task_id), Audience::Owners)
                            .by(Some(*by)),
                    );
                }
                DomainEvent::WorkflowCompleted { by, .. } => {
                    intents.push(NotificationIntent::new(N::WorkflowCompleted, None, Audience::Owners).by(*by));
                }
                DomainEvent::DueDateChanged {
                    task_id, new, by, ..
                } if task_is_active(*task_id) => {
                    intents.push(
                        NotificationIntent::new(
                            N::DueDateChanged,
                            Some(*task_id),
                            Audience::TaskPerformers(*task_id),
                        )
                        .by(*by)
                        .with_text(new.map(|due| due.to_rfc3339())),
                    );
                }
                DomainEvent::WorkflowDelayed { task_id, until, by, .. } => {
                    if let Some(task_id) = task_id.or_else(current_task) {
                        intents.push(
                            NotificationIntent::new(
                                N::DelayWorkflow,
                                Some(task_id),
                                Audience::TaskPerformers(task_id),
                            )
                            .by(*by)
                            .with_text(until.map(|until| until.to_rfc3339())),
                        );
                    }
                }
                DomainEvent::WorkflowResumed { task_id, by, .. } => {
                    if let Some(task_id) = task_id.or_else(current_task) {
                        intents.push(
                            NotificationIntent::new(
                                N::ResumeWorkflow,
                                Some(task_id),
                                Audience::TaskPerformers(task_id),
                            )
                            .by(*by),
                        );
                    }
                }
                DomainEvent::UrgencyChanged {
                    task_id,
                    is_urgent,
                    by,
                    ..
                } => {
                    if let Some(task_id) = task_id.or_else(current_task) {
                        let kind = if *is_urgent { N::Urgent } else { N::NotUrgent };
                        intents.push(
                            NotificationIntent::new(kind, Some(task_id), Audience::TaskPerformers(task_id))
                                .by(Some(*by)),
                        );
                    }
                }
                DomainEvent::WorkflowReverted {
                    to_task_id,
                    by,
                    comment,
                    ..
                } => {
                    intents.push(
                        NotificationIntent::new(
                            N::ReturnTask,
                            Some(*to_task_id),
                            Audience::TaskPerformers(*to_task_id),
                        )
                        .by(Some(*by))
                        .with_text(comment.clone()),
                    );
                }
                DomainEvent::CommentPosted {
                    task_id,
                    author,
                    text,
                    mentions,
                    ..
                } => {
                    intents.push(
                        NotificationIntent::new(
                            N::Comment,
                            Some(*task_id),
                            Audience::PerformersAndOwners(*task_id),
                        )
                        .by(Some(*author))
                        .with_text(Some(text.clone())),
                    );
                    if !mentions.is_empty() {
                        intents.push(
                            NotificationIntent::new(N::Mention, Some(*task_id), Audience::Users(mentions.clone()))
                                .by(Some(*author))
                                .with_text(Some(text.clone())),
                        );
                    }
                }
                DomainEvent::CommentReacted {
                    task_id,
                    by,
                    comment_author,
                    ..
                } => {
                    intents.push(
                        NotificationIntent::new(
                            N::Reaction,
                            Some(*task_id),
                            Audience::Users(vec![*comment_author]),
                        )
                        .by(Some(*by)),
                    );
                }
                _ => {}
            }
        }
        intents
    }

    /// Expand intents into deliveries and audit rows.
    #[instrument(skip(self, intents, aggregate), fields(workflow_id = %aggregate.id()))]
    pub async fn plan(
        &self,
        intents: Vec<NotificationIntent>,
        aggregate: &WorkflowAggregate,
        now: DateTime<Utc>,
    ) -> WorkflowResult<DispatchPlan> {
        if intents.is_empty() {
            return Ok(DispatchPlan::default());
        }

        let groups = self.load_groups(&intents, aggregate).await?;
        let addressed: Vec<(NotificationIntent, BTreeSet<UserId>)> = intents
            .into_iter()
            .map(|intent| {
                let mut users = audience_users(&intent, aggregate, &groups);
                if intent.notification_type.excludes_author() {
                    if let Some(author) = intent.author {
                        users.remove(&author);
                    }
                }
                (intent, users)
            })
            .collect();

        let user_ids: BTreeSet<UserId> = addressed.iter().flat_map(|(_, users)| users.iter().copied()).collect();
        let profiles = self.load_profiles(user_ids.into_iter().collect()).await?;

        let workflow = &aggregate.workflow;
        let mut seen = HashSet::new();
        let mut deliveries = Vec::new();
        for (intent, users) in addressed {
            let task_id = if intent.notification_type.is_workflow_scoped() {
                None
            } else {
                intent.task_id
            };
            for user_id in users {
                let Some(profile) = profiles.get(&user_id) else {
                    continue;
                };
                if !seen.insert((intent.notification_type, user_id, task_id)) {
                    continue;
                }
                let row = intent.notification_type.is_durable().then(|| {
                    Notification::new(
                        workflow.account_id,
                        user_id,
                        workflow.id,
                        task_id,
                        intent.notification_type,
                        now,
                    )
                    .with_author(intent.author)
                    .with_text(intent.text.clone())
                });
                deliveries.push(Delivery {
                    notification_type: intent.notification_type,
                    recipient: profile.clone(),
                    workflow_id: workflow.id,
                    task_id,
                    author: intent.author,
                    text: intent.text.clone(),
                    row,
                });
            }
        }

        debug!(deliveries = deliveries.len(), "Planned notifications");
        Ok(DispatchPlan { deliveries })
    }

    /// Deliveries for audit rows that are already stored, e.g. rows the
    /// overdue reconciler just inserted.
    pub async fn plan_rows(&self, rows: Vec<Notification>) -> WorkflowResult<DispatchPlan> {
        let user_ids: BTreeSet<UserId> = rows.iter().map(|row| row.user_id).collect();
        let profiles = self.load_profiles(user_ids.into_iter().collect()).await?;

        let deliveries = rows
            .into_iter()
            .filter_map(|row| {
                let recipient = profiles.get(&row.user_id)?.clone();
                Some(Delivery {
                    notification_type: row.notification_type,
                    recipient,
                    workflow_id: row.workflow_id,
                    task_id: row.task_id,
                    author: row.author,
                    text: row.text.clone(),
                    row: Some(row),
                })
            })
            .collect();
        Ok(DispatchPlan { deliveries })
    }

    /// Send every delivery of the plan over every enabled channel.
    #[instrument(skip(self, plan, aggregate), fields(workflow_id = %aggregate.id(), deliveries = plan.len()))]
    pub async fn dispatch(
        &self,
        plan: DispatchPlan,
        aggregate: &WorkflowAggregate,
        now: DateTime<Utc>,
    ) -> DispatchReport {
        let mut report = DispatchReport {
            deliveries: plan.len(),
            ..DispatchReport::default()
        };
        let channels = self.channels.enabled_channels();
        if plan.is_empty() || channels.is_empty() {
            return report;
        }

        let mut sends = Vec::new();
        for delivery in &plan.deliveries {
            let token = self.guest_token(delivery, aggregate).await;
            let payload = Arc::new(NotificationPayload::render(
                PayloadContext {
                    notification_type: delivery.notification_type,
                    task_id: delivery.task_id,
                    author: delivery.author,
                    text: delivery.text.as_deref(),
                    guest_token: token.as_deref(),
                    frontend_url: &self.config.frontend_url,
                    now,
                },
                aggregate,
            ));

            let subscription = delivery.notification_type.subscription();
            for channel in &channels {
                if channel.honors_subscriptions()
                    && !delivery.recipient.subscriptions.allows(subscription)
                {
                    report.unsubscribed += 1;
                    continue;
                }
                sends.push(self.send(
                    Arc::clone(channel),
                    delivery.notification_type,
                    &delivery.recipient,
                    Arc::clone(&payload),
                ));
            }
        }

        for result in join_all(sends).await {
            match result {
                Ok(()) => report.sent += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(error = %error, "Notification delivery failed");
                }
            }
        }
        debug!(?report, "Dispatch finished");
        report
    }

    async fn send(
        &self,
        channel: Arc<dyn NotificationChannel>,
        notification_type: NotificationType,
        recipient: &UserProfile,
        payload: Arc<NotificationPayload>,
    ) -> Result<(), ChannelError> {
        let timeout = self.config.dispatch_timeout();
        match tokio::time::timeout(timeout, channel.send(notification_type, recipient, &payload)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                channel: channel.kind(),
                timeout_ms: self.config.dispatch_timeout_ms,
            }),
        }
    }

    async fn guest_token(&self, delivery: &Delivery, aggregate: &WorkflowAggregate) -> Option<String> {
        if !delivery.recipient.is_guest {
            return None;
        }
        let task_id = delivery.task_id?;
        match self
            .guest_auth
            .issue_token(task_id, delivery.recipient.id, aggregate.workflow.account_id)
            .await
        {
            Ok(token) => Some(token),
            Err(error) => {
                warn!(
                    %task_id,
                    user_id = delivery.recipient.id,
                    error = %error,
                    "Guest token unavailable, sending plain task link"
                );
                None
            }
        }
    }

    async fn load_groups(
        &self,
        intents: &[NotificationIntent],
        aggregate: &WorkflowAggregate,
    ) -> WorkflowResult<GroupMemberships> {
        let mut group_ids: BTreeSet<GroupId> = BTreeSet::new();
        let add_task_groups = |task_id: Uuid, group_ids: &mut BTreeSet<GroupId>| {
            if let Some(task) = aggregate.task(task_id) {
                group_ids.extend(task.active_performers().filter_map(|row| match row.performer {
                    PerformerRef::Group { group_id } => Some(group_id),
                    PerformerRef::User { .. } => None,
                }));
            }
        };
        let owner_groups = aggregate.workflow.owners.iter().filter_map(|owner| match owner {
            OwnerRef::Group { group_id } => Some(*group_id),
            OwnerRef::User { .. } => None,
        });
        let owner_groups: Vec<GroupId> = owner_groups.collect();

        for intent in intents {
            match &intent.audience {
                Audience::TaskPerformers(task_id) => add_task_groups(*task_id, &mut group_ids),
                Audience::Owners => group_ids.extend(owner_groups.iter().copied()),
                Audience::PerformersAndOwners(task_id) => {
                    add_task_groups(*task_id, &mut group_ids);
                    group_ids.extend(owner_groups.iter().copied());
                }
                Audience::Performer(PerformerRef::Group { group_id }) => {
                    group_ids.insert(*group_id);
                }
                Audience::Performer(PerformerRef::User { .. }) | Audience::Users(_) => {}
            }
        }

        if group_ids.is_empty() {
            return Ok(GroupMemberships::default());
        }
        let group_ids: Vec<GroupId> = group_ids.into_iter().collect();
        self.directory
            .group_members(&group_ids)
            .await
            .map_err(|e| WorkflowError::collaborator(services::USER_DIRECTORY, e))
    }

    /// Active profiles by id.
    async fn load_profiles(&self, user_ids: Vec<UserId>) -> WorkflowResult<HashMap<UserId, UserProfile>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let profiles = self
            .directory
            .users(&user_ids)
            .await
            .map_err(|e| WorkflowError::collaborator(services::USER_DIRECTORY, e))?;
        Ok(profiles
            .into_iter()
            .filter(|profile| profile.is_active)
            .map(|profile| (profile.id, profile))
            .collect())
    }
}

fn expand(performer: PerformerRef, groups: &GroupMemberships, into: &mut BTreeSet<UserId>) {
    match performer {
        PerformerRef::User { user_id } => {
            into.insert(user_id);
        }
        PerformerRef::Group { group_id } => into.extend(groups.members(group_id)),
    }
}

fn audience_users(
    intent: &NotificationIntent,
    aggregate: &WorkflowAggregate,
    groups: &GroupMemberships,
) -> BTreeSet<UserId> {
    let mut users = BTreeSet::new();
    let performers = |task_id: Uuid, users: &mut BTreeSet<UserId>| {
        if let Some(task) = aggregate.task(task_id) {
            for row in task.active_performers().filter(|row| !row.is_completed) {
                expand(row.performer, groups, users);
            }
        }
    };
    let owners = |users: &mut BTreeSet<UserId>| {
        for owner in &aggregate.workflow.owners {
            let performer = match *owner {
                OwnerRef::User { user_id } => PerformerRef::User { user_id },
                OwnerRef::Group { group_id } => PerformerRef::Group { group_id },
            };
            expand(performer, groups, users);
        }
    };

    match &intent.audience {
        Audience::TaskPerformers(task_id) => performers(*task_id, &mut users),
        Audience::Owners => owners(&mut users),
        Audience::PerformersAndOwners(task_id) => {
            performers(*task_id, &mut users);
            owners(&mut users);
        }
        Audience::Users(ids) => users.extend(ids.iter().copied()),
        Audience::Performer(performer) => expand(*performer, groups, &mut users),
    }
    users
}
