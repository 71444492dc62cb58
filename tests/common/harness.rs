//! In-memory engine harness: store, directory, manual clock and recording
//! channels wired into one [`WorkflowEngine`].

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use pathway_core::config::EngineConfig;
use pathway_core::engine::{DelayMonitor, ManualClock, OverdueReconciler, RunTemplate, WorkflowEngine};
use pathway_core::models::{
    Notification, NotificationType, Task, Template, UserProfile, WorkflowAggregate, WorkflowStarter,
};
use pathway_core::notifications::{ChannelError, ChannelKind, NotificationChannel, NotificationPayload};
use pathway_core::services::{InMemoryDirectory, InMemoryGuestTokens, InMemoryPeriodicLock};
use pathway_core::store::{InMemoryWorkflowStore, WorkflowStore};
use uuid::Uuid;

use super::builders::ACCOUNT_ID;

/// Monday 2024-01-15 09:00 UTC, the start of every test clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
}

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub channel: ChannelKind,
    pub notification_type: NotificationType,
    pub user_id: i64,
    pub payload: NotificationPayload,
}

/// Channel that records every send and can be told to fail for one user.
pub struct RecordingChannel {
    kind: ChannelKind,
    sent: Mutex<Vec<SentNotification>>,
    failing_user: Mutex<Option<i64>>,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            sent: Mutex::new(Vec::new()),
            failing_user: Mutex::new(None),
        })
    }

    pub fn fail_for(&self, user_id: i64) {
        *self.failing_user.lock() = Some(user_id);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    /// Recipients of one notification type, sorted.
    pub fn recipients(&self, notification_type: NotificationType) -> Vec<i64> {
        let mut users: Vec<i64> = self
            .sent
            .lock()
            .iter()
            .filter(|n| n.notification_type == notification_type)
            .map(|n| n.user_id)
            .collect();
        users.sort();
        users
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        notification_type: NotificationType,
        recipient: &UserProfile,
        payload: &NotificationPayload,
    ) -> Result<(), ChannelError> {
        if *self.failing_user.lock() == Some(recipient.id) {
            return Err(ChannelError::Delivery {
                channel: self.kind,
                reason: "mailbox unavailable".to_string(),
            });
        }
        self.sent.lock().push(SentNotification {
            channel: self.kind,
            notification_type,
            user_id: recipient.id,
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Engine plus every collaborator a test may want to poke at.
pub struct TestEngine {
    pub engine: Arc<WorkflowEngine>,
    pub store: Arc<InMemoryWorkflowStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub clock: Arc<ManualClock>,
    pub push: Arc<RecordingChannel>,
    pub email: Arc<RecordingChannel>,
    pub lock: Arc<InMemoryPeriodicLock>,
    pub config: Arc<EngineConfig>,
}

impl TestEngine {
    /// Users 1 through 9 exist and are active.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(InMemoryWorkflowStore::new());
        let directory = Arc::new(InMemoryDirectory::new());
        for user_id in 1..=9 {
            directory.add_user(UserProfile::new(user_id, ACCOUNT_ID, format!("user{user_id}@example.com")));
        }
        let clock = Arc::new(ManualClock::new(t0()));
        let push = RecordingChannel::new(ChannelKind::Push);
        let email = RecordingChannel::new(ChannelKind::Email);

        let engine = WorkflowEngine::builder(config.clone(), store.clone())
            .directory(directory.clone())
            .guest_auth(Arc::new(InMemoryGuestTokens::new()))
            .clock(clock.clone())
            .channel(push.clone())
            .channel(email.clone())
            .build();

        Self {
            engine: Arc::new(engine),
            store,
            directory,
            clock,
            push,
            email,
            lock: Arc::new(InMemoryPeriodicLock::new()),
            config,
        }
    }

    pub fn add_group(&self, group_id: i64, members: &[i64]) {
        self.directory.add_group(group_id, members.iter().copied());
    }

    pub fn add_guest(&self, user_id: i64) {
        let mut profile = UserProfile::new(user_id, ACCOUNT_ID, format!("guest{user_id}@example.com"));
        profile.is_guest = true;
        self.directory.add_user(profile);
    }

    pub fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    /// Save `template` and run it as user 1 with an empty kickoff.
    pub async fn start(&self, template: Template) -> WorkflowAggregate {
        let template_id = template.id;
        self.engine.save_template(template).await.expect("template is valid");
        self.engine
            .run_template(RunTemplate::new(template_id, WorkflowStarter::User { user_id: 1 }))
            .await
            .expect("workflow starts")
    }

    pub async fn run(&self, request: RunTemplate) -> WorkflowAggregate {
        self.engine.run_template(request).await.expect("workflow starts")
    }

    pub async fn reload(&self, workflow_id: Uuid) -> WorkflowAggregate {
        self.store.load_workflow(workflow_id).await.expect("workflow exists")
    }

    pub async fn task(&self, workflow_id: Uuid, api_name: &str) -> Task {
        self.reload(workflow_id)
            .await
            .task_by_api_name(api_name)
            .cloned()
            .expect("task exists")
    }

    pub async fn complete(&self, workflow_id: Uuid, api_name: &str, user: i64) -> Task {
        let task = self.task(workflow_id, api_name).await;
        self.engine
            .complete_task(pathway_core::TaskLocator::Id(task.id), user, None)
            .await
            .expect("task completes")
    }

    pub fn reconciler(&self) -> OverdueReconciler {
        OverdueReconciler::new(
            self.config.overdue.clone(),
            self.store.clone(),
            self.directory.clone(),
            self.engine.dispatcher().clone(),
            self.lock.clone(),
            self.clock.clone(),
        )
    }

    pub fn delay_monitor(&self) -> DelayMonitor {
        DelayMonitor::new(self.config.delays.clone(), self.engine.clone(), self.lock.clone())
    }

    /// Stored notification rows of `user`, grouped by type.
    pub async fn rows_for(&self, user_id: i64) -> HashMap<NotificationType, Vec<Notification>> {
        let mut by_type: HashMap<NotificationType, Vec<Notification>> = HashMap::new();
        for row in self.engine.notifications_for(user_id, false).await.expect("rows load") {
            by_type.entry(row.notification_type).or_default().push(row);
        }
        by_type
    }

    pub async fn row_count(&self, user_id: i64, notification_type: NotificationType) -> usize {
        self.rows_for(user_id)
            .await
            .get(&notification_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
