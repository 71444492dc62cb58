//! # Overdue Reconciler
//!
//! Periodic scan for active tasks past their due date. Each tick runs under
//! the cluster-wide `overdue_tasks` lock, inserts one OVERDUE notification
//! row per (task, user) and dispatches only the rows the store actually
//! inserted. A row that already exists is never sent again, so overlapping
//! ticks and restarts cannot produce duplicates.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::clock::Clock;
use crate::config::ReconcilerConfig;
use crate::constants::{locks, services};
use crate::error::{WorkflowError, WorkflowResult};
use crate::logging::log_reconciliation;
use crate::models::notification::{Notification, NotificationType};
use crate::models::task::PerformerRef;
use crate::models::{GroupId, UserId};
use crate::notifications::NotificationDispatcher;
use crate::services::directory::UserDirectory;
use crate::services::lock::PeriodicLock;
use crate::store::{OverdueCandidate, WorkflowStore};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Another instance held the lock; nothing was examined
    pub skipped: bool,
    pub candidates: usize,
    pub inserted: usize,
    pub sent: usize,
    pub failed: usize,
}

pub struct OverdueReconciler {
    config: ReconcilerConfig,
    store: Arc<dyn WorkflowStore>,
    directory: Arc<dyn UserDirectory>,
    dispatcher: Arc<NotificationDispatcher>,
    lock: Arc<dyn PeriodicLock>,
    clock: Arc<dyn Clock>,
}

impl OverdueReconciler {
    pub fn new(
        config: ReconcilerConfig,
        store: Arc<dyn WorkflowStore>,
        directory: Arc<dyn UserDirectory>,
        dispatcher: Arc<NotificationDispatcher>,
        lock: Arc<dyn PeriodicLock>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            directory,
            dispatcher,
            lock,
            clock,
        }
    }

    /// Run one reconciliation pass.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> WorkflowResult<ReconcileSummary> {
        if !self
            .lock
            .try_acquire(locks::OVERDUE_TASKS, self.config.lock_ttl())
            .await?
        {
            debug!("Overdue scan already running elsewhere");
            return Ok(ReconcileSummary {
                skipped: true,
                ..ReconcileSummary::default()
            });
        }

        let result = self.reconcile().await;
        if let Err(e) = self.lock.release(locks::OVERDUE_TASKS).await {
            warn!(error = %e, "Failed to release overdue lock");
        }

        let summary = result?;
        log_reconciliation(
            "overdue_reconciler",
            summary.candidates,
            summary.inserted,
            (summary.failed > 0)
                .then(|| format!("{} deliveries failed", summary.failed))
                .as_deref(),
        );
        Ok(summary)
    }

    async fn reconcile(&self) -> WorkflowResult<ReconcileSummary> {
        let now = self.clock.now();
        let candidates = self
            .store
            .find_overdue_candidates(now, self.config.batch_size)
            .await?;
        let mut summary = ReconcileSummary {
            candidates: candidates.len(),
            ..ReconcileSummary::default()
        };
        if candidates.is_empty() {
            return Ok(summary);
        }

        let rows = self.overdue_rows(&candidates, now).await?;
        let inserted = self.store.insert_notifications_if_absent(rows).await?;
        summary.inserted = inserted.len();

        let mut by_workflow: BTreeMap<Uuid, Vec<Notification>> = BTreeMap::new();
        for row in inserted {
            by_workflow.entry(row.workflow_id).or_default().push(row);
        }

        for (workflow_id, rows) in by_workflow {
            // Rows are stored; a failure from here on only loses delivery.
            let aggregate = match self.store.load_workflow(workflow_id).await {
                Ok(aggregate) => aggregate,
                Err(e) => {
                    warn!(%workflow_id, error = %e, "Overdue workflow vanished before dispatch");
                    summary.failed += rows.len();
                    continue;
                }
            };
            let plan = match self.dispatcher.plan_rows(rows).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(%workflow_id, error = %e, "Could not plan overdue deliveries");
                    continue;
                }
            };
            let report = self.dispatcher.dispatch(plan, &aggregate, now).await;
            summary.sent += report.sent;
            summary.failed += report.failed;
        }

        Ok(summary)
    }

    /// One OVERDUE row per (task, active user), groups expanded.
    async fn overdue_rows(
        &self,
        candidates: &[OverdueCandidate],
        now: DateTime<Utc>,
    ) -> WorkflowResult<Vec<Notification>> {
        let group_ids: Vec<GroupId> = candidates
            .iter()
            .flat_map(|c| c.performers.iter())
            .filter_map(|p| match p {
                PerformerRef::Group { group_id } => Some(*group_id),
                PerformerRef::User { .. } => None,
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let groups = if group_ids.is_empty() {
            Default::default()
        } else {
            self.directory
                .group_members(&group_ids)
                .await
                .map_err(|e| WorkflowError::collaborator(services::USER_DIRECTORY, e))?
        };

        let mut pairs: Vec<(&OverdueCandidate, UserId)> = Vec::new();
        let mut seen = BTreeSet::new();
        for candidate in candidates {
            for performer in &candidate.performers {
                let users: Vec<UserId> = match performer {
                    PerformerRef::User { user_id } => vec![*user_id],
                    PerformerRef::Group { group_id } => groups.members(*group_id).collect(),
                };
                for user_id in users {
                    if seen.insert((candidate.task_id, user_id)) {
                        pairs.push((candidate, user_id));
                    }
                }
            }
        }

        let user_ids: Vec<UserId> = pairs
            .iter()
            .map(|(_, user)| *user)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let active: HashMap<UserId, bool> = self
            .directory
            .users(&user_ids)
            .await
            .map_err(|e| WorkflowError::collaborator(services::USER_DIRECTORY, e))?
            .into_iter()
            .map(|profile| (profile.id, profile.is_active))
            .collect();

        Ok(pairs
            .into_iter()
            .filter(|(_, user)| active.get(user).copied().unwrap_or(false))
            .map(|(candidate, user_id)| {
                Notification::new(
                    candidate.account_id,
                    user_id,
                    candidate.workflow_id,
                    Some(candidate.task_id),
                    NotificationType::OverdueTask,
                    now,
                )
            })
            .collect())
    }

    /// Tick every interval until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Overdue reconciler disabled");
            return;
        }
        info!(interval_seconds = self.config.interval_seconds, "Starting overdue reconciler");

        while !*shutdown.borrow() {
            if let Err(e) = self.tick().await {
                error!(error = %e, "Overdue reconciliation failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {},
                changed = shutdown.changed() => {
                    debug!("Shutdown notification received");
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Overdue reconciler stopped");
    }
}
