//! PostgreSQL persistence.
//!
//! Workflows, tasks and delays are stored as JSONB documents next to the
//! columns the background scans filter on. Queries are checked at runtime so
//! the crate builds without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgPool, Row, Transaction};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{ChangeSet, OverdueCandidate, PersistenceError, WorkflowStore};
use crate::models::aggregate::WorkflowAggregate;
use crate::models::delay::Delay;
use crate::models::notification::{Notification, NotificationStatus, NotificationType};
use crate::models::task::Task;
use crate::models::template::Template;
use crate::models::user::{GroupMemberships, Subscriptions, UserProfile};
use crate::models::workflow::Workflow;
use crate::models::{GroupId, UserId};
use crate::services::directory::{DirectoryError, UserDirectory};
use crate::services::lock::PeriodicLock;

#[derive(Debug, Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled migrations.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_aggregate(
        tx: &mut Transaction<'_, Postgres>,
        aggregate: &mut WorkflowAggregate,
        expected_version: Option<i64>,
    ) -> Result<(), PersistenceError> {
        let workflow_id = aggregate.id();
        match expected_version {
            Some(expected) => {
                aggregate.workflow.version = expected + 1;
                let body = serde_json::to_value(&aggregate.workflow)?;
                let updated = sqlx::query(
                    "UPDATE workflows SET status = $3, current_task = $4, template_version = $5, \
                     version = version + 1, body = $6, date_completed = $7 \
                     WHERE id = $1 AND version = $2",
                )
                .bind(workflow_id)
                .bind(expected)
                .bind(aggregate.workflow.status.to_string())
                .bind(aggregate.workflow.current_task as i32)
                .bind(aggregate.workflow.template_version)
                .bind(body)
                .bind(aggregate.workflow.date_completed)
                .execute(&mut **tx)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(PersistenceError::ConcurrentModification {
                        workflow_id,
                        expected,
                    });
                }
            }
            None => {
                let body = serde_json::to_value(&aggregate.workflow)?;
                let parent = aggregate.workflow.parent_task;
                let inserted = sqlx::query(
                    "INSERT INTO workflows (id, account_id, template_id, template_version, status, \
                     current_task, parent_workflow_id, parent_task_id, version, body, date_created, \
                     date_completed) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                     ON CONFLICT (id) DO NOTHING",
                )
                .bind(workflow_id)
                .bind(aggregate.workflow.account_id)
                .bind(aggregate.workflow.template_id)
                .bind(aggregate.workflow.template_version)
                .bind(aggregate.workflow.status.to_string())
                .bind(aggregate.workflow.current_task as i32)
                .bind(parent.map(|p| p.workflow_id))
                .bind(parent.map(|p| p.task_id))
                .bind(aggregate.workflow.version)
                .bind(body)
                .bind(aggregate.workflow.date_created)
                .bind(aggregate.workflow.date_completed)
                .execute(&mut **tx)
                .await?;
                if inserted.rows_affected() == 0 {
                    return Err(PersistenceError::Duplicate { workflow_id });
                }
            }
        }

        let task_ids: Vec<Uuid> = aggregate.tasks.iter().map(|t| t.id).collect();
        sqlx::query("DELETE FROM tasks WHERE workflow_id = $1 AND NOT (id = ANY($2))")
            .bind(workflow_id)
            .bind(&task_ids)
            .execute(&mut **tx)
            .await?;
        for task in &aggregate.tasks {
            sqlx::query(
                "INSERT INTO tasks (id, workflow_id, api_name, number, status, due_date, body) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO UPDATE SET number = EXCLUDED.number, status = EXCLUDED.status, \
                 due_date = EXCLUDED.due_date, body = EXCLUDED.body",
            )
            .bind(task.id)
            .bind(workflow_id)
            .bind(&task.api_name)
            .bind(task.number as i32)
            .bind(task.status.to_string())
            .bind(task.due_date)
            .bind(serde_json::to_value(task)?)
            .execute(&mut **tx)
            .await?;
        }

        for delay in &aggregate.delays {
            sqlx::query(
                "INSERT INTO delays (id, workflow_id, task_id, start_date, end_date, duration_seconds, body) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO UPDATE SET end_date = EXCLUDED.end_date, body = EXCLUDED.body",
            )
            .bind(delay.id)
            .bind(workflow_id)
            .bind(delay.task_id)
            .bind(delay.start_date)
            .bind(delay.end_date)
            .bind(delay.duration.map(|d| d.num_seconds()))
            .bind(serde_json::to_value(delay)?)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_notification(
        tx: &mut Transaction<'_, Postgres>,
        notification: &Notification,
    ) -> Result<bool, PersistenceError> {
        let inserted = sqlx::query(
            "INSERT INTO notifications (id, account_id, user_id, workflow_id, task_id, \
             notification_type, status, author, text, datetime) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) ON CONFLICT DO NOTHING",
        )
        .bind(notification.id)
        .bind(notification.account_id)
        .bind(notification.user_id)
        .bind(notification.workflow_id)
        .bind(notification.task_id)
        .bind(notification.notification_type.as_str())
        .bind(notification.status.to_string())
        .bind(notification.author)
        .bind(&notification.text)
        .bind(notification.datetime)
        .execute(&mut **tx)
        .await?;
        Ok(inserted.rows_affected() > 0)
    }
}

fn notification_from_row(row: &sqlx::postgres::PgRow) -> Result<Notification, PersistenceError> {
    let kind: String = row.try_get("notification_type")?;
    let status: String = row.try_get("status")?;
    Ok(Notification {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        user_id: row.try_get("user_id")?,
        workflow_id: row.try_get("workflow_id")?,
        task_id: row.try_get("task_id")?,
        notification_type: kind
            .parse::<NotificationType>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        status: status
            .parse::<NotificationStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        author: row.try_get("author")?,
        text: row.try_get("text")?,
        datetime: row.try_get("datetime")?,
    })
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn save_template(&self, template: &Template) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO templates (id, version, account_id, body) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id, version) DO UPDATE SET body = EXCLUDED.body",
        )
        .bind(template.id)
        .bind(template.version)
        .bind(template.account_id)
        .bind(serde_json::to_value(template)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_template(
        &self,
        template_id: Uuid,
        version: Option<i32>,
    ) -> Result<Template, PersistenceError> {
        let row = sqlx::query(
            "SELECT body FROM templates WHERE id = $1 AND ($2::int IS NULL OR version = $2) \
             ORDER BY version DESC LIMIT 1",
        )
        .bind(template_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PersistenceError::not_found("template", template_id))?;
        Ok(serde_json::from_value(row.try_get("body")?)?)
    }

    #[instrument(skip(self))]
    async fn load_workflow(&self, workflow_id: Uuid) -> Result<WorkflowAggregate, PersistenceError> {
        let row = sqlx::query("SELECT version, body FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::not_found("workflow", workflow_id))?;
        let mut workflow: Workflow = serde_json::from_value(row.try_get("body")?)?;
        workflow.version = row.try_get("version")?;

        let tasks = sqlx::query("SELECT body FROM tasks WHERE workflow_id = $1 ORDER BY number")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| Ok(serde_json::from_value::<Task>(row.try_get("body")?)?))
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        let delays = sqlx::query("SELECT body FROM delays WHERE workflow_id = $1 ORDER BY start_date")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| Ok(serde_json::from_value::<Delay>(row.try_get("body")?)?))
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        Ok(WorkflowAggregate {
            workflow,
            tasks,
            delays,
        })
    }

    async fn find_workflow_by_task(&self, task_id: Uuid) -> Result<Uuid, PersistenceError> {
        sqlx::query_scalar::<_, Uuid>("SELECT workflow_id FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PersistenceError::not_found("task", task_id))
    }

    async fn blocking_sub_workflows(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<(Uuid, Uuid)>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT parent_task_id, id FROM workflows \
             WHERE parent_workflow_id = $1 AND status IN ('running', 'delayed')",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok((row.try_get("parent_task_id")?, row.try_get("id")?)))
            .collect()
    }

    #[instrument(skip(self, changes), fields(writes = changes.writes.len()))]
    async fn commit(&self, changes: ChangeSet) -> Result<Vec<WorkflowAggregate>, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let mut committed = Vec::with_capacity(changes.writes.len());
        for write in changes.writes {
            let mut aggregate = write.aggregate;
            Self::write_aggregate(&mut tx, &mut aggregate, write.expected_version).await?;
            committed.push(aggregate);
        }
        for notification in &changes.notifications {
            Self::insert_notification(&mut tx, notification).await?;
        }
        tx.commit().await?;
        debug!(workflows = committed.len(), "Committed change set");
        Ok(committed)
    }

    async fn find_overdue_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OverdueCandidate>, PersistenceError> {
        // A performer row is pending while it is active, not completed and
        // has no OVERDUE row: per user for user rows, per task for groups.
        let rows = sqlx::query(
            "SELECT t.id, t.workflow_id, w.account_id, t.due_date, t.body FROM tasks t \
             JOIN workflows w ON w.id = t.workflow_id \
             WHERE t.status = 'active' AND t.due_date < $1 AND w.status = 'running' \
             AND EXISTS ( \
                 SELECT 1 FROM jsonb_array_elements(t.body->'performers') p \
                 WHERE COALESCE(p->>'directly_status', 'no_status') <> 'deleted' \
                 AND NOT COALESCE((p->>'is_completed')::boolean, false) \
                 AND NOT EXISTS ( \
                     SELECT 1 FROM notifications n \
                     WHERE n.task_id = t.id AND n.notification_type = 'overdue_task' \
                     AND (p->'performer'->>'type' = 'group' \
                          OR n.user_id = (p->'performer'->>'user_id')::bigint))) \
             ORDER BY t.due_date, t.id LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let task_ids = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut notified: HashMap<Uuid, HashSet<UserId>> = HashMap::new();
        for row in sqlx::query(
            "SELECT task_id, user_id FROM notifications \
             WHERE notification_type = 'overdue_task' AND task_id = ANY($1)",
        )
        .bind(&task_ids)
        .fetch_all(&self.pool)
        .await?
        {
            notified
                .entry(row.try_get("task_id")?)
                .or_default()
                .insert(row.try_get("user_id")?);
        }

        let none = HashSet::new();
        rows.iter()
            .map(|row| {
                let task: Task = serde_json::from_value(row.try_get("body")?)?;
                let mut candidate = OverdueCandidate {
                    workflow_id: row.try_get("workflow_id")?,
                    task_id: task.id,
                    account_id: row.try_get("account_id")?,
                    due_date: row.try_get("due_date")?,
                    performers: task
                        .active_performers()
                        .filter(|p| !p.is_completed)
                        .map(|p| p.performer)
                        .collect(),
                };
                let task_notified = notified.get(&candidate.task_id).unwrap_or(&none);
                candidate.retain_unnotified(task_notified);
                Ok(candidate)
            })
            .filter(|candidate| !matches!(candidate, Ok(c) if !c.is_pending()))
            .collect()
    }

    async fn insert_notifications_if_absent(
        &self,
        notifications: Vec<Notification>,
    ) -> Result<Vec<Notification>, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(notifications.len());
        for notification in notifications {
            if Self::insert_notification(&mut tx, &notification).await? {
                inserted.push(notification);
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn find_expired_delays(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, PersistenceError> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT d.workflow_id FROM delays d JOIN workflows w ON w.id = d.workflow_id \
             WHERE d.end_date IS NULL AND d.duration_seconds IS NOT NULL AND w.status = 'delayed' \
             AND d.start_date + make_interval(secs => d.duration_seconds) <= $1 \
             ORDER BY d.start_date LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn workflows_for_template(&self, template_id: Uuid) -> Result<Vec<Uuid>, PersistenceError> {
        Ok(sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM workflows WHERE template_id = $1 AND status IN ('running', 'delayed') \
             ORDER BY id",
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn notifications_for_user(
        &self,
        user_id: UserId,
        only_unread: bool,
    ) -> Result<Vec<Notification>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE user_id = $1 AND (NOT $2 OR status = 'new') \
             ORDER BY datetime DESC",
        )
        .bind(user_id)
        .bind(only_unread)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(notification_from_row).collect()
    }

    async fn mark_notifications_read(
        &self,
        user_id: UserId,
        notification_ids: &[Uuid],
    ) -> Result<usize, PersistenceError> {
        let result = sqlx::query(
            "UPDATE notifications SET status = 'read' \
             WHERE user_id = $1 AND status = 'new' AND id = ANY($2)",
        )
        .bind(user_id)
        .bind(notification_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

/// Periodic lock on `pg_try_advisory_lock`.
///
/// Advisory locks belong to a session, so the connection that took the lock
/// is kept until release. The TTL is not used: a crashed holder's session
/// ends and the server drops its locks.
#[derive(Debug)]
pub struct PgAdvisoryLock {
    pool: PgPool,
    held: Mutex<HashMap<String, PoolConnection<Postgres>>>,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PeriodicLock for PgAdvisoryLock {
    async fn try_acquire(&self, name: &str, _ttl: Duration) -> Result<bool, PersistenceError> {
        let mut held = self.held.lock().await;
        if held.contains_key(name) {
            return Ok(false);
        }
        let mut conn = self.pool.acquire().await?;
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            held.insert(name.to_string(), conn);
        }
        Ok(acquired)
    }

    async fn release(&self, name: &str) -> Result<(), PersistenceError> {
        let conn = self.held.lock().await.remove(name);
        let Some(mut conn) = conn else {
            return Ok(());
        };
        let unlocked = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(name)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            // The session may still hold the lock; it must not go back to the pool
            warn!(lock = name, error = %e, "Advisory unlock failed, closing connection");
            if let Err(close_err) = conn.detach().close().await {
                warn!(lock = name, error = %close_err, "Failed to close lock connection");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

/// Directory backed by the `directory_users` and `directory_group_members`
/// tables, kept in sync by the account service.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(err: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(err.to_string())
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn group_members(&self, group_ids: &[GroupId]) -> Result<GroupMemberships, DirectoryError> {
        let rows = sqlx::query(
            "SELECT group_id, user_id FROM directory_group_members WHERE group_id = ANY($1)",
        )
        .bind(group_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut memberships = GroupMemberships::default();
        for group_id in group_ids {
            memberships.insert(*group_id, std::iter::empty());
        }
        for row in rows {
            let group_id: GroupId = row.try_get("group_id").map_err(unavailable)?;
            let user_id: UserId = row.try_get("user_id").map_err(unavailable)?;
            memberships.insert(group_id, [user_id]);
        }
        Ok(memberships)
    }

    async fn users(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT id, account_id, email, first_name, last_name, is_guest, is_active, \
             subscribe_new_tasks, subscribe_complete_tasks, subscribe_comments_mentions \
             FROM directory_users WHERE id = ANY($1)",
        )
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(UserProfile {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    email: row.try_get("email")?,
                    first_name: row.try_get("first_name")?,
                    last_name: row.try_get("last_name")?,
                    is_guest: row.try_get("is_guest")?,
                    is_active: row.try_get("is_active")?,
                    subscriptions: Subscriptions {
                        new_tasks: row.try_get("subscribe_new_tasks")?,
                        complete_tasks: row.try_get("subscribe_complete_tasks")?,
                        comments_mentions: row.try_get("subscribe_comments_mentions")?,
                    },
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(unavailable)
    }
}
