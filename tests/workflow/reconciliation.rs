use chrono::Duration;
use pathway_core::config::EngineConfig;
use pathway_core::constants::locks;
use pathway_core::models::NotificationType;
use pathway_core::services::PeriodicLock;

use crate::common::*;

fn due_in_an_hour(task: pathway_core::models::TaskTemplate) -> pathway_core::Template {
    TemplateBuilder::new("Invoice approval")
        .task(due_after_start(task, Duration::hours(1)))
        .task(user_task("pay", &[3]))
        .build()
}

#[tokio::test]
async fn test_overdue_notification_is_sent_exactly_once() {
    let harness = TestEngine::new();
    harness.start(due_in_an_hour(user_task("approve", &[1, 2]))).await;
    let reconciler = harness.reconciler();

    let early = reconciler.tick().await.unwrap();
    assert_eq!(early.candidates, 0);

    harness.advance(Duration::hours(2));
    let first = reconciler.tick().await.unwrap();
    assert_eq!(first.candidates, 1);
    assert_eq!(first.inserted, 2);
    // one push and one email per user
    assert_eq!(first.sent, 4);
    assert!(!harness.lock.is_held(locks::OVERDUE_TASKS));

    let second = reconciler.tick().await.unwrap();
    assert_eq!(second.candidates, 0);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.sent, 0);

    assert_eq!(harness.row_count(1, NotificationType::OverdueTask).await, 1);
    assert_eq!(harness.row_count(2, NotificationType::OverdueTask).await, 1);
    assert_eq!(harness.push.recipients(NotificationType::OverdueTask), vec![1, 2]);
}

#[tokio::test]
async fn test_notified_tasks_do_not_fill_later_batches() {
    let mut config = EngineConfig::default();
    config.overdue.batch_size = 1;
    let harness = TestEngine::with_config(config);
    let reconciler = harness.reconciler();

    harness.start(due_in_an_hour(user_task("approve", &[1]))).await;
    harness.advance(Duration::hours(2));
    assert_eq!(reconciler.tick().await.unwrap().inserted, 1);

    // Becomes overdue after the first task was already reported
    harness.start(due_in_an_hour(user_task("approve", &[2]))).await;
    harness.advance(Duration::hours(2));
    let summary = reconciler.tick().await.unwrap();
    assert_eq!(summary.candidates, 1);
    assert_eq!(summary.inserted, 1);

    assert_eq!(reconciler.tick().await.unwrap().candidates, 0);
    assert_eq!(harness.row_count(1, NotificationType::OverdueTask).await, 1);
    assert_eq!(harness.row_count(2, NotificationType::OverdueTask).await, 1);
}

#[tokio::test]
async fn test_performer_added_after_the_scan_is_reminded() {
    let harness = TestEngine::new();
    let workflow = harness.start(due_in_an_hour(user_task("approve", &[1]))).await;
    let reconciler = harness.reconciler();
    harness.advance(Duration::hours(2));
    assert_eq!(reconciler.tick().await.unwrap().inserted, 1);

    let task = harness.task(workflow.id(), "approve").await;
    harness
        .engine
        .add_performer(task.id, 1, pathway_core::models::PerformerRef::User { user_id: 2 })
        .await
        .unwrap();

    let summary = reconciler.tick().await.unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(harness.row_count(2, NotificationType::OverdueTask).await, 1);
    assert_eq!(harness.row_count(1, NotificationType::OverdueTask).await, 1);
}

#[tokio::test]
async fn test_group_performers_are_expanded_to_active_members() {
    let harness = TestEngine::new();
    harness.add_group(10, &[4, 5, 6]);
    harness.directory.set_active(6, false);
    let mut approve = group_task("approve", 10);
    approve.performers.push(pathway_core::models::PerformerRule::User { user_id: 4 });
    harness.start(due_in_an_hour(approve)).await;

    harness.advance(Duration::hours(2));
    let summary = harness.reconciler().tick().await.unwrap();

    assert_eq!(summary.inserted, 2);
    assert_eq!(harness.push.recipients(NotificationType::OverdueTask), vec![4, 5]);
    assert_eq!(harness.row_count(6, NotificationType::OverdueTask).await, 0);
}

#[tokio::test]
async fn test_completed_performers_are_not_reminded() {
    let harness = TestEngine::new();
    let mut approve = user_task("approve", &[1, 2]);
    approve.require_completion_by_all = true;
    let workflow = harness.start(due_in_an_hour(approve)).await;
    harness.complete(workflow.id(), "approve", 1).await;

    harness.advance(Duration::hours(2));
    let summary = harness.reconciler().tick().await.unwrap();

    assert_eq!(summary.inserted, 1);
    assert_eq!(harness.row_count(1, NotificationType::OverdueTask).await, 0);
    assert_eq!(harness.row_count(2, NotificationType::OverdueTask).await, 1);
}

#[tokio::test]
async fn test_delayed_and_finished_workflows_are_not_scanned() {
    let harness = TestEngine::new();
    let delayed = harness.start(due_in_an_hour(user_task("approve", &[1]))).await;
    harness.engine.delay(delayed.id(), 1, None).await.unwrap();
    let terminated = harness.start(due_in_an_hour(user_task("approve", &[2]))).await;
    harness.engine.terminate(terminated.id(), Some(2)).await.unwrap();

    harness.advance(Duration::days(1));
    let summary = harness.reconciler().tick().await.unwrap();

    assert_eq!(summary.candidates, 0);
    assert_eq!(harness.row_count(1, NotificationType::OverdueTask).await, 0);
}

#[tokio::test]
async fn test_tick_is_skipped_while_another_instance_holds_the_lock() {
    let harness = TestEngine::new();
    harness.start(due_in_an_hour(user_task("approve", &[1]))).await;
    harness.advance(Duration::hours(2));
    assert!(harness
        .lock
        .try_acquire(locks::OVERDUE_TASKS, std::time::Duration::from_secs(60))
        .await
        .unwrap());

    let summary = harness.reconciler().tick().await.unwrap();
    assert!(summary.skipped);
    assert_eq!(harness.row_count(1, NotificationType::OverdueTask).await, 0);

    harness.lock.release(locks::OVERDUE_TASKS).await.unwrap();
    let summary = harness.reconciler().tick().await.unwrap();
    assert_eq!(summary.inserted, 1);
}
