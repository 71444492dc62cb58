use chrono::Duration;
use pathway_core::models::NotificationType;
use pathway_core::{TaskLocator, TaskStatus, WorkflowError, WorkflowStatus};

use crate::common::*;

fn two_step() -> pathway_core::Template {
    TemplateBuilder::new("Onboarding")
        .task(due_after_start(user_task("prepare", &[1]), Duration::days(2)))
        .task(user_task("welcome", &[2]))
        .build()
}

#[tokio::test]
async fn test_timed_delay_is_resumed_by_monitor() {
    let harness = TestEngine::new();
    let workflow = harness.start(two_step()).await;
    let id = workflow.id();

    let delayed = harness.engine.delay(id, 3, Some(Duration::hours(2))).await.unwrap();
    assert_eq!(delayed.workflow.status, WorkflowStatus::Delayed);
    assert_eq!(delayed.tasks[0].status, TaskStatus::Active);
    assert_eq!(harness.row_count(1, NotificationType::DelayWorkflow).await, 1);

    let monitor = harness.delay_monitor();
    harness.advance(Duration::hours(1));
    let early = monitor.tick().await.unwrap();
    assert_eq!(early.expired, 0);
    assert_eq!(harness.reload(id).await.workflow.status, WorkflowStatus::Delayed);

    harness.advance(Duration::hours(2));
    let summary = monitor.tick().await.unwrap();
    assert_eq!(summary.expired, 1);
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.failed, 0);

    let resumed = harness.reload(id).await;
    assert_eq!(resumed.workflow.status, WorkflowStatus::Running);
    assert!(resumed.active_delay().is_none());
    assert_eq!(harness.row_count(1, NotificationType::ResumeWorkflow).await, 1);
}

#[tokio::test]
async fn test_indefinite_delay_waits_for_explicit_resume() {
    let harness = TestEngine::new();
    let workflow = harness.start(two_step()).await;
    let id = workflow.id();
    harness.engine.delay(id, 1, None).await.unwrap();

    harness.advance(Duration::days(30));
    let summary = harness.delay_monitor().tick().await.unwrap();
    assert_eq!(summary.expired, 0);
    assert_eq!(harness.reload(id).await.workflow.status, WorkflowStatus::Delayed);

    let resumed = harness.engine.resume(id, Some(1)).await.unwrap();
    assert_eq!(resumed.workflow.status, WorkflowStatus::Running);
}

#[tokio::test]
async fn test_delayed_workflow_rejects_completion_and_second_delay() {
    let harness = TestEngine::new();
    let workflow = harness.start(two_step()).await;
    let id = workflow.id();
    harness.engine.delay(id, 1, None).await.unwrap();

    let again = harness.engine.delay(id, 1, Some(Duration::hours(1))).await;
    assert!(matches!(again, Err(WorkflowError::InvalidWorkflowState { .. })));

    let task = harness.task(id, "prepare").await;
    let completion = harness.engine.complete_task(TaskLocator::Id(task.id), 1, None).await;
    assert!(matches!(completion, Err(WorkflowError::InvalidWorkflowState { .. })));
}

#[tokio::test]
async fn test_task_delay_pauses_before_activation() {
    let harness = TestEngine::new();
    let mut welcome = user_task("welcome", &[2]);
    welcome.delay = Some(Duration::days(1));
    let template = TemplateBuilder::new("Onboarding")
        .task(user_task("prepare", &[1]))
        .task(welcome)
        .build();
    let workflow = harness.start(template).await;
    let id = workflow.id();

    harness.complete(id, "prepare", 1).await;
    let paused = harness.reload(id).await;
    assert_eq!(paused.workflow.status, WorkflowStatus::Delayed);
    assert_eq!(paused.workflow.current_task, 2);
    assert_eq!(paused.tasks[1].status, TaskStatus::Pending);
    assert!(harness.push.recipients(NotificationType::NewTask).iter().all(|user| *user != 2));

    harness.advance(Duration::days(1));
    let summary = harness.delay_monitor().tick().await.unwrap();
    assert_eq!(summary.resumed, 1);

    let running = harness.reload(id).await;
    assert_eq!(running.workflow.status, WorkflowStatus::Running);
    assert_eq!(running.tasks[1].status, TaskStatus::Active);
    assert!(running.tasks[1].delay_elapsed);
    assert_eq!(harness.push.recipients(NotificationType::NewTask), vec![1, 2]);
}

#[tokio::test]
async fn test_manual_resume_shifts_task_start_due_dates() {
    let harness = TestEngine::new();
    let workflow = harness.start(two_step()).await;
    let id = workflow.id();
    assert_eq!(workflow.tasks[0].due_date, Some(t0() + Duration::days(2)));

    harness.engine.delay(id, 1, None).await.unwrap();
    harness.advance(Duration::hours(5));
    let resumed = harness.engine.resume(id, Some(1)).await.unwrap();

    assert_eq!(
        resumed.tasks[0].due_date,
        Some(t0() + Duration::days(2) + Duration::hours(5))
    );
}

#[tokio::test]
async fn test_resume_of_running_workflow_is_noop() {
    let harness = TestEngine::new();
    let workflow = harness.start(two_step()).await;

    let resumed = harness.engine.resume(workflow.id(), Some(1)).await.unwrap();
    assert_eq!(resumed.workflow.version, workflow.workflow.version);
    assert_eq!(harness.row_count(1, NotificationType::ResumeWorkflow).await, 0);
}

#[tokio::test]
async fn test_monitor_skips_while_lock_is_held() {
    use pathway_core::services::PeriodicLock;

    let harness = TestEngine::new();
    let held = harness
        .lock
        .try_acquire(pathway_core::constants::locks::DELAYED_WORKFLOWS, std::time::Duration::from_secs(60))
        .await
        .unwrap();
    assert!(held);

    let summary = harness.delay_monitor().tick().await.unwrap();
    assert!(summary.skipped);
}
