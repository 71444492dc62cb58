use pathway_core::models::NotificationType;
use pathway_core::{TaskStatus, WorkflowError, WorkflowStatus};

use crate::common::*;

fn review_chain() -> pathway_core::Template {
    TemplateBuilder::new("Design review")
        .owner(9)
        .task(user_task("draft", &[1]))
        .task(user_task("review", &[2]))
        .task(user_task("approve", &[3]))
        .build()
}

#[tokio::test]
async fn test_revert_returns_to_previous_task() {
    let harness = TestEngine::new();
    let workflow = harness.start(review_chain()).await;
    let id = workflow.id();
    harness.complete(id, "draft", 1).await;
    let review = harness.task(id, "review").await;

    let reverted = harness
        .engine
        .revert(id, review.id, 2, Some("Needs sources".into()))
        .await
        .unwrap();

    assert_eq!(reverted.workflow.status, WorkflowStatus::Running);
    assert_eq!(reverted.workflow.current_task, 1);
    let draft = reverted.task_by_api_name("draft").unwrap();
    assert_eq!(draft.status, TaskStatus::Active);
    assert!(!draft.is_completed_for(1, &Default::default()));
    assert_eq!(reverted.task_by_api_name("review").unwrap().status, TaskStatus::Pending);

    let rows = harness.rows_for(1).await;
    let returned = &rows[&NotificationType::ReturnTask];
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].author, Some(2));
    assert_eq!(returned[0].text.as_deref(), Some("Needs sources"));
    assert_eq!(harness.row_count(2, NotificationType::ReturnTask).await, 0);

    // The workflow moves forward again from the reverted task
    harness.complete(id, "draft", 1).await;
    assert_eq!(harness.task(id, "review").await.status, TaskStatus::Active);
}

#[tokio::test]
async fn test_configured_revert_task_resets_everything_in_between() {
    let harness = TestEngine::new();
    let mut approve = user_task("approve", &[3]);
    approve.revert_task = Some("draft".into());
    let template = TemplateBuilder::new("Design review")
        .task(user_task("draft", &[1]))
        .task(user_task("review", &[2]))
        .task(approve)
        .build();
    let workflow = harness.start(template).await;
    let id = workflow.id();
    harness.complete(id, "draft", 1).await;
    harness.complete(id, "review", 2).await;
    let approve = harness.task(id, "approve").await;

    let reverted = harness.engine.revert(id, approve.id, 3, None).await.unwrap();

    let statuses: Vec<TaskStatus> = reverted.tasks.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![TaskStatus::Active, TaskStatus::Pending, TaskStatus::Pending]
    );
    assert_eq!(reverted.workflow.current_task, 1);
}

#[tokio::test]
async fn test_revert_from_first_task_is_rejected() {
    let harness = TestEngine::new();
    let workflow = harness.start(review_chain()).await;
    let draft = harness.task(workflow.id(), "draft").await;

    let result = harness.engine.revert(workflow.id(), draft.id, 1, None).await;
    assert!(matches!(result, Err(WorkflowError::InvalidRevertTarget { .. })));

    let reloaded = harness.reload(workflow.id()).await;
    assert_eq!(reloaded.workflow.version, workflow.workflow.version);
}

#[tokio::test]
async fn test_revert_requires_performer_or_owner() {
    let harness = TestEngine::new();
    let workflow = harness.start(review_chain()).await;
    let id = workflow.id();
    harness.complete(id, "draft", 1).await;
    let review = harness.task(id, "review").await;

    let stranger = harness.engine.revert(id, review.id, 5, None).await;
    assert!(matches!(stranger, Err(WorkflowError::PerformerDenied { user_id: 5, .. })));

    let by_owner = harness.engine.revert(id, review.id, 9, None).await.unwrap();
    assert_eq!(by_owner.workflow.current_task, 1);
}
