use pathway_core::engine::RunTemplate;
use pathway_core::models::WorkflowStarter;
use pathway_core::{TaskStatus, WorkflowError, WorkflowStatus};

use crate::common::*;

struct Family {
    harness: TestEngine,
    parent_id: uuid::Uuid,
    order_task: uuid::Uuid,
    child_template: uuid::Uuid,
}

async fn family() -> Family {
    let harness = TestEngine::new();
    let parent = TemplateBuilder::new("Hardware order")
        .task(user_task("order", &[1, 2]))
        .task(user_task("ship", &[3]))
        .build();
    let parent = harness.start(parent).await;
    let order_task = harness.task(parent.id(), "order").await.id;

    let child = TemplateBuilder::new("Vendor quote")
        .task(user_task("quote", &[4]))
        .build();
    let child_template = child.id;
    harness.engine.save_template(child).await.unwrap();

    Family {
        parent_id: parent.id(),
        order_task,
        child_template,
        harness,
    }
}

fn child_request(family: &Family, user_id: i64) -> RunTemplate {
    RunTemplate::new(family.child_template, WorkflowStarter::User { user_id })
        .with_parent_task(family.order_task)
}

#[tokio::test]
async fn test_parent_task_waits_for_running_sub_workflow() {
    let family = family().await;
    let harness = &family.harness;
    let child = harness.run(child_request(&family, 2)).await;
    assert_eq!(
        child.workflow.parent_task.map(|p| p.task_id),
        Some(family.order_task)
    );

    let order = harness.complete(family.parent_id, "order", 2).await;
    assert_eq!(order.status, TaskStatus::Active);
    assert!(order.is_completed_for(2, &Default::default()));

    harness.complete(child.id(), "quote", 4).await;

    assert_eq!(harness.reload(child.id()).await.workflow.status, WorkflowStatus::Done);
    let parent = harness.reload(family.parent_id).await;
    assert_eq!(parent.tasks[0].status, TaskStatus::Completed);
    assert_eq!(parent.tasks[1].status, TaskStatus::Active);
}

#[tokio::test]
async fn test_finished_sub_workflow_without_parent_completion_changes_nothing() {
    let family = family().await;
    let harness = &family.harness;
    let child = harness.run(child_request(&family, 1)).await;
    let before = harness.reload(family.parent_id).await;

    harness.complete(child.id(), "quote", 4).await;

    let after = harness.reload(family.parent_id).await;
    assert_eq!(after.workflow.version, before.workflow.version);
    assert_eq!(after.tasks[0].status, TaskStatus::Active);

    // Nothing blocks the task any more
    let order = harness.complete(family.parent_id, "order", 1).await;
    assert_eq!(order.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_terminated_sub_workflow_releases_parent() {
    let family = family().await;
    let harness = &family.harness;
    let child = harness.run(child_request(&family, 1)).await;
    harness.complete(family.parent_id, "order", 1).await;

    harness.engine.terminate(child.id(), Some(1)).await.unwrap();

    let parent = harness.reload(family.parent_id).await;
    assert_eq!(parent.tasks[0].status, TaskStatus::Completed);
    assert_eq!(parent.workflow.current_task, 2);
}

#[tokio::test]
async fn test_only_active_performers_start_sub_workflows() {
    let family = family().await;
    let harness = &family.harness;

    let stranger = harness.engine.run_template(child_request(&family, 5)).await;
    assert!(matches!(stranger, Err(WorkflowError::PerformerDenied { user_id: 5, .. })));

    let external = harness
        .engine
        .run_template(
            RunTemplate::new(family.child_template, WorkflowStarter::External)
                .with_parent_task(family.order_task),
        )
        .await;
    assert!(matches!(external, Err(WorkflowError::PerformerDenied { .. })));

    let ship = harness.task(family.parent_id, "ship").await;
    let pending = harness
        .engine
        .run_template(
            RunTemplate::new(family.child_template, WorkflowStarter::User { user_id: 3 })
                .with_parent_task(ship.id),
        )
        .await;
    assert!(matches!(pending, Err(WorkflowError::InvalidTaskState { .. })));
}
