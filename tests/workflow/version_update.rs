use pathway_core::TaskStatus;

use crate::common::*;

fn hiring_v1() -> pathway_core::Template {
    TemplateBuilder::new("Hiring")
        .task(user_task("screen", &[1]))
        .task(user_task("interview", &[2]))
        .task(user_task("offer", &[3]))
        .build()
}

fn statuses(aggregate: &pathway_core::WorkflowAggregate) -> Vec<(String, TaskStatus)> {
    aggregate
        .tasks
        .iter()
        .map(|t| (t.api_name.clone(), t.status))
        .collect()
}

#[tokio::test]
async fn test_running_workflows_move_to_latest_version() {
    let harness = TestEngine::new();
    let v1 = hiring_v1();
    let ahead = harness.start(v1.clone()).await;
    harness.complete(ahead.id(), "screen", 1).await;
    let behind = harness.run(pathway_core::RunTemplate::new(
        v1.id,
        pathway_core::models::WorkflowStarter::User { user_id: 1 },
    ))
    .await;
    let stopped = harness.run(pathway_core::RunTemplate::new(
        v1.id,
        pathway_core::models::WorkflowStarter::User { user_id: 1 },
    ))
    .await;
    harness.engine.terminate(stopped.id(), Some(1)).await.unwrap();

    let v2 = TemplateBuilder::next_version(&v1)
        .tasks(vec![
            user_task("intake", &[7]),
            user_task("screen", &[1]),
            user_task("interview", &[6]),
            user_task("reference", &[5]),
            user_task("offer", &[3]),
        ])
        .build();
    harness.engine.save_template(v2).await.unwrap();

    let summary = harness.engine.update_running_workflows(v1.id).await.unwrap();
    assert_eq!(summary.examined, 2);
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.failed, 0);

    let ahead = harness.reload(ahead.id()).await;
    assert_eq!(ahead.workflow.template_version, 2);
    assert_eq!(ahead.workflow.current_task, 3);
    assert_eq!(
        statuses(&ahead),
        vec![
            ("intake".to_string(), TaskStatus::Skipped),
            ("screen".to_string(), TaskStatus::Completed),
            ("interview".to_string(), TaskStatus::Active),
            ("reference".to_string(), TaskStatus::Pending),
            ("offer".to_string(), TaskStatus::Pending),
        ]
    );
    let interview = ahead.task_by_api_name("interview").unwrap();
    assert!(interview.is_performer(6, &Default::default()));
    assert!(!interview.is_performer(2, &Default::default()));

    let behind = harness.reload(behind.id()).await;
    assert_eq!(behind.workflow.current_task, 2);
    assert_eq!(behind.task_by_api_name("screen").unwrap().status, TaskStatus::Active);

    let stopped = harness.reload(stopped.id()).await;
    assert_eq!(stopped.workflow.template_version, 1);

    // The inserted task is reached in order
    harness.complete(ahead.id(), "interview", 6).await;
    assert_eq!(harness.task(ahead.id(), "reference").await.status, TaskStatus::Active);
}

#[tokio::test]
async fn test_removed_active_task_moves_workflow_forward() {
    let harness = TestEngine::new();
    let v1 = hiring_v1();
    let workflow = harness.start(v1.clone()).await;
    harness.complete(workflow.id(), "screen", 1).await;

    let v2 = TemplateBuilder::next_version(&v1)
        .tasks(vec![user_task("screen", &[1]), user_task("offer", &[3])])
        .build();
    harness.engine.save_template(v2).await.unwrap();

    let updated = harness.engine.update_workflow_version(workflow.id()).await.unwrap();
    assert_eq!(updated.tasks.len(), 2);
    assert_eq!(updated.workflow.current_task, 2);
    assert_eq!(updated.task_by_api_name("offer").unwrap().status, TaskStatus::Active);

    let again = harness.engine.update_workflow_version(workflow.id()).await.unwrap();
    assert_eq!(again.workflow.version, updated.workflow.version);
}
