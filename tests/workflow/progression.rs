use chrono::Duration;
use pathway_core::engine::{RunTemplate, TaskLocator};
use pathway_core::models::{PredicateOperator, WorkflowStarter};
use pathway_core::{TaskStatus, WorkflowError, WorkflowStatus};
use serde_json::json;
use std::collections::HashMap;

use crate::common::*;

fn three_step() -> pathway_core::Template {
    TemplateBuilder::new("Purchase request")
        .owner(9)
        .task(user_task("request", &[1]))
        .task(user_task("approve", &[2]))
        .task(user_task("order", &[3]))
        .build()
}

fn statuses(aggregate: &pathway_core::WorkflowAggregate) -> Vec<TaskStatus> {
    aggregate.tasks.iter().map(|t| t.status).collect()
}

#[tokio::test]
async fn test_linear_workflow_runs_to_completion() {
    let harness = TestEngine::new();
    let workflow = harness.start(three_step()).await;
    let id = workflow.id();

    assert_eq!(workflow.workflow.status, WorkflowStatus::Running);
    assert_eq!(workflow.workflow.current_task, 1);
    assert_eq!(
        statuses(&workflow),
        vec![TaskStatus::Active, TaskStatus::Pending, TaskStatus::Pending]
    );

    harness.complete(id, "request", 1).await;
    let workflow = harness.reload(id).await;
    assert_eq!(workflow.workflow.current_task, 2);
    assert_eq!(
        statuses(&workflow),
        vec![TaskStatus::Completed, TaskStatus::Active, TaskStatus::Pending]
    );

    harness.complete(id, "approve", 2).await;
    harness.complete(id, "order", 3).await;

    let workflow = harness.reload(id).await;
    assert_eq!(workflow.workflow.status, WorkflowStatus::Done);
    assert_eq!(workflow.workflow.current_task, 4);
    assert!(workflow.workflow.date_completed.is_some());
    assert!(workflow.active_tasks().next().is_none());
}

#[tokio::test]
async fn test_completion_publishes_events() {
    let harness = TestEngine::new();
    let mut events = harness.engine.publisher().subscribe();
    let workflow = harness.start(three_step()).await;

    harness.complete(workflow.id(), "request", 1).await;

    let mut names = Vec::new();
    while let Ok(published) = events.try_recv() {
        names.push(published.name);
    }
    assert_eq!(
        names,
        vec![
            "workflow.started",
            "task.activated",
            "task.performer_completed",
            "task.completed",
            "task.activated",
        ]
    );
}

#[tokio::test]
async fn test_non_performer_is_denied_and_nothing_changes() {
    let harness = TestEngine::new();
    let workflow = harness.start(three_step()).await;
    let task = harness.task(workflow.id(), "request").await;

    let result = harness
        .engine
        .complete_task(TaskLocator::Id(task.id), 5, None)
        .await;
    assert!(matches!(result, Err(WorkflowError::PerformerDenied { user_id: 5, .. })));

    let reloaded = harness.reload(workflow.id()).await;
    assert_eq!(reloaded.workflow.version, workflow.workflow.version);
    assert_eq!(reloaded.tasks[0].status, TaskStatus::Active);
}

#[tokio::test]
async fn test_repeated_completion_is_a_silent_noop() {
    let harness = TestEngine::new();
    let workflow = harness.start(three_step()).await;
    let id = workflow.id();

    harness.complete(id, "request", 1).await;
    let before = harness.reload(id).await;

    let task = harness.complete(id, "request", 1).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let after = harness.reload(id).await;
    assert_eq!(after.workflow.version, before.workflow.version);
    assert_eq!(after.workflow.current_task, 2);
}

#[tokio::test]
async fn test_locate_task_by_api_name() {
    let harness = TestEngine::new();
    let workflow = harness.start(three_step()).await;

    let task = harness
        .engine
        .complete_task(
            TaskLocator::ApiName {
                workflow_id: workflow.id(),
                api_name: "request".into(),
            },
            1,
            None,
        )
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let missing = harness
        .engine
        .complete_task(
            TaskLocator::ApiName {
                workflow_id: workflow.id(),
                api_name: "nope".into(),
            },
            1,
            None,
        )
        .await;
    assert!(matches!(missing, Err(WorkflowError::NotFound { .. })));
}

#[tokio::test]
async fn test_all_performers_must_complete() {
    let harness = TestEngine::new();
    let mut sign = user_task("sign", &[1, 2]);
    sign.require_completion_by_all = true;
    let template = TemplateBuilder::new("Contract")
        .task(sign)
        .task(user_task("archive", &[3]))
        .build();
    let workflow = harness.start(template).await;
    let id = workflow.id();

    let task = harness.complete(id, "sign", 1).await;
    assert_eq!(task.status, TaskStatus::Active);
    assert!(task.is_completed_for(1, &Default::default()));

    let task = harness.complete(id, "sign", 2).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(harness.reload(id).await.workflow.current_task, 2);
}

#[tokio::test]
async fn test_group_row_completes_when_any_member_completes() {
    let harness = TestEngine::new();
    harness.add_group(10, &[4, 5]);
    let template = TemplateBuilder::new("Support")
        .task(group_task("triage", 10))
        .task(user_task("close", &[1]))
        .build();
    let workflow = harness.start(template).await;

    let task = harness.complete(workflow.id(), "triage", 5).await;
    assert_eq!(task.status, TaskStatus::Completed);

    let denied = harness
        .engine
        .complete_task(TaskLocator::Id(task.id), 6, None)
        .await;
    assert!(matches!(denied, Err(WorkflowError::PerformerDenied { .. })));
}

#[tokio::test]
async fn test_task_without_performers_is_skipped() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Article")
        .kickoff_field(user_field("reviewer"))
        .task(user_task("draft", &[1]))
        .task(field_performer_task("review", "reviewer"))
        .task(user_task("publish", &[3]))
        .build();
    let template_id = template.id;
    let workflow = harness.start(template).await;

    harness.complete(workflow.id(), "draft", 1).await;
    let reloaded = harness.reload(workflow.id()).await;
    assert_eq!(
        statuses(&reloaded),
        vec![TaskStatus::Completed, TaskStatus::Skipped, TaskStatus::Active]
    );

    let with_reviewer = harness
        .run(
            RunTemplate::new(template_id, WorkflowStarter::User { user_id: 1 })
                .with_kickoff("reviewer", json!(2)),
        )
        .await;
    harness.complete(with_reviewer.id(), "draft", 1).await;
    let review = harness.task(with_reviewer.id(), "review").await;
    assert_eq!(review.status, TaskStatus::Active);
    assert!(review.is_performer(2, &Default::default()));
}

#[tokio::test]
async fn test_condition_skips_task() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Expense")
        .kickoff_field(number_field("amount"))
        .task(skip_when(user_task("approve", &[2]), "amount", PredicateOperator::LessThan, json!(100)))
        .task(user_task("pay", &[3]))
        .build();
    let template_id = template.id;
    harness.engine.save_template(template).await.unwrap();

    let small = harness
        .run(RunTemplate::new(template_id, WorkflowStarter::User { user_id: 1 }).with_kickoff("amount", json!(50)))
        .await;
    assert_eq!(statuses(&small), vec![TaskStatus::Skipped, TaskStatus::Active]);

    let large = harness
        .run(RunTemplate::new(template_id, WorkflowStarter::User { user_id: 1 }).with_kickoff("amount", json!(500)))
        .await;
    assert_eq!(statuses(&large), vec![TaskStatus::Active, TaskStatus::Pending]);
}

#[tokio::test]
async fn test_output_fields_are_validated_and_stored() {
    let harness = TestEngine::new();
    let mut summarize = user_task("summarize", &[1]);
    summarize.fields = vec![text_field("summary").required()];
    let template = TemplateBuilder::new("Meeting")
        .task(summarize)
        .task(user_task("file", &[2]))
        .build();
    let workflow = harness.start(template).await;
    let task = harness.task(workflow.id(), "summarize").await;

    let missing = harness
        .engine
        .complete_task(TaskLocator::Id(task.id), 1, Some(HashMap::new()))
        .await;
    match missing {
        Err(WorkflowError::FieldValidation { api_name, .. }) => assert_eq!(api_name, "summary"),
        other => panic!("expected field validation error, got {other:?}"),
    }
    assert_eq!(harness.task(workflow.id(), "summarize").await.status, TaskStatus::Active);

    let values = HashMap::from([("summary".to_string(), json!("Ship it"))]);
    harness
        .engine
        .complete_task(TaskLocator::Id(task.id), 1, Some(values))
        .await
        .unwrap();
    let reloaded = harness.reload(workflow.id()).await;
    assert_eq!(
        reloaded.workflow.fields.value("summary").map(|v| v.to_string()),
        Some("Ship it".to_string())
    );
}

#[tokio::test]
async fn test_terminate_stops_the_workflow() {
    let harness = TestEngine::new();
    let workflow = harness.start(three_step()).await;
    let id = workflow.id();

    let terminated = harness.engine.terminate(id, Some(9)).await.unwrap();
    assert_eq!(terminated.workflow.status, WorkflowStatus::Terminated);

    let again = harness.engine.terminate(id, Some(9)).await.unwrap();
    assert_eq!(again.workflow.version, terminated.workflow.version);

    let task = harness.task(id, "request").await;
    let result = harness.engine.complete_task(TaskLocator::Id(task.id), 1, None).await;
    assert!(matches!(result, Err(WorkflowError::InvalidWorkflowState { .. })));
}

#[tokio::test]
async fn test_finished_workflow_cannot_be_terminated() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("One step").task(user_task("only", &[1])).build();
    let workflow = harness.start(template).await;
    harness.complete(workflow.id(), "only", 1).await;

    let result = harness.engine.terminate(workflow.id(), Some(1)).await;
    assert!(matches!(result, Err(WorkflowError::InvalidWorkflowState { .. })));
}

#[tokio::test]
async fn test_invalid_template_is_rejected_at_save() {
    let harness = TestEngine::new();
    let empty = TemplateBuilder::new("Empty").build();
    assert!(matches!(
        harness.engine.save_template(empty).await,
        Err(WorkflowError::Configuration(_))
    ));

    let mut review = user_task("review", &[1]);
    review.revert_task = Some("review".into());
    let self_revert = TemplateBuilder::new("Loop").task(review).build();
    assert!(matches!(
        harness.engine.save_template(self_revert).await,
        Err(WorkflowError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_starter_performer_and_workflow_due_date() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Self service").task(starter_task("fill")).build();
    let template_id = template.id;
    harness.engine.save_template(template).await.unwrap();

    let due = t0() + Duration::days(7);
    let workflow = harness
        .run(
            RunTemplate::new(template_id, WorkflowStarter::User { user_id: 4 })
                .with_name("Laptop for Dana")
                .with_due_date(due)
                .urgent(),
        )
        .await;

    assert_eq!(workflow.workflow.name, "Laptop for Dana");
    assert_eq!(workflow.workflow.due_date, Some(due));
    assert!(workflow.workflow.is_urgent);
    assert!(workflow.tasks[0].is_performer(4, &Default::default()));
}

#[tokio::test]
async fn test_last_performer_cannot_be_removed() {
    use pathway_core::models::PerformerRef;

    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Pair review")
        .task(user_task("review", &[1, 2]))
        .build();
    let workflow = harness.start(template).await;
    let task = harness.task(workflow.id(), "review").await;

    let updated = harness
        .engine
        .remove_performer(task.id, 9, PerformerRef::User { user_id: 2 })
        .await
        .unwrap();
    assert!(!updated.tasks[0].is_performer(2, &Default::default()));

    let result = harness
        .engine
        .remove_performer(task.id, 9, PerformerRef::User { user_id: 1 })
        .await;
    assert!(matches!(result, Err(WorkflowError::LastPerformer { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_completions_advance_the_workflow_once() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Shared review")
        .task(user_task("review", &[1, 2]))
        .task(user_task("sign", &[3]))
        .task(user_task("file", &[4]))
        .build();
    let workflow = harness.start(template).await;
    let review = harness.task(workflow.id(), "review").await.id;
    let mut events = harness.engine.publisher().subscribe();

    let first = tokio::spawn({
        let engine = harness.engine.clone();
        async move { engine.complete_task(TaskLocator::Id(review), 1, None).await }
    });
    let second = tokio::spawn({
        let engine = harness.engine.clone();
        async move { engine.complete_task(TaskLocator::Id(review), 2, None).await }
    });
    let (first, second) = tokio::join!(first, second);
    assert!(first.unwrap().is_ok());
    assert!(second.unwrap().is_ok());

    let workflow = harness.reload(workflow.id()).await;
    assert_eq!(workflow.workflow.current_task, 2);
    assert_eq!(
        statuses(&workflow),
        vec![TaskStatus::Completed, TaskStatus::Active, TaskStatus::Pending]
    );

    let mut completed = 0;
    while let Ok(published) = events.try_recv() {
        if published.name == "task.completed" {
            completed += 1;
        }
    }
    assert_eq!(completed, 1);
}
