use chrono::{Duration, TimeZone, Utc};
use pathway_core::engine::RunTemplate;
use pathway_core::models::{
    DueDateAnchor, DueDateRule, FieldKind, FieldTemplate, NotificationType, WorkflowStarter,
};
use serde_json::json;

use crate::common::*;

#[tokio::test]
async fn test_workflow_start_anchor_is_set_for_pending_tasks() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Audit")
        .task(user_task("collect", &[1]))
        .task(due_after_workflow_start(user_task("report", &[2]), Duration::days(10)))
        .build();

    let workflow = harness.start(template).await;
    let report = workflow.task_by_api_name("report").unwrap();
    assert_eq!(report.due_date, Some(t0() + Duration::days(10)));
    assert!(workflow.task_by_api_name("collect").unwrap().due_date.is_none());
}

#[tokio::test]
async fn test_task_start_anchor_waits_for_activation() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Audit")
        .task(user_task("collect", &[1]))
        .task(due_after_start(user_task("report", &[2]), Duration::hours(8)))
        .build();
    let workflow = harness.start(template).await;
    assert!(workflow.task_by_api_name("report").unwrap().due_date.is_none());

    harness.advance(Duration::days(2));
    harness.complete(workflow.id(), "collect", 1).await;

    let report = harness.task(workflow.id(), "report").await;
    assert_eq!(report.due_date, Some(t0() + Duration::days(2) + Duration::hours(8)));
}

#[tokio::test]
async fn test_completion_anchor_uses_source_task() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Audit")
        .task(user_task("collect", &[1]))
        .task(user_task("review", &[2]))
        .task(due_after_completion_of(user_task("report", &[3]), "collect", Duration::days(3)))
        .build();
    let workflow = harness.start(template).await;

    harness.advance(Duration::days(1));
    harness.complete(workflow.id(), "collect", 1).await;

    let report = harness.task(workflow.id(), "report").await;
    assert_eq!(report.due_date, Some(t0() + Duration::days(4)));
}

#[tokio::test]
async fn test_field_anchor_with_calendar_months() {
    let harness = TestEngine::new();
    let mut renew = user_task("renew", &[1]);
    renew.due_date = Some(DueDateRule::new(DueDateAnchor::BeforeField, Duration::days(2)).with_source("expires"));
    let mut remind = user_task("remind", &[2]);
    remind.due_date = Some(
        DueDateRule::new(DueDateAnchor::AfterField, Duration::zero())
            .with_source("expires")
            .with_months(1),
    );
    let template = TemplateBuilder::new("Contract renewal")
        .kickoff_field(FieldTemplate::new("expires", FieldKind::Date))
        .task(renew)
        .task(remind)
        .build();
    let template_id = template.id;
    harness.engine.save_template(template).await.unwrap();

    let workflow = harness
        .run(
            RunTemplate::new(template_id, WorkflowStarter::User { user_id: 1 })
                .with_kickoff("expires", json!("2024-01-31")),
        )
        .await;

    assert_eq!(
        workflow.tasks[0].due_date,
        Some(Utc.with_ymd_and_hms(2024, 1, 29, 0, 0, 0).unwrap())
    );
    assert_eq!(
        workflow.tasks[1].due_date,
        Some(Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_manual_due_date_notifies_other_performers() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Launch")
        .task(due_after_start(user_task("plan", &[1, 2]), Duration::days(1)))
        .build();
    let workflow = harness.start(template).await;
    let plan = harness.task(workflow.id(), "plan").await;
    let due = t0() + Duration::days(5);

    let task = harness.engine.set_task_due_date(plan.id, 1, Some(due)).await.unwrap();
    assert_eq!(task.due_date, Some(due));
    assert!(task.due_date_manual);

    assert_eq!(harness.row_count(2, NotificationType::DueDateChanged).await, 1);
    assert_eq!(harness.row_count(1, NotificationType::DueDateChanged).await, 0);

    // Setting the same date again changes nothing
    let before = harness.reload(workflow.id()).await.workflow.version;
    harness.engine.set_task_due_date(plan.id, 1, Some(due)).await.unwrap();
    assert_eq!(harness.reload(workflow.id()).await.workflow.version, before);
    assert_eq!(harness.row_count(2, NotificationType::DueDateChanged).await, 1);
}

#[tokio::test]
async fn test_clearing_manual_due_date_restores_rule() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Launch")
        .task(due_after_start(user_task("plan", &[1]), Duration::days(1)))
        .build();
    let workflow = harness.start(template).await;
    let plan = harness.task(workflow.id(), "plan").await;

    harness
        .engine
        .set_task_due_date(plan.id, 1, Some(t0() + Duration::days(9)))
        .await
        .unwrap();
    let cleared = harness.engine.set_task_due_date(plan.id, 1, None).await.unwrap();

    assert!(!cleared.due_date_manual);
    assert_eq!(cleared.due_date, Some(t0() + Duration::days(1)));
}
