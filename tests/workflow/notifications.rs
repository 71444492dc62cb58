use pathway_core::config::EngineConfig;
use pathway_core::models::{NotificationType, Subscriptions, UserProfile};

use crate::common::*;

fn single(users: &[i64]) -> pathway_core::Template {
    TemplateBuilder::new("Vendor onboarding")
        .owner(9)
        .task(user_task("verify", users))
        .task(user_task("sign", &[3]))
        .build()
}

#[tokio::test]
async fn test_new_task_reaches_each_group_member_once() {
    let harness = TestEngine::new();
    harness.add_group(10, &[4, 5]);
    let mut triage = group_task("triage", 10);
    triage.performers.push(pathway_core::models::PerformerRule::User { user_id: 4 });
    let template = TemplateBuilder::new("Support").task(triage).build();

    harness.start(template).await;

    assert_eq!(harness.push.recipients(NotificationType::NewTask), vec![4, 5]);
    assert_eq!(harness.email.recipients(NotificationType::NewTask), vec![4, 5]);
    // NEW_TASK is not durable
    assert_eq!(harness.row_count(4, NotificationType::NewTask).await, 0);
}

#[tokio::test]
async fn test_email_honours_subscriptions() {
    let harness = TestEngine::new();
    let mut profile = UserProfile::new(2, ACCOUNT_ID, "user2@example.com");
    profile.subscriptions = Subscriptions {
        new_tasks: false,
        ..Subscriptions::default()
    };
    harness.directory.add_user(profile);

    harness.start(single(&[1, 2])).await;

    assert_eq!(harness.email.recipients(NotificationType::NewTask), vec![1]);
    assert_eq!(harness.push.recipients(NotificationType::NewTask), vec![1, 2]);
}

#[tokio::test]
async fn test_inactive_users_are_dropped() {
    let harness = TestEngine::new();
    harness.directory.set_active(2, false);

    harness.start(single(&[1, 2])).await;

    assert_eq!(harness.push.recipients(NotificationType::NewTask), vec![1]);
}

#[tokio::test]
async fn test_completion_notifies_owners() {
    let harness = TestEngine::new();
    let template = TemplateBuilder::new("Quick check")
        .owner(1)
        .owner(9)
        .task(user_task("check", &[1]))
        .build();
    let workflow = harness.start(template).await;

    harness.complete(workflow.id(), "check", 1).await;

    assert_eq!(harness.push.recipients(NotificationType::TaskCompleted), vec![9]);
    assert_eq!(harness.push.recipients(NotificationType::WorkflowCompleted), vec![1, 9]);
    let completed = harness
        .push
        .sent()
        .into_iter()
        .find(|n| n.notification_type == NotificationType::WorkflowCompleted)
        .unwrap();
    assert!(completed.payload.task_id.is_none());
    assert_eq!(
        completed.payload.link,
        format!("http://localhost:3000/workflows/{}", workflow.id())
    );
}

#[tokio::test]
async fn test_urgency_change_skips_the_actor() {
    let harness = TestEngine::new();
    let workflow = harness.start(single(&[1, 2])).await;
    let id = workflow.id();

    let urgent = harness.engine.set_urgent(id, 1, true).await.unwrap();
    assert!(urgent.workflow.is_urgent);
    assert_eq!(harness.push.recipients(NotificationType::Urgent), vec![2]);
    assert_eq!(harness.row_count(2, NotificationType::Urgent).await, 1);

    let unchanged = harness.engine.set_urgent(id, 1, true).await.unwrap();
    assert_eq!(unchanged.workflow.version, urgent.workflow.version);
    assert_eq!(harness.row_count(2, NotificationType::Urgent).await, 1);

    harness.engine.set_urgent(id, 2, false).await.unwrap();
    assert_eq!(harness.push.recipients(NotificationType::NotUrgent), vec![1]);
}

#[tokio::test]
async fn test_comments_mentions_and_reactions() {
    let harness = TestEngine::new();
    let workflow = harness.start(single(&[1, 2])).await;
    let task = harness.task(workflow.id(), "verify").await;

    harness
        .engine
        .post_comment(task.id, 2, "Tax form attached".into(), vec![7])
        .await
        .unwrap();

    assert_eq!(harness.push.recipients(NotificationType::Comment), vec![1, 9]);
    assert_eq!(harness.push.recipients(NotificationType::Mention), vec![7]);
    let rows = harness.rows_for(7).await;
    assert_eq!(rows[&NotificationType::Mention][0].text.as_deref(), Some("Tax form attached"));

    harness.engine.react(task.id, 1, 2).await.unwrap();
    assert_eq!(harness.push.recipients(NotificationType::Reaction), vec![2]);

    // Reacting to one's own comment notifies nobody
    harness.push.clear();
    harness.engine.react(task.id, 2, 2).await.unwrap();
    assert!(harness.push.recipients(NotificationType::Reaction).is_empty());
}

#[tokio::test]
async fn test_guest_performer_gets_token_link() {
    let harness = TestEngine::new();
    harness.add_guest(20);
    let workflow = harness.start(single(&[1, 20])).await;
    let task = harness.task(workflow.id(), "verify").await;

    let sent = harness.push.sent();
    let guest = sent.iter().find(|n| n.user_id == 20).unwrap();
    let member = sent.iter().find(|n| n.user_id == 1).unwrap();

    let guest_prefix = format!("http://localhost:3000/guest-task/{}?token=", task.id);
    assert!(guest.payload.link.starts_with(&guest_prefix));
    assert!(guest.payload.link.len() > guest_prefix.len());
    assert_eq!(member.payload.link, format!("http://localhost:3000/tasks/{}", task.id));
}

#[tokio::test]
async fn test_channel_failure_does_not_block_other_sends() {
    let harness = TestEngine::new();
    harness.push.fail_for(1);

    let workflow = harness.start(single(&[1, 2])).await;

    assert_eq!(harness.push.recipients(NotificationType::NewTask), vec![2]);
    assert_eq!(harness.email.recipients(NotificationType::NewTask), vec![1, 2]);
    assert_eq!(harness.reload(workflow.id()).await.tasks[0].status, pathway_core::TaskStatus::Active);
}

#[tokio::test]
async fn test_disabled_channel_sends_nothing() {
    let mut config = EngineConfig::default();
    config.notifications.push_enabled = false;
    let harness = TestEngine::with_config(config);

    harness.start(single(&[1])).await;

    assert!(harness.push.sent().is_empty());
    assert_eq!(harness.email.recipients(NotificationType::NewTask), vec![1]);
}

#[tokio::test]
async fn test_mark_notifications_read() {
    let harness = TestEngine::new();
    let workflow = harness.start(single(&[1, 2])).await;
    harness.engine.set_urgent(workflow.id(), 1, true).await.unwrap();

    let unread = harness.engine.notifications_for(2, true).await.unwrap();
    assert_eq!(unread.len(), 1);

    let marked = harness
        .engine
        .mark_notifications_read(2, &[unread[0].id])
        .await
        .unwrap();
    assert_eq!(marked, 1);
    assert!(harness.engine.notifications_for(2, true).await.unwrap().is_empty());
    assert_eq!(harness.engine.notifications_for(2, false).await.unwrap().len(), 1);

    // Other users cannot mark someone else's rows
    assert_eq!(
        harness.engine.mark_notifications_read(1, &[unread[0].id]).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn test_added_performer_is_told_about_the_task() {
    let harness = TestEngine::new();
    let workflow = harness.start(single(&[1])).await;
    let task = harness.task(workflow.id(), "verify").await;
    harness.push.clear();

    let updated = harness
        .engine
        .add_performer(task.id, 9, pathway_core::models::PerformerRef::User { user_id: 6 })
        .await
        .unwrap();

    assert!(updated.tasks[0].is_performer(6, &Default::default()));
    assert_eq!(harness.push.recipients(NotificationType::NewTask), vec![6]);
}
