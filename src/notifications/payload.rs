//! Rendered content handed to every channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::due_date::humanize_due;
use crate::models::aggregate::WorkflowAggregate;
use crate::models::field::FieldSet;
use crate::models::notification::NotificationType;
use crate::models::workflow::WorkflowStarter;
use crate::models::UserId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification_type: NotificationType,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub template_name: String,
    pub starter: WorkflowStarter,
    pub task_id: Option<Uuid>,
    pub task_name: Option<String>,
    pub description_text: Option<String>,
    pub description_html: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    /// "due in 2 days" or "overdue by 3 hours", measured at render time
    pub due_in: Option<String>,
    pub is_urgent: bool,
    pub author: Option<UserId>,
    pub text: Option<String>,
    pub link: String,
}

/// Inputs of one rendered payload.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub notification_type: NotificationType,
    pub task_id: Option<Uuid>,
    pub author: Option<UserId>,
    pub text: Option<&'a str>,
    pub guest_token: Option<&'a str>,
    pub frontend_url: &'a str,
    pub now: DateTime<Utc>,
}

impl NotificationPayload {
    pub fn render(ctx: PayloadContext<'_>, aggregate: &WorkflowAggregate) -> Self {
        let workflow = &aggregate.workflow;
        let task = ctx.task_id.and_then(|id| aggregate.task(id));
        let description = task.and_then(|t| t.description.as_deref());
        let substituted = description.map(|d| substitute_fields(d, &workflow.fields));
        let due_date = task.and_then(|t| t.due_date);

        Self {
            notification_type: ctx.notification_type,
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            template_name: workflow.template_name.clone(),
            starter: workflow.starter,
            task_id: task.map(|t| t.id),
            task_name: task.map(|t| t.name.clone()),
            description_html: substituted.as_deref().map(to_html),
            description_text: substituted,
            due_date,
            due_in: due_date.map(|due| humanize_due(due, ctx.now)),
            is_urgent: workflow.is_urgent,
            author: ctx.author,
            text: ctx.text.map(str::to_string),
            link: deep_link(ctx, workflow.id),
        }
    }
}

fn deep_link(ctx: PayloadContext<'_>, workflow_id: Uuid) -> String {
    let base = ctx.frontend_url.trim_end_matches('/');
    match (ctx.task_id, ctx.guest_token) {
        _ if ctx.notification_type.is_workflow_scoped() => format!("{base}/workflows/{workflow_id}"),
        (Some(task_id), Some(token)) => format!("{base}/guest-task/{task_id}?token={token}"),
        (Some(task_id), None) => format!("{base}/tasks/{task_id}"),
        (None, _) => format!("{base}/workflows/{workflow_id}"),
    }
}

/// Replace `{{api-name}}` placeholders with formatted field values. Unknown
/// or empty fields render as nothing; unterminated braces are kept.
pub fn substitute_fields(template: &str, fields: &FieldSet) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let api_name = after[..end].trim();
                if let Some(value) = fields.value(api_name) {
                    out.push_str(&value.to_string());
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escaped HTML: blank lines separate paragraphs, single newlines become `<br>`.
pub fn to_html(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|paragraph| !paragraph.is_empty())
        .map(|paragraph| {
            let lines: Vec<String> = paragraph.lines().map(escape_html).collect();
            format!("<p>{}</p>", lines.join("<br>"))
        })
        .collect()
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
