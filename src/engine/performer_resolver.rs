//! Resolution of performer rules into concrete users and groups.

use crate::models::field::FieldSet;
use crate::models::task::PerformerRef;
use crate::models::template::PerformerRule;
use crate::models::workflow::WorkflowStarter;
use crate::models::UserId;

/// Turns a task template's performer rules into the performers of a task
/// instance.
///
/// Pure: it reads the supplied state only and never fails. A FIELD rule
/// whose field is empty contributes nothing; dangling field references are
/// rejected at template-save time.
#[derive(Debug, Clone, Copy)]
pub struct PerformerResolver<'a> {
    starter: &'a WorkflowStarter,
    external_user_id: UserId,
}

impl<'a> PerformerResolver<'a> {
    /// `external_user_id` stands in for the starter of externally started
    /// workflows.
    pub fn new(starter: &'a WorkflowStarter, external_user_id: UserId) -> Self {
        Self {
            starter,
            external_user_id,
        }
    }

    /// Resolved performers in rule order, without duplicates.
    pub fn resolve(&self, rules: &[PerformerRule], fields: &FieldSet) -> Vec<PerformerRef> {
        let mut resolved: Vec<PerformerRef> = Vec::with_capacity(rules.len());
        for rule in rules {
            let performer = match rule {
                PerformerRule::User { user_id } => Some(PerformerRef::User { user_id: *user_id }),
                PerformerRule::Group { group_id } => Some(PerformerRef::Group {
                    group_id: *group_id,
                }),
                PerformerRule::WorkflowStarter => Some(PerformerRef::User {
                    user_id: self.starter.user_id().unwrap_or(self.external_user_id),
                }),
                PerformerRule::Field { api_name } => fields
                    .value(api_name)
                    .and_then(|value| value.as_user())
                    .map(|user_id| PerformerRef::User { user_id }),
            };
            if let Some(performer) = performer {
                if !resolved.contains(&performer) {
                    resolved.push(performer);
                }
            }
        }
        resolved
    }
}
