//! Directory-side views of users and groups.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use super::notification::Subscription;
use super::{AccountId, GroupId, UserId};

/// Per-user notification subscription flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriptions {
    pub new_tasks: bool,
    pub complete_tasks: bool,
    pub comments_mentions: bool,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self {
            new_tasks: true,
            complete_tasks: true,
            comments_mentions: true,
        }
    }
}

impl Subscriptions {
    pub fn allows(&self, subscription: Subscription) -> bool {
        match subscription {
            Subscription::NewTasks => self.new_tasks,
            Subscription::CompleteTasks => self.complete_tasks,
            Subscription::CommentsMentions => self.comments_mentions,
            Subscription::Always => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub account_id: AccountId,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub is_guest: bool,
    #[serde(default = "active_default")]
    pub is_active: bool,
    #[serde(default)]
    pub subscriptions: Subscriptions,
}

fn active_default() -> bool {
    true
}

impl UserProfile {
    pub fn new(id: UserId, account_id: AccountId, email: impl Into<String>) -> Self {
        Self {
            id,
            account_id,
            email: email.into(),
            first_name: String::new(),
            last_name: String::new(),
            is_guest: false,
            is_active: true,
            subscriptions: Subscriptions::default(),
        }
    }

    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.first_name, self.last_name);
        let full = full.trim();
        if full.is_empty() {
            self.email.clone()
        } else {
            full.to_string()
        }
    }
}

/// Group membership snapshot loaded before a transition runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupMemberships(HashMap<GroupId, BTreeSet<UserId>>);

impl GroupMemberships {
    pub fn insert(&mut self, group_id: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.0.entry(group_id).or_default().extend(members);
    }

    pub fn is_member(&self, group_id: GroupId, user: UserId) -> bool {
        self.0
            .get(&group_id)
            .map(|members| members.contains(&user))
            .unwrap_or(false)
    }

    pub fn members(&self, group_id: GroupId) -> impl Iterator<Item = UserId> + '_ {
        self.0.get(&group_id).into_iter().flatten().copied()
    }

    pub fn contains_group(&self, group_id: GroupId) -> bool {
        self.0.contains_key(&group_id)
    }
}
