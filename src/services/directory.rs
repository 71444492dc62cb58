//! User directory contract.
//!
//! The engine never owns user or group records. It asks the directory for
//! group memberships when resolving who may act on a task and for profiles
//! when building notification recipients.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use crate::models::user::{GroupMemberships, UserProfile};
use crate::models::{GroupId, UserId};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("User directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Members of each requested group. Unknown groups map to no members.
    async fn group_members(&self, group_ids: &[GroupId]) -> Result<GroupMemberships, DirectoryError>;

    /// Profiles of the requested users. Unknown ids are omitted.
    async fn users(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>, DirectoryError>;
}

/// Directory held in memory, for tests and embedders that sync users
/// themselves.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<HashMap<UserId, UserProfile>>,
    groups: RwLock<HashMap<GroupId, BTreeSet<UserId>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, profile: UserProfile) {
        self.users.write().insert(profile.id, profile);
    }

    pub fn add_group(&self, group_id: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.groups
            .write()
            .entry(group_id)
            .or_default()
            .extend(members);
    }

    pub fn set_active(&self, user_id: UserId, is_active: bool) {
        if let Some(profile) = self.users.write().get_mut(&user_id) {
            profile.is_active = is_active;
        }
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn group_members(&self, group_ids: &[GroupId]) -> Result<GroupMemberships, DirectoryError> {
        let groups = self.groups.read();
        let mut memberships = GroupMemberships::default();
        for group_id in group_ids {
            let members = groups.get(group_id).cloned().unwrap_or_default();
            memberships.insert(*group_id, members);
        }
        Ok(memberships)
    }

    async fn users(&self, user_ids: &[UserId]) -> Result<Vec<UserProfile>, DirectoryError> {
        let users = self.users.read();
        Ok(user_ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_directory() {
        let directory = InMemoryDirectory::new();
        directory.add_user(UserProfile::new(1, 10, "ann@example.com"));
        directory.add_group(7, [1, 2]);

        let groups = directory.group_members(&[7, 8]).await.unwrap();
        assert!(groups.is_member(7, 2));
        assert_eq!(groups.members(8).count(), 0);

        let users = directory.users(&[1, 99]).await.unwrap();
        assert_eq!(users.len(), 1);

        directory.set_active(1, false);
        assert!(!directory.users(&[1]).await.unwrap()[0].is_active);
    }
}
