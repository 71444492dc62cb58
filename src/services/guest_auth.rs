//! Guest token contract.
//!
//! Guests are performers without an account session. Their notification
//! links carry a token scoped to one task.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AccountId, UserId};

#[derive(Debug, Error)]
pub enum GuestAuthError {
    #[error("Guest token issuance failed: {0}")]
    Issuance(String),
}

#[async_trait]
pub trait GuestAuthService: Send + Sync {
    async fn issue_token(
        &self,
        task_id: Uuid,
        user_id: UserId,
        account_id: AccountId,
    ) -> Result<String, GuestAuthError>;
}

/// Scope a guest token grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestGrant {
    pub task_id: Uuid,
    pub user_id: UserId,
    pub account_id: AccountId,
}

/// Issues opaque random tokens and remembers their grants in memory.
#[derive(Debug, Default)]
pub struct InMemoryGuestTokens {
    grants: DashMap<String, GuestGrant>,
}

impl InMemoryGuestTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify(&self, token: &str) -> Option<GuestGrant> {
        self.grants.get(token).map(|grant| *grant)
    }
}

#[async_trait]
impl GuestAuthService for InMemoryGuestTokens {
    async fn issue_token(
        &self,
        task_id: Uuid,
        user_id: UserId,
        account_id: AccountId,
    ) -> Result<String, GuestAuthError> {
        let token = Uuid::new_v4().simple().to_string();
        self.grants.insert(
            token.clone(),
            GuestGrant {
                task_id,
                user_id,
                account_id,
            },
        );
        Ok(token)
    }
}
