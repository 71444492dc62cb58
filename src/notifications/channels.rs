//! # Notification Channels
//!
//! Delivery is external: each channel (email, push, websocket) is an
//! implementation of [`NotificationChannel`] registered with a
//! [`ChannelRegistry`]. The dispatcher iterates the registry and never
//! branches on concrete channel types.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::payload::NotificationPayload;
use crate::config::NotificationConfig;
use crate::models::notification::NotificationType;
use crate::models::user::UserProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Push,
    WebSocket,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Push => write!(f, "push"),
            Self::WebSocket => write!(f, "websocket"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{channel} delivery failed: {reason}")]
    Delivery { channel: ChannelKind, reason: String },

    #[error("{channel} delivery timed out after {timeout_ms}ms")]
    Timeout { channel: ChannelKind, timeout_ms: u64 },
}

/// One outbound delivery mechanism.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Whether per-user subscription flags gate this channel. Only email
    /// honours them by default.
    fn honors_subscriptions(&self) -> bool {
        self.kind() == ChannelKind::Email
    }

    async fn send(
        &self,
        notification_type: NotificationType,
        recipient: &UserProfile,
        payload: &NotificationPayload,
    ) -> Result<(), ChannelError>;
}

/// Registered channels plus the per-kind feature flags.
pub struct ChannelRegistry {
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    email_enabled: bool,
    push_enabled: bool,
    websocket_enabled: bool,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<ChannelKind> = self.channels.read().iter().map(|c| c.kind()).collect();
        f.debug_struct("ChannelRegistry")
            .field("channels", &kinds)
            .field("email_enabled", &self.email_enabled)
            .field("push_enabled", &self.push_enabled)
            .field("websocket_enabled", &self.websocket_enabled)
            .finish()
    }
}

impl ChannelRegistry {
    pub fn new(config: &NotificationConfig) -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            email_enabled: config.email_enabled,
            push_enabled: config.push_enabled,
            websocket_enabled: config.websocket_enabled,
        }
    }

    pub fn register(&self, channel: Arc<dyn NotificationChannel>) {
        debug!(channel = %channel.kind(), "Registering notification channel");
        self.channels.write().push(channel);
    }

    pub fn is_enabled(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Email => self.email_enabled,
            ChannelKind::Push => self.push_enabled,
            ChannelKind::WebSocket => self.websocket_enabled,
        }
    }

    /// Registered channels whose kind is switched on.
    pub fn enabled_channels(&self) -> Vec<Arc<dyn NotificationChannel>> {
        self.channels
            .read()
            .iter()
            .filter(|channel| self.is_enabled(channel.kind()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

/// Channel that only writes a structured log line per send.
#[derive(Debug, Clone, Copy)]
pub struct TracingChannel {
    kind: ChannelKind,
}

impl TracingChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl NotificationChannel for TracingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(
        &self,
        notification_type: NotificationType,
        recipient: &UserProfile,
        payload: &NotificationPayload,
    ) -> Result<(), ChannelError> {
        info!(
            channel = %self.kind,
            notification_type = %notification_type,
            user_id = recipient.id,
            workflow_id = %payload.workflow_id,
            task_id = ?payload.task_id,
            link = %payload.link,
            "Notification sent"
        );
        Ok(())
    }
}
