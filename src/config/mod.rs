//! # Configuration
//!
//! Immutable engine settings. [`ConfigManager`] loads them once from TOML
//! files and `PATHWAY__*` environment variables; the resulting
//! `Arc<EngineConfig>` is handed to the engine, the notification dispatcher
//! and the background services.
//!
//! ```toml
//! [notifications]
//! frontend_url = "https://app.example.com"
//! push_enabled = false
//!
//! [overdue]
//! interval_seconds = 30
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::logging::LogFormat;
use crate::models::UserId;

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSettings,
    pub notifications: NotificationConfig,
    pub overdue: ReconcilerConfig,
    pub delays: ReconcilerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Performer id standing in for the starter of externally started workflows
    pub external_user_id: UserId,
    /// Retries of an operation that lost an optimistic version check
    pub max_conflict_retries: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            external_user_id: -1,
            max_conflict_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Base URL of the web application used in deep links
    pub frontend_url: String,
    pub email_enabled: bool,
    pub push_enabled: bool,
    pub websocket_enabled: bool,
    /// Upper bound of one channel send
    pub dispatch_timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            frontend_url: "http://localhost:3000".to_string(),
            email_enabled: true,
            push_enabled: true,
            websocket_enabled: true,
            dispatch_timeout_ms: 5_000,
        }
    }
}

impl NotificationConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

/// Settings of a periodic, lock-guarded background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// Maximum rows examined per tick
    pub batch_size: usize,
    pub lock_ttl_seconds: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            batch_size: 500,
            lock_ttl_seconds: 300,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/pathway_development".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overrides the environment's default console format
    pub format: Option<LogFormat>,
}

impl EngineConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let frontend_url = &self.notifications.frontend_url;
        if frontend_url.is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "notifications.frontend_url",
                "notification configuration",
            ));
        }
        if !(frontend_url.starts_with("http://") || frontend_url.starts_with("https://")) {
            return Err(ConfigurationError::invalid_value(
                "notifications.frontend_url",
                frontend_url.clone(),
                "must be an http(s) URL",
            ));
        }
        if self.notifications.dispatch_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "notifications.dispatch_timeout_ms",
                "0",
                "dispatch timeout must be greater than 0",
            ));
        }

        for (section, job) in [("overdue", &self.overdue), ("delays", &self.delays)] {
            if job.interval_seconds == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("{section}.interval_seconds"),
                    "0",
                    "interval must be greater than 0",
                ));
            }
            if job.batch_size == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("{section}.batch_size"),
                    "0",
                    "batch size must be greater than 0",
                ));
            }
        }

        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }
        Ok(())
    }
}
