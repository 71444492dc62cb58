//! Outbound collaborator contracts and their in-process implementations.

pub mod analytics;
pub mod directory;
pub mod field_service;
pub mod guest_auth;
pub mod lock;

pub use analytics::{AnalyticsError, AnalyticsEvent, AnalyticsService, TracingAnalytics};
pub use directory::{DirectoryError, InMemoryDirectory, UserDirectory};
pub use field_service::{FieldService, TemplateFieldService};
pub use guest_auth::{GuestAuthError, GuestAuthService, GuestGrant, InMemoryGuestTokens};
pub use lock::{InMemoryPeriodicLock, PeriodicLock};
