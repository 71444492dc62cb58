//! # Notifications
//!
//! Decides whom to notify about a transition and hands the rendered payload
//! to the registered delivery channels.

pub mod channels;
pub mod dispatcher;
pub mod payload;

pub use channels::{ChannelError, ChannelKind, ChannelRegistry, NotificationChannel, TracingChannel};
pub use dispatcher::{
    Audience, Delivery, DispatchPlan, DispatchReport, NotificationDispatcher, NotificationIntent,
};
pub use payload::NotificationPayload;
