//! Workflow pause windows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::serde::option_duration_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayKind {
    /// Requested by a user
    Manual,
    /// Configured on the task template; resuming starts the task
    Task,
}

/// A pause of a workflow. At most one delay of a workflow is active, i.e.
/// has no `end_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub task_id: Option<Uuid>,
    pub kind: DelayKind,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    /// `None` pauses until explicitly resumed
    #[serde(default, with = "option_duration_seconds")]
    pub duration: Option<Duration>,
}

impl Delay {
    pub fn start(
        workflow_id: Uuid,
        task_id: Option<Uuid>,
        kind: DelayKind,
        start_date: DateTime<Utc>,
        duration: Option<Duration>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            task_id,
            kind,
            start_date,
            end_date: None,
            duration,
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_date.is_none()
    }

    /// When an unresumed delay runs out, if it has a duration.
    pub fn estimated_end_date(&self) -> Option<DateTime<Utc>> {
        if self.end_date.is_some() {
            return None;
        }
        self.duration
            .and_then(|duration| self.start_date.checked_add_signed(duration))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.estimated_end_date().map(|end| end <= now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_estimated_end_date() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut delay = Delay::start(Uuid::now_v7(), None, DelayKind::Manual, start, Some(Duration::hours(3)));
        assert_eq!(
            delay.estimated_end_date(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 15, 0, 0).unwrap())
        );
        assert!(!delay.is_expired(start + Duration::hours(2)));
        assert!(delay.is_expired(start + Duration::hours(3)));

        delay.end_date = Some(start + Duration::hours(1));
        assert!(!delay.is_active());
        assert_eq!(delay.estimated_end_date(), None);
    }

    #[test]
    fn test_indefinite_delay_never_expires() {
        let start = Utc::now();
        let delay = Delay::start(Uuid::now_v7(), None, DelayKind::Manual, start, None);
        assert!(!delay.is_expired(start + Duration::days(365)));
    }
}
