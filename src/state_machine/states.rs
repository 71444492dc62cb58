use serde::{Deserialize, Serialize};
use std::fmt;

/// Workflow lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// A task is active or about to be activated
    #[default]
    Running,
    /// Paused; no task activation and no overdue scanning
    Delayed,
    /// Moved past the last task
    Done,
    /// Stopped by a user
    Terminated,
}

impl WorkflowStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Terminated)
    }

    /// Whether the workflow still accepts user actions on its tasks
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Running | Self::Delayed)
    }

    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        match self {
            Self::Running => true,
            Self::Delayed => matches!(to, Self::Running | Self::Terminated | Self::Delayed),
            Self::Done | Self::Terminated => false,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Delayed => write!(f, "delayed"),
            Self::Done => write!(f, "done"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "delayed" => Ok(Self::Delayed),
            "done" => Ok(Self::Done),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid workflow status: {s}")),
        }
    }
}

/// Task instance states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Not reached yet, or reset by a revert
    #[default]
    Pending,
    /// The workflow's current task
    Active,
    Completed,
    /// Passed over because of a condition or a lack of performers
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        match (self, to) {
            (Self::Pending, Self::Active | Self::Skipped) => true,
            (Self::Active, Self::Completed | Self::Skipped) => true,
            // Revert and version updates send tasks back
            (_, Self::Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}
