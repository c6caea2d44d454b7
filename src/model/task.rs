//! Task: durable record of one upstream work item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::model::run::RunId;

/// One upstream work item, tracked across its whole lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Upstream identifier. Unique; the anchor that collapses concurrent
    /// creates onto one row.
    pub external_id: String,

    pub title: String,
    pub description: String,

    /// Where produced changes land (branch, snapshot, document id).
    pub target_ref: Option<String>,

    pub priority: i32,

    /// Status as the upstream system last reported it. Opaque to us beyond
    /// the active/terminal distinction used for reactivation.
    pub upstream_status: Option<String>,

    /// Internal lifecycle status.
    pub status: TaskStatus,

    /// How many times a terminal task has been reopened.
    pub reactivation_count: i32,

    pub last_run_id: Option<RunId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no run accepted yet.
    Pending,
    /// At least one run accepted and not yet retired.
    Processing,
    /// Last run finished successfully. Terminal until reactivated.
    Completed,
    /// Last run failed terminally. Terminal until reactivated.
    Failed,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    ///
    /// Reactivation is the one sanctioned move out of a terminal state.
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Processing) // reactivation
                | (Failed, Processing) // reactivation
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::Other(format!("unknown task status: {other}"))),
        }
    }
}
