//! Run: one execution attempt of a task's workflow, plus its checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::model::task::TaskId;

/// One execution attempt. Reaches exactly one terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,

    /// Parent task. None for standalone runs.
    pub task_id: Option<TaskId>,

    /// Monotonic per task, no gaps. Standalone runs draw from a shared
    /// sequence instead.
    pub run_number: i32,

    pub status: RunStatus,

    /// Correlates the run to the dispatch message that started it. The
    /// uniqueness of this value is what makes run-start idempotent under
    /// redelivery.
    pub dispatch_id: Option<String>,

    /// 0..=90 while steps execute, exactly 100 once completed.
    pub progress: i32,

    pub current_step: Option<String>,

    pub is_reactivation: bool,

    /// Branch/snapshot a reactivated run resumes from.
    pub reactivation_source: Option<String>,

    /// Final output of the last step on success.
    pub result: Option<serde_json::Value>,

    /// Failure detail, or the suspension reason while suspended.
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Newtype for run IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Row allocated, dispatch published, not yet claimed.
    Started,
    /// A worker is driving steps.
    Running,
    /// Done successfully. Terminal.
    Completed,
    /// Failed terminally (business failure or exhausted retries). Terminal.
    Failed,
    /// Explicitly parked by a step; the dispatch was acknowledged and an
    /// operator re-dispatch resumes it.
    Suspended,
}

impl RunStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Started, Running)
                | (Started, Failed) // poisoned before any step ran
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Suspended)
                | (Suspended, Running) // operator re-dispatch
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Started => "started",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Suspended => "suspended",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(RunStatus::Started),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "suspended" => Ok(RunStatus::Suspended),
            other => Err(Error::Other(format!("unknown run status: {other}"))),
        }
    }
}

/// One durably-recorded unit of progress inside a run.
///
/// Re-writing the same (run, step name) updates the row in place; it never
/// duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: RunId,
    pub step_name: String,
    /// Strictly increasing per run, assigned on first write.
    pub step_order: i32,
    pub status: StepStatus,
    /// Snapshot of what went in. Size-capped; see the truncation marker.
    pub input: Option<String>,
    /// Snapshot of what came out. Size-capped likewise.
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            other => Err(Error::Other(format!("unknown step status: {other}"))),
        }
    }
}
