//! Dispatch: the bridge from an accepted triage decision to the work lane.

pub mod retry;

use crate::config::LaneConfig;
use crate::db::Db;
use crate::db::lanes::DISPATCH_CHANNEL;
use crate::error::Result;
use crate::model::run::RunId;
use crate::model::task::Task;
use serde::{Deserialize, Serialize};

/// Message published to the work lane and consumed by the executor.
///
/// `task_snapshot` is a point-in-time copy; the executor re-fetches
/// authoritative state for anything beyond routing and display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub run_id: RunId,
    /// Routing key: which registered workflow executes this run.
    pub workflow: String,
    pub task_snapshot: Option<Task>,
    pub is_reactivation: bool,
    /// The trigger text (comment body or status note) for a reactivation.
    pub reactivation_context: Option<String>,
    pub priority: i32,
    /// Delivery attempt, 1-based. Incremented on every backoff re-enqueue.
    pub attempt: u32,
}

/// Publish a dispatch to a lane, clamping priority to the lane ceiling,
/// and wake sleeping consumers. Returns the queue message id.
pub async fn publish(
    db: &Db,
    lane: &LaneConfig,
    message: &DispatchMessage,
    delay_seconds: i32,
) -> Result<i64> {
    let mut message = message.clone();
    message.priority = message.priority.min(lane.max_priority);

    let payload = serde_json::to_value(&message)?;
    let msg_id = db.send_to_lane(&lane.name, &payload, delay_seconds).await?;
    db.notify_channel(DISPATCH_CHANNEL, &message.workflow).await?;
    Ok(msg_id)
}
