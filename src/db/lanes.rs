//! Queue lanes via pgmq and direct SQLx.
//!
//! A lane is a pgmq queue with an orchestrator-level contract on top: a
//! priority ceiling, a message TTL enforced at read time, delayed sends
//! for backoff, and a reserved dead-letter lane whose entries are only
//! ever consumed by an explicit replay. Calls pgmq's SQL functions:
//! pgmq.create, pgmq.send, pgmq.read, pgmq.archive, pgmq.delete.
//!
//! Late acknowledgement is the visibility timeout: a message read but not
//! archived reappears after `vt` — a worker crash mid-execution causes
//! automatic redelivery.

use crate::config::LaneConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Channel notified when a dispatch lands on the work lane.
pub const DISPATCH_CHANNEL: &str = "dispatch_ready";
/// Channel notified when a notification lands on the ingress lane.
pub const INGRESS_CHANNEL: &str = "ingress_ready";

/// A message read from a lane.
#[derive(Debug, Clone)]
pub struct LaneMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl LaneMessage {
    /// True if the message outlived its lane's TTL and must not execute.
    pub fn is_expired(&self, lane: &LaneConfig) -> bool {
        let age = chrono::Utc::now() - self.enqueued_at;
        age.to_std().map(|a| a > lane.message_ttl).unwrap_or(false)
    }
}

/// Copy of a message whose retry budget is exhausted (or that failed
/// terminally), parked for human triage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_lane: String,
    pub reason: String,
    pub run_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    /// Correlation back to the originating event via the run's dispatch id.
    pub dispatch_id: Option<String>,
    /// The message body as originally published; replay re-sends this.
    pub original: serde_json::Value,
}

impl super::Db {
    /// Create a lane (idempotent).
    pub async fn create_lane(&self, lane: &str) -> Result<()> {
        assert_lane_name(lane)?;
        sqlx::query("SELECT pgmq.create($1)")
            .bind(lane)
            .execute(&self.pool)
            .await?;
        metrics::lane_operations().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("operation", "create"),
            ],
        );
        Ok(())
    }

    /// Send a message to a lane. Returns the message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery (backoff).
    pub async fn send_to_lane(
        &self,
        lane: &str,
        payload: &serde_json::Value,
        delay_seconds: i32,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(lane)
            .bind(payload)
            .bind(delay_seconds)
            .fetch_one(&self.pool)
            .await?;
        metrics::lane_operations().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("operation", "send"),
            ],
        );
        Ok(row.0)
    }

    /// Read the next message from a lane (visibility timeout in seconds).
    /// Returns None if the lane is empty.
    pub async fn read_from_lane(&self, lane: &str, vt_seconds: i32) -> Result<Option<LaneMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)"
        )
        .bind(lane)
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| LaneMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        metrics::lane_operations().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new(
                    "operation",
                    if msg.is_some() { "read" } else { "read_empty" },
                ),
            ],
        );

        Ok(msg)
    }

    /// Archive a message (moves to pgmq's archive table, preserved for
    /// audit). This is the acknowledgement.
    pub async fn archive_message(&self, lane: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(lane)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        metrics::lane_operations().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("operation", "archive"),
            ],
        );
        Ok(())
    }

    /// Delete a message permanently.
    pub async fn delete_message(&self, lane: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(lane)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        metrics::lane_operations().add(
            1,
            &[
                KeyValue::new("lane", lane.to_string()),
                KeyValue::new("operation", "delete"),
            ],
        );
        Ok(())
    }

    /// Wake consumers listening on a channel. NOTIFY payloads are
    /// advisory; consumers always re-read the lane.
    pub async fn notify_channel(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Park a dead-letter copy. Append-only: nothing consumes the
    /// dead-letter lane automatically.
    pub async fn send_to_dead_letter(&self, dead_letter_lane: &str, entry: &DeadLetter) -> Result<i64> {
        let payload = serde_json::to_value(entry)?;
        let msg_id = self.send_to_lane(dead_letter_lane, &payload, 0).await?;
        metrics::dead_letters().add(
            1,
            &[KeyValue::new("original_lane", entry.original_lane.clone())],
        );
        Ok(msg_id)
    }

    /// Peek dead-letter entries without consuming them. Reads the pgmq
    /// queue table directly so display doesn't take visibility timeouts.
    pub async fn list_dead_letters(&self, lane: &str, limit: i64) -> Result<Vec<LaneMessage>> {
        assert_lane_name(lane)?;
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >(&format!(
            "SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.q_{lane} ORDER BY msg_id LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| LaneMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect())
    }

    /// Explicit replay: re-publish a dead-letter entry's original body to
    /// its original lane, then archive the entry. Returns the new msg id.
    pub async fn replay_dead_letter(&self, dead_letter_lane: &str, msg_id: i64) -> Result<i64> {
        assert_lane_name(dead_letter_lane)?;
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&format!(
            "SELECT message FROM pgmq.q_{dead_letter_lane} WHERE msg_id = $1"
        ))
        .bind(msg_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((message,)) = row else {
            return Err(Error::NotFound(format!("dead-letter entry {msg_id}")));
        };
        let entry: DeadLetter = serde_json::from_value(message)?;

        let new_id = self
            .send_to_lane(&entry.original_lane, &entry.original, 0)
            .await?;
        self.archive_message(dead_letter_lane, msg_id).await?;
        Ok(new_id)
    }
}

/// Lane names come from config and end up interpolated into pgmq table
/// names; restrict them to identifier characters.
fn assert_lane_name(lane: &str) -> Result<()> {
    if !lane.is_empty()
        && lane
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid lane name: {lane}")))
    }
}
