//! Event audit rows and reactivation trigger records.
//!
//! Event rows are the audit trail: created on receipt, mutated exactly
//! once (processed or failed), never deleted. Any notification can be
//! traced from here through its task, run, and steps.

use crate::error::{Error, Result};
use crate::model::event::{EventRecord, InboundEvent, ReactivationTrigger};
use crate::model::run::RunId;
use crate::model::task::TaskId;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "id, source, event_type, resource_id, payload, signature, processed, error, task_id, received_at, processed_at";

impl super::Db {
    /// Record a received notification. Insert-only.
    pub async fn record_event(&self, event: &InboundEvent) -> Result<EventRecord> {
        let id = Uuid::new_v4();
        let now = chrono::Utc::now();

        sqlx::query(
            "INSERT INTO events (id, source, event_type, resource_id, payload, signature, processed, received_at)
             VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)",
        )
        .bind(id)
        .bind(&event.source)
        .bind(&event.event_type)
        .bind(&event.resource_id)
        .bind(&event.payload)
        .bind(&event.signature)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(EventRecord {
            id,
            source: event.source.clone(),
            event_type: event.event_type.clone(),
            resource_id: event.resource_id.clone(),
            payload: event.payload.clone(),
            signature: event.signature.clone(),
            processed: false,
            error: None,
            task_id: None,
            received_at: now,
            processed_at: None,
        })
    }

    /// The one-shot mutation: mark the event processed (error = None) or
    /// failed, and link the task it touched. A second call is a no-op;
    /// the audit row is written once.
    pub async fn finish_event(
        &self,
        id: Uuid,
        error: Option<&str>,
        task_id: Option<TaskId>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE events
             SET processed = $2, error = $3, task_id = $4, processed_at = now()
             WHERE id = $1 AND processed_at IS NULL",
        )
        .bind(id)
        .bind(error.is_none())
        .bind(error)
        .bind(task_id.map(|t| t.0))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get an event audit row by ID.
    pub async fn get_event(&self, id: Uuid) -> Result<EventRecord> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(EventRow::into_record)
            .ok_or_else(|| Error::NotFound(format!("event {id}")))
    }

    /// Audit why a terminal task was (or wasn't) reopened.
    pub async fn record_reactivation_trigger(
        &self,
        task_id: TaskId,
        trigger_text: &str,
        intent: &str,
        confidence: f32,
        run_id: Option<RunId>,
    ) -> Result<ReactivationTrigger> {
        let id = Uuid::new_v4();
        let now = chrono::Utc::now();

        sqlx::query(
            "INSERT INTO reactivation_triggers (id, task_id, trigger_text, intent, confidence, run_id, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(task_id.0)
        .bind(trigger_text)
        .bind(intent)
        .bind(confidence)
        .bind(run_id.map(|r| r.0))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ReactivationTrigger {
            id,
            task_id,
            trigger_text: trigger_text.to_string(),
            intent: intent.to_string(),
            confidence,
            run_id,
            created_at: now,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    source: String,
    event_type: String,
    resource_id: String,
    payload: serde_json::Value,
    signature: Option<String>,
    processed: bool,
    error: Option<String>,
    task_id: Option<Uuid>,
    received_at: chrono::DateTime<chrono::Utc>,
    processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl EventRow {
    fn into_record(self) -> EventRecord {
        EventRecord {
            id: self.id,
            source: self.source,
            event_type: self.event_type,
            resource_id: self.resource_id,
            payload: self.payload,
            signature: self.signature,
            processed: self.processed,
            error: self.error,
            task_id: self.task_id.map(TaskId),
            received_at: self.received_at,
            processed_at: self.processed_at,
        }
    }
}
