//! Ingress: validation, dedup, locking, and the pipeline that turns a raw
//! notification into triage and dispatch.
//!
//! Order matters here. Validation rejects malformed events before anything
//! is queued; the audit row is written on receipt; the coarse dedup tier
//! answers before the resource lock is taken; the fine tier answers inside
//! it. Dedup and locking both fail open; the persistence layer's unique
//! constraints are the final backstop.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{LaneConfig, OrchestratorSettings};
use crate::db::lanes::INGRESS_CHANNEL;
use crate::db::runs::NewRun;
use crate::db::{Db, idempotency};
use crate::dispatch::{self, DispatchMessage};
use crate::error::{Error, Result};
use crate::model::event::{EventKind, InboundEvent, InboundPayload, ValidatedEvent};
use crate::model::run::RunId;
use crate::model::task::{Task, TaskId};
use crate::telemetry::metrics;
use crate::triage::{TriageOutcome, TriageRouter, TriggerInfo};
use opentelemetry::KeyValue;

/// Delay before a Busy event is offered again.
const BUSY_RETRY_DELAY_SECS: i32 = 5;

/// Outcome of ingesting one notification.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Accepted and acted on.
    Processed {
        task_id: Option<TaskId>,
        run_id: Option<RunId>,
    },
    /// Already seen on either dedup tier.
    Duplicate,
    /// Acknowledged but deliberately not acted on (unknown type, no-op
    /// content, opaque payload).
    Ignored { reason: String },
    /// Another worker holds the resource, or its cooldown; retry later.
    Busy,
}

/// Signature scheme shared with the event source: hex SHA-256 over the
/// secret followed by the compact-serialized payload.
pub fn sign_payload(secret: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Content hash for the fine dedup tier.
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// The ingestion pipeline.
pub struct Ingestor {
    db: Arc<Db>,
    router: TriageRouter,
    settings: OrchestratorSettings,
    webhook_secret: Option<SecretString>,
    /// Lock holder tag, unique per process instance.
    holder: String,
}

impl Ingestor {
    pub fn new(
        db: Arc<Db>,
        router: TriageRouter,
        settings: OrchestratorSettings,
        webhook_secret: Option<SecretString>,
    ) -> Self {
        Self {
            db,
            router,
            settings,
            webhook_secret,
            holder: format!("ingress-{}", Uuid::new_v4()),
        }
    }

    /// Ingest one notification end to end.
    pub async fn ingest(&self, raw: &InboundEvent) -> Result<IngestOutcome> {
        if raw.resource_id.trim().is_empty() {
            return Err(Error::Validation("empty resource_id".to_string()));
        }
        self.verify_signature(raw)?;

        let record = self.db.record_event(raw).await?;

        // Unknown types are acknowledged and ignored, never an error.
        let Some(kind) = EventKind::parse(&raw.event_type) else {
            self.db.finish_event(record.id, None, None).await?;
            count_ingested(&raw.event_type, "ignored");
            return Ok(IngestOutcome::Ignored {
                reason: format!("unrecognized event type {}", raw.event_type),
            });
        };

        let payload = match InboundPayload::from_wire(kind, &raw.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Malformed: audit the rejection, surface the error, never
                // enqueue.
                self.db
                    .finish_event(record.id, Some(&e.to_string()), None)
                    .await?;
                count_ingested(&raw.event_type, "rejected");
                return Err(e);
            }
        };

        let validated = ValidatedEvent {
            event_id: record.id,
            source: raw.source.clone(),
            kind,
            resource_id: raw.resource_id.clone(),
            payload,
            payload_hash: payload_hash(&raw.payload),
            delivery_id: raw.delivery_id.clone(),
        };

        // Coarse tier: upstream redelivery of the same delivery id.
        if let Some(delivery_id) = &validated.delivery_id {
            if self
                .db
                .is_processed(&idempotency::delivery_key(&validated.source, delivery_id))
                .await
            {
                self.db.finish_event(record.id, None, None).await?;
                count_ingested(&raw.event_type, "duplicate");
                return Ok(IngestOutcome::Duplicate);
            }
        }

        // Serialize triage per upstream item.
        let acquired = self
            .db
            .acquire_resource(
                &validated.resource_id,
                &self.holder,
                self.settings.lock_timeout,
                self.settings.lock_cooldown,
            )
            .await;
        if !acquired {
            self.db
                .finish_event(record.id, Some("resource busy"), None)
                .await?;
            count_ingested(&raw.event_type, "busy");
            return Ok(IngestOutcome::Busy);
        }

        let outcome = self.process_locked(&validated).await;
        self.db.release_resource(&validated.resource_id).await;
        outcome
    }

    async fn process_locked(&self, event: &ValidatedEvent) -> Result<IngestOutcome> {
        // Fine tier: same content under a different delivery id.
        if self
            .db
            .is_duplicate_payload(&event.resource_id, event.kind.as_str(), &event.payload_hash)
            .await
        {
            self.db.finish_event(event.event_id, None, None).await?;
            count_ingested(event.kind.as_str(), "duplicate");
            return Ok(IngestOutcome::Duplicate);
        }

        let outcome = self.router.triage(event).await?;

        let (task_id, run_id, summary) = match outcome {
            TriageOutcome::TaskCreated {
                task,
                initial_run: true,
            } => {
                let run_id = self.dispatch_run(event, &task, false, None, None, None).await?;
                (
                    Some(task.id),
                    Some(run_id),
                    format!("task created, run {run_id} dispatched"),
                )
            }
            TriageOutcome::TaskCreated {
                task,
                initial_run: false,
            } => (Some(task.id), None, "task created".to_string()),
            TriageOutcome::RunRequested {
                task,
                is_reactivation,
                reactivation_source,
                context,
                trigger,
            } => {
                let run_id = self
                    .dispatch_run(event, &task, is_reactivation, reactivation_source, context, trigger)
                    .await?;
                (Some(task.id), Some(run_id), format!("run {run_id} dispatched"))
            }
            TriageOutcome::FieldsUpdated { task } => {
                (Some(task.id), None, "fields updated".to_string())
            }
            TriageOutcome::NoAction { task, reason } => {
                let summary = format!("no action: {reason}");
                (task.map(|t| t.id), None, summary)
            }
        };

        // Both ledger tiers now remember this event.
        if let Some(delivery_id) = &event.delivery_id {
            self.db
                .mark_processed(
                    &idempotency::delivery_key(&event.source, delivery_id),
                    &summary,
                    self.settings.idempotency_ttl,
                )
                .await;
        }
        self.db
            .mark_processed(
                &idempotency::payload_key(
                    &event.resource_id,
                    event.kind.as_str(),
                    &event.payload_hash,
                ),
                &summary,
                self.settings.idempotency_ttl,
            )
            .await;

        self.db.finish_event(event.event_id, None, task_id).await?;
        count_ingested(event.kind.as_str(), "processed");
        debug!(event = %event.event_id, summary, "event processed");

        Ok(IngestOutcome::Processed { task_id, run_id })
    }

    /// Allocate (or adopt) the run for this event and publish its
    /// dispatch. The dispatch id derives from the event audit row, so a
    /// redelivered event adopts instead of double-running.
    async fn dispatch_run(
        &self,
        event: &ValidatedEvent,
        task: &Task,
        is_reactivation: bool,
        reactivation_source: Option<String>,
        context: Option<String>,
        trigger: Option<TriggerInfo>,
    ) -> Result<RunId> {
        let started = self
            .db
            .start_run(NewRun {
                task_id: Some(task.id),
                dispatch_id: format!("evt-{}", event.event_id),
                is_reactivation,
                reactivation_source,
            })
            .await?;
        let run_id = started.run().id;

        if let Some(trigger) = trigger {
            self.db
                .record_reactivation_trigger(
                    task.id,
                    &trigger.text,
                    &trigger.intent,
                    trigger.confidence,
                    Some(run_id),
                )
                .await?;
        }

        // Publish on adoption too: the dispatch is at-least-once and the
        // executor tolerates duplicates; a crash between start and publish
        // must not strand the run.
        let message = DispatchMessage {
            run_id,
            workflow: self.settings.default_workflow.clone(),
            task_snapshot: Some(task.clone()),
            is_reactivation,
            reactivation_context: context,
            priority: task.priority,
            attempt: 1,
        };
        dispatch::publish(&self.db, &self.settings.lanes.work, &message, 0).await?;

        info!(run = %run_id, task = %task.id, reactivation = is_reactivation, "run dispatched");
        Ok(run_id)
    }

    fn verify_signature(&self, raw: &InboundEvent) -> Result<()> {
        let Some(secret) = &self.webhook_secret else {
            return Ok(());
        };
        let Some(provided) = &raw.signature else {
            return Err(Error::Validation("missing signature".to_string()));
        };
        let expected = sign_payload(secret.expose_secret(), &raw.payload);
        if provided.trim().eq_ignore_ascii_case(&expected) {
            Ok(())
        } else {
            Err(Error::Validation("signature mismatch".to_string()))
        }
    }
}

fn count_ingested(event_type: &str, result: &'static str) {
    metrics::events_ingested().add(
        1,
        &[
            KeyValue::new("type", event_type.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

/// Drains the ingress lane. Each message is one [`InboundEvent`] published
/// by the edge. Busy events are re-enqueued with a short delay instead of
/// holding the consumer.
pub struct IngressConsumer {
    db: Arc<Db>,
    ingestor: Arc<Ingestor>,
    lane: LaneConfig,
    shutdown: Arc<Notify>,
    visibility_timeout: i32,
    poll_interval: Duration,
}

impl IngressConsumer {
    pub fn new(db: Arc<Db>, ingestor: Arc<Ingestor>, lane: LaneConfig) -> Self {
        Self {
            db,
            ingestor,
            lane,
            shutdown: Arc::new(Notify::new()),
            visibility_timeout: 60,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Signal the consumer to shut down.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Run the consumer loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(INGRESS_CHANNEL).await?;

        info!("ingress consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("ingress consumer shutting down");
                    return Ok(());
                }
                notif = listener.recv() => {
                    if let Err(e) = notif {
                        warn!("PgListener error: {e}, falling back to poll");
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            // Drain whatever is available, notified or not.
            loop {
                match self.process_next().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!("ingress processing error: {e}");
                        break;
                    }
                }
            }
        }
    }

    /// Take and process one message. Returns false when the lane is empty.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(msg) = self
            .db
            .read_from_lane(&self.lane.name, self.visibility_timeout)
            .await?
        else {
            return Ok(false);
        };

        if msg.is_expired(&self.lane) {
            warn!(msg_id = msg.msg_id, lane = %self.lane.name, "message outlived lane TTL, archiving");
            self.db.archive_message(&self.lane.name, msg.msg_id).await?;
            return Ok(true);
        }

        let event: InboundEvent = match serde_json::from_value(msg.message.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!(msg_id = msg.msg_id, "malformed ingress message, archiving: {e}");
                self.db.archive_message(&self.lane.name, msg.msg_id).await?;
                return Ok(true);
            }
        };

        match self.ingestor.ingest(&event).await {
            Ok(IngestOutcome::Busy) => {
                // Re-send first, then ack: late acknowledgement means the
                // notification is never lost between the two.
                self.db
                    .send_to_lane(&self.lane.name, &msg.message, BUSY_RETRY_DELAY_SECS)
                    .await?;
                self.db.archive_message(&self.lane.name, msg.msg_id).await?;
            }
            Ok(outcome) => {
                debug!(msg_id = msg.msg_id, ?outcome, "ingress message handled");
                self.db.archive_message(&self.lane.name, msg.msg_id).await?;
            }
            Err(Error::Validation(reason)) => {
                // Rejected at ingress: acknowledged, never retried.
                warn!(msg_id = msg.msg_id, reason, "rejected event");
                self.db.archive_message(&self.lane.name, msg.msg_id).await?;
            }
            Err(e) => {
                // Infrastructure trouble: leave unacked, the visibility
                // timeout redelivers.
                error!(msg_id = msg.msg_id, "ingest error, leaving for redelivery: {e}");
            }
        }

        Ok(true)
    }
}
