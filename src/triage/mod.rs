//! Event triage: the per-event state machine deciding whether a validated,
//! non-duplicate notification creates a task, updates it, or requests a
//! run.
//!
//! The caller (ingress) holds the resource lock while this runs, so triage
//! for one upstream item is serialized. Triage mutates tasks and writes
//! trigger audit rows; run allocation and dispatch stay with the caller.

pub mod intent;

use std::sync::Arc;

use crate::db::Db;
use crate::db::tasks::TaskFields;
use crate::error::Result;
use crate::model::event::{EventKind, InboundPayload, ValidatedEvent};
use crate::model::task::Task;
use crate::telemetry::metrics;
use intent::{IntentClassifier, IntentKind, keyword_intent};
use opentelemetry::KeyValue;
use serde_json::Value;
use tracing::{info, warn};

/// Upstream statuses that do NOT reactivate. Everything else counts as
/// active.
const TERMINAL_UPSTREAM_STATUSES: &[&str] = &["done", "closed", "completed", "resolved", "cancelled"];

/// Does this upstream status string read as "work is wanted again"?
pub fn is_active_upstream_status(status: &str) -> bool {
    let lowered = status.trim().to_lowercase();
    !TERMINAL_UPSTREAM_STATUSES.contains(&lowered.as_str())
}

/// Why a run is being requested, recorded as the reactivation audit row
/// once the run exists.
#[derive(Debug, Clone)]
pub struct TriggerInfo {
    pub text: String,
    pub intent: String,
    pub confidence: f32,
}

/// What triage decided for one event.
#[derive(Debug)]
pub enum TriageOutcome {
    /// A new task was created. `initial_run` says whether the creation
    /// itself warrants the first run.
    TaskCreated { task: Task, initial_run: bool },
    /// A run was requested for an existing task.
    RunRequested {
        task: Task,
        is_reactivation: bool,
        reactivation_source: Option<String>,
        /// Trigger text handed to the executor as dispatch context.
        context: Option<String>,
        /// Present when the task was terminal; the caller records this
        /// against the allocated run.
        trigger: Option<TriggerInfo>,
    },
    /// Plain field update, no run.
    FieldsUpdated { task: Task },
    /// Acknowledged, nothing to do.
    NoAction { task: Option<Task>, reason: String },
}

impl TriageOutcome {
    fn label(&self) -> &'static str {
        match self {
            TriageOutcome::TaskCreated { .. } => "task_created",
            TriageOutcome::RunRequested { .. } => "run_requested",
            TriageOutcome::FieldsUpdated { .. } => "fields_updated",
            TriageOutcome::NoAction { .. } => "no_action",
        }
    }
}

pub struct TriageRouter {
    db: Arc<Db>,
    classifier: Arc<dyn IntentClassifier>,
    default_snapshot_ref: String,
}

impl TriageRouter {
    pub fn new(
        db: Arc<Db>,
        classifier: Arc<dyn IntentClassifier>,
        default_snapshot_ref: impl Into<String>,
    ) -> Self {
        Self {
            db,
            classifier,
            default_snapshot_ref: default_snapshot_ref.into(),
        }
    }

    /// Run the state machine for one validated event.
    pub async fn triage(&self, event: &ValidatedEvent) -> Result<TriageOutcome> {
        let existing = self.db.find_task_by_external_id(&event.resource_id).await?;

        let outcome = match (&event.payload, existing) {
            // Unknown item: create the task. item-created also requests
            // the first run: the creation is itself the first logical
            // change to execute.
            (payload, None) => {
                let task = self
                    .db
                    .upsert_task(&event.resource_id, &task_fields_from(payload))
                    .await?;
                info!(task = %task.id, external_id = %event.resource_id, "task created");
                TriageOutcome::TaskCreated {
                    initial_run: event.kind == EventKind::ItemCreated,
                    task,
                }
            }

            // Redelivered create for a known item: refresh fields only.
            (payload @ InboundPayload::ItemCreated { .. }, Some(task)) => {
                let task = self
                    .db
                    .upsert_task(&task.external_id, &task_fields_from(payload))
                    .await?;
                TriageOutcome::FieldsUpdated { task }
            }

            (InboundPayload::FieldChanged { fields, comment }, Some(task)) => {
                self.triage_field_change(&task, fields, comment.as_deref())
                    .await?
            }

            (InboundPayload::ContentAdded { body, .. }, Some(task)) => {
                self.triage_content(&task, body).await?
            }

            // Opaque payloads are stored verbatim and never destructured.
            (InboundPayload::Opaque(_), Some(task)) => TriageOutcome::NoAction {
                task: Some(task),
                reason: "opaque payload".to_string(),
            },
        };

        metrics::triage_decisions().add(1, &[KeyValue::new("decision", outcome.label())]);
        Ok(outcome)
    }

    /// field-changed: a terminal→active status transition reactivates and
    /// wins over any attached comment; the comment is classified only when
    /// status is unchanged; anything else is a plain update.
    async fn triage_field_change(
        &self,
        task: &Task,
        fields: &serde_json::Map<String, Value>,
        comment: Option<&str>,
    ) -> Result<TriageOutcome> {
        let new_status = fields.get("status").and_then(Value::as_str);

        if let Some(status) = new_status {
            let changed = task.upstream_status.as_deref() != Some(status);
            if changed {
                let updated = self
                    .db
                    .upsert_task(&task.external_id, &fields_update(fields))
                    .await?;
                if task.status.is_terminal() && is_active_upstream_status(status) {
                    let reactivated = self.db.reactivate_task(updated.id).await?;
                    let source = self.reactivation_source(reactivated.id).await?;
                    let text = format!(
                        "status changed from {} to {status}",
                        task.upstream_status.as_deref().unwrap_or("(unset)")
                    );
                    info!(task = %reactivated.id, %status, "reactivation requested by status transition");
                    return Ok(TriageOutcome::RunRequested {
                        task: reactivated,
                        is_reactivation: true,
                        reactivation_source: Some(source),
                        context: Some(text.clone()),
                        trigger: Some(TriggerInfo {
                            text,
                            intent: "status-transition".to_string(),
                            confidence: 1.0,
                        }),
                    });
                }
                return Ok(TriageOutcome::FieldsUpdated { task: updated });
            }
        }

        let updated = self
            .db
            .upsert_task(&task.external_id, &fields_update(fields))
            .await?;
        if let Some(body) = comment {
            return self.triage_content(&updated, body).await;
        }
        Ok(TriageOutcome::FieldsUpdated { task: updated })
    }

    /// content-added (or a comment riding a field change): classify and
    /// decide. Classifier failure falls back to the keyword heuristic and
    /// never raises.
    async fn triage_content(&self, task: &Task, body: &str) -> Result<TriageOutcome> {
        let intent = match self.classifier.classify(body).await {
            Ok(intent) => intent,
            Err(e) => {
                warn!(task = %task.id, "classifier failed, using keyword heuristic: {e}");
                keyword_intent(body)
            }
        };

        let was_terminal = task.status.is_terminal();
        match intent.kind {
            IntentKind::Command => {
                let (task, source) = if was_terminal {
                    let reactivated = self.db.reactivate_task(task.id).await?;
                    let source = self.reactivation_source(reactivated.id).await?;
                    (reactivated, Some(source))
                } else {
                    (task.clone(), None)
                };
                info!(task = %task.id, reactivation = was_terminal, "run requested by content command");
                Ok(TriageOutcome::RunRequested {
                    task,
                    is_reactivation: was_terminal,
                    reactivation_source: source,
                    context: Some(body.to_string()),
                    trigger: was_terminal.then(|| TriggerInfo {
                        text: body.to_string(),
                        intent: intent.kind.as_str().to_string(),
                        confidence: intent.confidence,
                    }),
                })
            }
            IntentKind::Question | IntentKind::Noop => {
                if was_terminal {
                    // Reopen declined, still worth the audit row.
                    self.db
                        .record_reactivation_trigger(
                            task.id,
                            body,
                            intent.kind.as_str(),
                            intent.confidence,
                            None,
                        )
                        .await?;
                }
                Ok(TriageOutcome::NoAction {
                    task: Some(task.clone()),
                    reason: format!("content classified as {}", intent.kind.as_str()),
                })
            }
        }
    }

    /// Last completed run's snapshot, or the configured default.
    async fn reactivation_source(&self, task_id: crate::model::task::TaskId) -> Result<String> {
        Ok(self
            .db
            .last_snapshot_ref(task_id)
            .await?
            .unwrap_or_else(|| self.default_snapshot_ref.clone()))
    }
}

/// Task fields carried by a typed payload.
fn task_fields_from(payload: &InboundPayload) -> TaskFields {
    match payload {
        InboundPayload::ItemCreated {
            title,
            description,
            priority,
            target_ref,
            status,
        } => TaskFields {
            title: Some(title.clone()),
            description: description.clone(),
            target_ref: target_ref.clone(),
            priority: *priority,
            upstream_status: status.clone(),
        },
        InboundPayload::FieldChanged { fields, .. } => fields_update(fields),
        InboundPayload::ContentAdded { .. } | InboundPayload::Opaque(_) => TaskFields::default(),
    }
}

/// Known columns picked out of a field-change map; everything else is
/// ignored (it still lives verbatim in the event audit row).
fn fields_update(fields: &serde_json::Map<String, Value>) -> TaskFields {
    TaskFields {
        title: fields
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string),
        description: fields
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        target_ref: fields
            .get("target_ref")
            .and_then(Value::as_str)
            .map(str::to_string),
        priority: fields.get("priority").and_then(Value::as_i64).map(|p| p as i32),
        upstream_status: fields
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}
