//! Inbound notifications and their durable audit records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::run::RunId;
use crate::model::task::TaskId;

/// A change notification as delivered by the event source.
///
/// Wire format and auth are the source's concern; this is the shape the
/// orchestrator accepts, whether over the ingress lane or the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub source: String,

    #[serde(rename = "type")]
    pub event_type: String,

    /// The upstream item this notification is about.
    pub resource_id: String,

    pub payload: Value,

    #[serde(default)]
    pub signature: Option<String>,

    /// Upstream redelivery key. Absent means the coarse dedup tier is
    /// skipped and content-hash dedup is the only one.
    #[serde(default)]
    pub delivery_id: Option<String>,
}

/// The closed set of notification types the orchestrator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ItemCreated,
    FieldChanged,
    ContentAdded,
}

impl EventKind {
    /// Parse a wire type string. Unknown types are not an error;
    /// the caller acknowledges and ignores them.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "item-created" => Some(Self::ItemCreated),
            "field-changed" => Some(Self::FieldChanged),
            "content-added" => Some(Self::ContentAdded),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ItemCreated => "item-created",
            Self::FieldChanged => "field-changed",
            Self::ContentAdded => "content-added",
        }
    }
}

/// Typed view of an event payload: one variant per known kind, plus an
/// opaque variant that is stored verbatim and never destructured.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    ItemCreated {
        title: String,
        description: Option<String>,
        priority: Option<i32>,
        target_ref: Option<String>,
        status: Option<String>,
    },
    FieldChanged {
        /// Changed fields keyed by name, values verbatim.
        fields: serde_json::Map<String, Value>,
        /// Some upstreams attach a comment to a field change in the same
        /// delivery. Evaluated only when the status field is unchanged.
        comment: Option<String>,
    },
    ContentAdded {
        author: Option<String>,
        body: String,
    },
    Opaque(Value),
}

impl InboundPayload {
    /// Destructure a wire payload for a known kind. Malformed payloads are
    /// a validation error: rejected at ingress, never enqueued.
    pub fn from_wire(kind: EventKind, payload: &Value) -> Result<Self> {
        match kind {
            EventKind::ItemCreated => {
                let title = payload
                    .get("title")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Validation("item-created payload missing title".into()))?
                    .to_string();
                Ok(Self::ItemCreated {
                    title,
                    description: str_field(payload, "description"),
                    priority: payload
                        .get("priority")
                        .and_then(Value::as_i64)
                        .map(|p| p as i32),
                    target_ref: str_field(payload, "target_ref"),
                    status: str_field(payload, "status"),
                })
            }
            EventKind::FieldChanged => {
                let Some(object) = payload.as_object() else {
                    return Err(Error::Validation(
                        "field-changed payload is not an object".into(),
                    ));
                };
                let mut fields = object.clone();
                let comment = fields
                    .remove("comment")
                    .and_then(|v| v.as_str().map(str::to_string));
                if fields.is_empty() && comment.is_none() {
                    return Err(Error::Validation("field-changed payload is empty".into()));
                }
                Ok(Self::FieldChanged { fields, comment })
            }
            EventKind::ContentAdded => {
                let body = payload
                    .get("body")
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Validation("content-added payload missing body".into()))?
                    .to_string();
                Ok(Self::ContentAdded {
                    author: str_field(payload, "author"),
                    body,
                })
            }
        }
    }
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// An inbound event that cleared validation: known kind, typed payload,
/// verified signature, audit row recorded.
#[derive(Debug, Clone)]
pub struct ValidatedEvent {
    /// Id of the audit row; also the seed for the run's dispatch id.
    pub event_id: Uuid,
    pub source: String,
    pub kind: EventKind,
    pub resource_id: String,
    pub payload: InboundPayload,
    /// Content hash of the raw payload, for the fine dedup tier.
    pub payload_hash: String,
    pub delivery_id: Option<String>,
}

/// Durable audit record of one received notification. Created on receipt,
/// mutated exactly once (processed or failed), never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub source: String,
    pub event_type: String,
    pub resource_id: String,
    pub payload: Value,
    pub signature: Option<String>,
    pub processed: bool,
    pub error: Option<String>,
    pub task_id: Option<TaskId>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Audit of why a terminal task was reopened (or why a reopen attempt was
/// declined): trigger text, detected intent, confidence, and the run that
/// resulted, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactivationTrigger {
    pub id: Uuid,
    pub task_id: TaskId,
    pub trigger_text: String,
    pub intent: String,
    pub confidence: f32,
    pub run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
}
