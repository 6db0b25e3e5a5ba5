use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use stockledger_core::OrgId;

use crate::event::{Event, EventType};

/// An audit event ready to be appended (not yet assigned a log position).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub event_id: Uuid,
    pub org_id: OrgId,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub payload: JsonValue,
}

impl NewAuditEvent {
    pub fn new(org_id: OrgId, event_type: impl Into<EventType>, payload: JsonValue) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            org_id,
            occurred_at: Utc::now(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build from a typed domain event, serializing it to the JSON payload.
    pub fn from_typed<E>(org_id: OrgId, event: &E) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            org_id,
            occurred_at: event.occurred_at(),
            event_type: event.event_type(),
            payload: serde_json::to_value(event)?,
        })
    }
}

/// An appended audit event.
///
/// `id` is the log position: monotonically increasing across the whole log,
/// so per-organization polling can use it as a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub event_id: Uuid,
    pub org_id: OrgId,
    pub occurred_at: DateTime<Utc>,
    pub event_type: EventType,
    pub payload: JsonValue,
}

impl AuditEvent {
    pub fn from_new(id: i64, event: NewAuditEvent) -> Self {
        Self {
            id,
            event_id: event.event_id,
            org_id: event.org_id,
            occurred_at: event.occurred_at,
            event_type: event.event_type,
            payload: event.payload,
        }
    }
}

/// A page of events returned to a polling consumer, with the cursor to resume from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPage {
    pub events: Vec<AuditEvent>,
    pub cursor: i64,
}

impl EventPage {
    /// The cursor stays at `after` when nothing new was found.
    pub fn new(events: Vec<AuditEvent>, after: i64) -> Self {
        let cursor = events.last().map(|e| e.id).unwrap_or(after);
        Self { events, cursor }
    }
}
