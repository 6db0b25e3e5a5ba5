use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable audit event type, stored as text in the `events` table.
///
/// The ledger emits the well-known variants; external publishers (membership
/// sync, chat integrations) may append their own types, which round-trip
/// through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    OrgCreated,
    OrderConfirmed,
    TransferConfirmed,
    OrdersApproved,
    TransfersApproved,
    ReconciliationDrift,
    ProjectionRepaired,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::OrgCreated => "org_created",
            EventType::OrderConfirmed => "order_confirmed",
            EventType::TransferConfirmed => "transfer_confirmed",
            EventType::OrdersApproved => "orders_approved",
            EventType::TransfersApproved => "transfers_approved",
            EventType::ReconciliationDrift => "reconciliation_drift",
            EventType::ProjectionRepaired => "projection_repaired",
            EventType::Custom(s) => s,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "org_created" => EventType::OrgCreated,
            "order_confirmed" => EventType::OrderConfirmed,
            "transfer_confirmed" => EventType::TransferConfirmed,
            "orders_approved" => EventType::OrdersApproved,
            "transfers_approved" => EventType::TransfersApproved,
            "reconciliation_drift" => EventType::ReconciliationDrift,
            "projection_repaired" => EventType::ProjectionRepaired,
            _ => EventType::Custom(value),
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain-agnostic auditable event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution of the JSON payload)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event type identifier (e.g. `order_confirmed`).
    fn event_type(&self) -> EventType;

    /// Schema version of the payload.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
