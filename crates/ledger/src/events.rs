//! Ledger audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{ApproverId, IdempotencyKey, OrgId, SkuId, StoreId};
use stockledger_events::{Event, EventType};

use crate::batch::BatchSummary;
use crate::confirmation::{ConfirmedOrder, ConfirmedTransfer};
use crate::projection::LevelDrift;

/// Event: OrgCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgCreated {
    pub org_id: OrgId,
    pub display_name: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmed {
    pub ledger_id: i64,
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub qty: i64,
    pub approved_by: ApproverId,
    pub idem_key: IdempotencyKey,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfirmed {
    pub ledger_id: i64,
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub sku_id: SkuId,
    pub qty: i64,
    pub approved_by: ApproverId,
    pub idem_key: IdempotencyKey,
    pub occurred_at: DateTime<Utc>,
}

/// Event: a batch was approved (`orders_approved` / `transfers_approved`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchApproved {
    pub approved_by: ApproverId,
    pub idem_prefix: String,
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub rows: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Event: stored levels disagree with the ledger fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationDrift {
    pub drift: Vec<LevelDrift>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: the projection was rebuilt from the ledger by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionRepaired {
    pub corrected: usize,
    pub rows: usize,
    pub occurred_at: DateTime<Utc>,
}

/// Every event the ledger writes to the audit log.
///
/// Serializes as the inner payload only; the variant is carried by
/// [`Event::event_type`] in its own column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LedgerEvent {
    OrgCreated(OrgCreated),
    OrderConfirmed(OrderConfirmed),
    TransferConfirmed(TransferConfirmed),
    OrdersApproved(BatchApproved),
    TransfersApproved(BatchApproved),
    ReconciliationDrift(ReconciliationDrift),
    ProjectionRepaired(ProjectionRepaired),
}

impl Event for LedgerEvent {
    fn event_type(&self) -> EventType {
        match self {
            LedgerEvent::OrgCreated(_) => EventType::OrgCreated,
            LedgerEvent::OrderConfirmed(_) => EventType::OrderConfirmed,
            LedgerEvent::TransferConfirmed(_) => EventType::TransferConfirmed,
            LedgerEvent::OrdersApproved(_) => EventType::OrdersApproved,
            LedgerEvent::TransfersApproved(_) => EventType::TransfersApproved,
            LedgerEvent::ReconciliationDrift(_) => EventType::ReconciliationDrift,
            LedgerEvent::ProjectionRepaired(_) => EventType::ProjectionRepaired,
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::OrgCreated(e) => e.occurred_at,
            LedgerEvent::OrderConfirmed(e) => e.occurred_at,
            LedgerEvent::TransferConfirmed(e) => e.occurred_at,
            LedgerEvent::OrdersApproved(e) | LedgerEvent::TransfersApproved(e) => e.occurred_at,
            LedgerEvent::ReconciliationDrift(e) => e.occurred_at,
            LedgerEvent::ProjectionRepaired(e) => e.occurred_at,
        }
    }
}

impl LedgerEvent {
    pub fn order_confirmed(order: &ConfirmedOrder) -> Self {
        LedgerEvent::OrderConfirmed(OrderConfirmed {
            ledger_id: order.id,
            store_id: order.store_id.clone(),
            sku_id: order.sku_id.clone(),
            qty: order.quantity.units(),
            approved_by: order.approved_by.clone(),
            idem_key: order.idempotency_key.clone(),
            occurred_at: order.approved_at,
        })
    }

    pub fn transfer_confirmed(transfer: &ConfirmedTransfer) -> Self {
        LedgerEvent::TransferConfirmed(TransferConfirmed {
            ledger_id: transfer.id,
            from_store: transfer.from_store.clone(),
            to_store: transfer.to_store.clone(),
            sku_id: transfer.sku_id.clone(),
            qty: transfer.quantity.units(),
            approved_by: transfer.approved_by.clone(),
            idem_key: transfer.idempotency_key.clone(),
            occurred_at: transfer.approved_at,
        })
    }

    pub fn orders_approved(approved_by: &ApproverId, prefix: &str, summary: &BatchSummary) -> Self {
        LedgerEvent::OrdersApproved(BatchApproved::new(approved_by, prefix, summary))
    }

    pub fn transfers_approved(
        approved_by: &ApproverId,
        prefix: &str,
        summary: &BatchSummary,
    ) -> Self {
        LedgerEvent::TransfersApproved(BatchApproved::new(approved_by, prefix, summary))
    }
}

impl BatchApproved {
    fn new(approved_by: &ApproverId, prefix: &str, summary: &BatchSummary) -> Self {
        Self {
            approved_by: approved_by.clone(),
            idem_prefix: prefix.trim().to_string(),
            applied: summary.applied,
            duplicates: summary.duplicates,
            rejected: summary.rejected,
            rows: summary.total(),
            occurred_at: Utc::now(),
        }
    }
}
