// SQLx row types shared by the Postgres and SQLite backends.
//
// Queries select text columns (Postgres casts uuid/jsonb with `::text`) so the
// same row structs decode on both drivers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stockledger_core::{ApproverId, IdempotencyKey, OrgId, Quantity, SkuId, StoreId};
use stockledger_events::{AuditEvent, EventType};
use stockledger_ledger::{ConfirmedOrder, ConfirmedTransfer, InventoryLevel, Organization, User};

use super::{StoreError, StoreResult};

fn decode<T, E: core::fmt::Display>(column: &str, value: Result<T, E>) -> StoreResult<T> {
    value.map_err(|e| StoreError::Decode(format!("{column}: {e}")))
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrganizationRow {
    pub org_id: String,
    pub display_name: Option<String>,
    pub notify_webhook: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<OrganizationRow> for Organization {
    type Error = StoreError;

    fn try_from(row: OrganizationRow) -> StoreResult<Self> {
        Ok(Organization {
            org_id: decode("org_id", OrgId::new(row.org_id))?,
            display_name: row.display_name,
            notify_webhook: row.notify_webhook,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OrderRow {
    pub id: i64,
    pub org_id: String,
    pub store_id: String,
    pub sku_id: String,
    pub qty: i64,
    pub approved_at: DateTime<Utc>,
    pub approved_by: String,
    pub idem_key: String,
}

impl TryFrom<OrderRow> for ConfirmedOrder {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> StoreResult<Self> {
        Ok(ConfirmedOrder {
            id: row.id,
            org_id: decode("org_id", OrgId::new(row.org_id))?,
            store_id: decode("store_id", StoreId::new(row.store_id))?,
            sku_id: decode("sku_id", SkuId::new(row.sku_id))?,
            quantity: decode("qty", Quantity::new(row.qty))?,
            approved_at: row.approved_at,
            approved_by: decode("approved_by", ApproverId::new(row.approved_by))?,
            idempotency_key: decode("idem_key", IdempotencyKey::new(row.idem_key))?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TransferRow {
    pub id: i64,
    pub org_id: String,
    pub from_store: String,
    pub to_store: String,
    pub sku_id: String,
    pub qty: i64,
    pub approved_at: DateTime<Utc>,
    pub approved_by: String,
    pub idem_key: String,
}

impl TryFrom<TransferRow> for ConfirmedTransfer {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> StoreResult<Self> {
        Ok(ConfirmedTransfer {
            id: row.id,
            org_id: decode("org_id", OrgId::new(row.org_id))?,
            from_store: decode("from_store", StoreId::new(row.from_store))?,
            to_store: decode("to_store", StoreId::new(row.to_store))?,
            sku_id: decode("sku_id", SkuId::new(row.sku_id))?,
            quantity: decode("qty", Quantity::new(row.qty))?,
            approved_at: row.approved_at,
            approved_by: decode("approved_by", ApproverId::new(row.approved_by))?,
            idempotency_key: decode("idem_key", IdempotencyKey::new(row.idem_key))?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct LevelRow {
    pub org_id: String,
    pub store_id: String,
    pub sku_id: String,
    pub on_hand: i64,
}

impl TryFrom<LevelRow> for InventoryLevel {
    type Error = StoreError;

    fn try_from(row: LevelRow) -> StoreResult<Self> {
        Ok(InventoryLevel {
            org_id: decode("org_id", OrgId::new(row.org_id))?,
            store_id: decode("store_id", StoreId::new(row.store_id))?,
            sku_id: decode("sku_id", SkuId::new(row.sku_id))?,
            on_hand: row.on_hand,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EventRow {
    pub id: i64,
    pub event_id: String,
    pub org_id: String,
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub payload: String,
}

impl TryFrom<EventRow> for AuditEvent {
    type Error = StoreError;

    fn try_from(row: EventRow) -> StoreResult<Self> {
        Ok(AuditEvent {
            id: row.id,
            event_id: decode("event_id", Uuid::parse_str(&row.event_id))?,
            org_id: decode("org_id", OrgId::new(row.org_id))?,
            occurred_at: row.ts,
            event_type: EventType::from(row.event_type),
            payload: decode("payload", serde_json::from_str(&row.payload))?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub email: String,
    pub password_digest: String,
    pub org_id: String,
    pub role: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> StoreResult<Self> {
        Ok(User {
            id: row.id,
            email: row.email,
            password_digest: row.password_digest,
            org_id: decode("org_id", OrgId::new(row.org_id))?,
            role: row.role,
            display_name: row.display_name,
            created_at: row.created_at,
        })
    }
}

pub(crate) fn collect<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}
