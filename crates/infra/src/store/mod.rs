//! Storage boundary for the ledger.
//!
//! Four narrow traits mirror the four stored components. Backends implement
//! all of them on one type so that the ledger insert and its inventory effect
//! share a transaction:
//!
//! - [`TenantDirectory`]: organizations, store/SKU membership, user credentials
//! - [`IdempotencyLedger`]: confirmed orders/transfers keyed by their natural key
//! - [`InventoryProjection`]: on-hand per `(org, store, sku)`
//! - [`AuditLog`]: append-only events, read back only by external consumers
//!
//! The unique constraint on the natural key is the only idempotency guard.
//! `record_order`/`record_transfer` insert first and look up the existing row
//! only when the insert did nothing; there is no lookup-then-insert path.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::{DomainError, OrgId, SkuId, StoreId};
use stockledger_events::{AuditEvent, EventType, NewAuditEvent};
use stockledger_ledger::{
    ConfirmedOrder, ConfirmedTransfer, InventoryLevel, LedgerSnapshot, LevelDrift, NewUser,
    Organization, RecordOutcome, UpsertOrganization, UpsertStatus, User, ValidOrder, ValidTransfer,
};

pub mod memory;
pub mod postgres;
mod rows;
pub mod schema;
pub mod sqlite;

pub use memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use sqlite::SqliteLedgerStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-level failure.
///
/// `Unavailable` and `Storage` are retryable by the caller with the same
/// idempotency key; the others are deterministic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("organization not found: {0}")]
    UnknownOrg(OrgId),

    /// A unique constraint fired outside an idempotent insert path.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Foreign-key or check constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// An on-hand level would leave the `i64` range. Nothing was written.
    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A stored row could not be turned back into a domain value.
    #[error("corrupt row: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Storage(_))
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Storage("in-memory state lock poisoned".to_string())
    }

    /// Wrap a fold failure; the fold only rejects on-hand overflow.
    pub(crate) fn out_of_range(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) => StoreError::OutOfRange(msg),
            other => StoreError::OutOfRange(other.to_string()),
        }
    }
}

/// Postgres `numeric_value_out_of_range`, raised by bigint overflow.
const NUMERIC_OUT_OF_RANGE: &str = "22003";

/// Map sqlx errors to [`StoreError`].
///
/// | sqlx error | Postgres code | SQLite code | StoreError |
/// |------------|---------------|-------------|------------|
/// | unique violation | `23505` | `2067` / `1555` | `Conflict` |
/// | foreign-key violation | `23503` | `787` | `Constraint` |
/// | check violation | `23514` | `275` | `Constraint` |
/// | bigint out of range | `22003` | | `OutOfRange` |
/// | pool timeout / closed, I/O, TLS | | | `Unavailable` |
/// | anything else | | | `Storage` |
///
/// SQLite silently promotes an overflowing integer to REAL, so the SQLite
/// store checks on-hand arithmetic itself before writing.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            let msg = format!("{operation}: {} (code {code})", db_err.message());
            let kind = if db_err.is_unique_violation() {
                DbErrorKind::Unique
            } else if db_err.is_foreign_key_violation() || db_err.is_check_violation() {
                DbErrorKind::Constraint
            } else {
                DbErrorKind::Other
            };
            classify_database_error(&code, kind, msg)
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        other => StoreError::Storage(format!("{operation}: {other}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DbErrorKind {
    Unique,
    Constraint,
    Other,
}

pub(crate) fn classify_database_error(code: &str, kind: DbErrorKind, msg: String) -> StoreError {
    if code == NUMERIC_OUT_OF_RANGE {
        return StoreError::OutOfRange(msg);
    }
    match kind {
        DbErrorKind::Unique => StoreError::Conflict(msg),
        DbErrorKind::Constraint => StoreError::Constraint(msg),
        DbErrorKind::Other => StoreError::Storage(msg),
    }
}

/// Result of [`InventoryProjection::rebuild_levels`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuiltLevels {
    /// Stored levels that disagreed with the ledger before the rebuild.
    pub drift: Vec<LevelDrift>,
    /// Level rows written.
    pub rows: usize,
}

/// Row counts per owned table, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct OrgCounts {
    pub stores: i64,
    pub skus: i64,
    pub orders: i64,
    pub transfers: i64,
    pub inventory_rows: i64,
    pub events: i64,
    pub users: i64,
}

/// Optional filters for [`InventoryProjection::inventory_levels`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelFilter {
    pub store_id: Option<StoreId>,
    pub sku_id: Option<SkuId>,
}

/// Organizations, their store/SKU universes and stored credentials.
///
/// Membership checks fail closed: a pair absent from membership is invalid.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn upsert_organization(
        &self,
        req: &UpsertOrganization,
    ) -> StoreResult<(Organization, UpsertStatus)>;

    async fn get_organization(&self, org_id: &OrgId) -> StoreResult<Option<Organization>>;

    /// Cascades to every owned record. Returns `false` when the org did not exist.
    async fn delete_organization(&self, org_id: &OrgId) -> StoreResult<bool>;

    /// Insert the missing pairs only. Returns how many were added.
    async fn add_stores(&self, org_id: &OrgId, stores: &[StoreId]) -> StoreResult<usize>;

    async fn add_skus(&self, org_id: &OrgId, skus: &[SkuId]) -> StoreResult<usize>;

    async fn list_stores(&self, org_id: &OrgId) -> StoreResult<Vec<StoreId>>;

    async fn list_skus(&self, org_id: &OrgId) -> StoreResult<Vec<SkuId>>;

    async fn is_store_valid(&self, org_id: &OrgId, store_id: &StoreId) -> StoreResult<bool>;

    async fn is_sku_valid(&self, org_id: &OrgId, sku_id: &SkuId) -> StoreResult<bool>;

    /// Idempotent on the (case-insensitive) email: an existing user's id is
    /// returned with `false`.
    async fn create_user(&self, user: &NewUser) -> StoreResult<(i64, bool)>;

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn org_counts(&self, org_id: &OrgId) -> StoreResult<OrgCounts>;
}

/// Append-only confirmed orders and transfers.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    /// Insert the order and apply `+qty` to the projection in one transaction.
    ///
    /// A natural-key collision returns the stored row as `AlreadyRecorded`
    /// and leaves the projection untouched.
    async fn record_order(&self, order: ValidOrder) -> StoreResult<RecordOutcome<ConfirmedOrder>>;

    /// Insert the transfer and apply `-qty` at the source, `+qty` at the
    /// destination in one transaction. Negative on-hand is written as-is.
    async fn record_transfer(
        &self,
        transfer: ValidTransfer,
    ) -> StoreResult<RecordOutcome<ConfirmedTransfer>>;

    /// Every confirmed order of the org, oldest first.
    async fn list_orders(&self, org_id: &OrgId) -> StoreResult<Vec<ConfirmedOrder>>;

    async fn list_transfers(&self, org_id: &OrgId) -> StoreResult<Vec<ConfirmedTransfer>>;
}

/// Current on-hand per `(org, store, sku)`.
///
/// Only the ledger writes levels incrementally; `rebuild_levels` is the
/// explicit repair path.
#[async_trait]
pub trait InventoryProjection: Send + Sync {
    async fn inventory_level(
        &self,
        org_id: &OrgId,
        store_id: &StoreId,
        sku_id: &SkuId,
    ) -> StoreResult<Option<InventoryLevel>>;

    async fn inventory_levels(
        &self,
        org_id: &OrgId,
        filter: &LevelFilter,
    ) -> StoreResult<Vec<InventoryLevel>>;

    /// Orders, transfers and levels of the org from one consistent read.
    async fn ledger_snapshot(&self, org_id: &OrgId) -> StoreResult<LedgerSnapshot>;

    /// Recompute every level of the org from the ledger and overwrite the
    /// projection, in one transaction that excludes concurrent confirmations.
    async fn rebuild_levels(&self, org_id: &OrgId) -> StoreResult<RebuiltLevels>;
}

/// Audit sink failure. Never rolls back a confirmation.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Append-only audit event log.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError>;

    /// Events with `id > after`, ascending, at most `limit`.
    async fn poll_events(
        &self,
        org_id: &OrgId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError>;

    /// Latest events first.
    async fn recent_events(&self, org_id: &OrgId, limit: usize) -> Result<Vec<AuditEvent>, AuditError>;

    async fn emit(
        &self,
        org_id: &OrgId,
        event_type: EventType,
        payload: JsonValue,
    ) -> Result<AuditEvent, AuditError> {
        self.append(NewAuditEvent::new(org_id.clone(), event_type, payload))
            .await
    }
}

/// Everything the applier and reconciler need from one backend.
pub trait LedgerStore: TenantDirectory + IdempotencyLedger + InventoryProjection {}

impl<T> LedgerStore for T where T: TenantDirectory + IdempotencyLedger + InventoryProjection + ?Sized {}

#[async_trait]
impl<S> AuditLog for Arc<S>
where
    S: AuditLog + ?Sized,
{
    async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        (**self).append(event).await
    }

    async fn poll_events(
        &self,
        org_id: &OrgId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        (**self).poll_events(org_id, after, limit).await
    }

    async fn recent_events(&self, org_id: &OrgId, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        (**self).recent_events(org_id, limit).await
    }
}
