//! Postgres-backed ledger store.
//!
//! ## Idempotency
//!
//! `record_order`/`record_transfer` run
//! `INSERT ... ON CONFLICT (<natural key>) DO NOTHING RETURNING ...` and apply
//! the inventory upsert in the same transaction. No returned row means the
//! key is taken: the transaction is rolled back and the existing row is read
//! back as `AlreadyRecorded`. Two concurrent inserts of one key serialize on
//! the unique index; the loser sees the winner's row once it commits.
//!
//! ## Overflow
//!
//! Level arithmetic happens in SQL on `BIGINT`; an overflow raises `22003`,
//! which maps to the non-retryable `StoreError::OutOfRange` and aborts the
//! whole confirmation.
//!
//! ## Rebuild
//!
//! `rebuild_levels` takes `SHARE ROW EXCLUSIVE` on both ledger tables, which
//! waits for in-flight confirmations and blocks new ones (of every org) until
//! the projection is rewritten.
//!
//! ## Tenant isolation
//!
//! Every query filters on `org_id`, and every owned table references
//! `organizations(org_id) ON DELETE CASCADE`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use stockledger_core::{OrgId, SkuId, StoreId};
use stockledger_events::{AuditEvent, NewAuditEvent};
use stockledger_ledger::{
    ConfirmedOrder, ConfirmedTransfer, InventoryEffect, InventoryLevel, LedgerSnapshot, NewUser,
    Organization, RecordOutcome, UpsertOrganization, UpsertStatus, User, ValidOrder, ValidTransfer,
};

use super::rows::{
    EventRow, LevelRow, OrderRow, OrganizationRow, TransferRow, UserRow, collect,
};
use super::{
    AuditError, AuditLog, IdempotencyLedger, InventoryProjection, LevelFilter, OrgCounts,
    RebuiltLevels, StoreError, StoreResult, TenantDirectory, map_sqlx_error, schema,
};

const ORDER_COLUMNS: &str =
    "id, org_id, store_id, sku_id, qty, approved_at, approved_by, idem_key";
const TRANSFER_COLUMNS: &str =
    "id, org_id, from_store, to_store, sku_id, qty, approved_at, approved_by, idem_key";
const EVENT_COLUMNS: &str =
    "id, event_id::text AS event_id, org_id, ts, event_type, payload::text AS payload";

#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options =
            PgConnectOptions::from_str(url).map_err(|e| map_sqlx_error("parse_postgres_url", e))?;
        Self::connect_with(options, max_connections).await
    }

    /// Connect, then ensure the schema exists.
    pub async fn connect_with(options: PgConnectOptions, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        schema::ensure_postgres(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn org_exists(tx: &mut Transaction<'_, Postgres>, org_id: &OrgId) -> StoreResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM organizations WHERE org_id = $1")
            .bind(org_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("org_exists", e))?;
        Ok(row.is_some())
    }
}

/// Add `delta` to one coordinate, creating the row at zero first if absent.
async fn apply_level_delta(
    tx: &mut Transaction<'_, Postgres>,
    org_id: &OrgId,
    store_id: &StoreId,
    sku_id: &SkuId,
    delta: i64,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO inventory_levels (org_id, store_id, sku_id, on_hand, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (org_id, store_id, sku_id)
        DO UPDATE SET
            on_hand = inventory_levels.on_hand + EXCLUDED.on_hand,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(org_id.as_str())
    .bind(store_id.as_str())
    .bind(sku_id.as_str())
    .bind(delta)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("apply_level_delta", e))?;
    Ok(())
}

/// Deltas arrive ordered by store id, so concurrent transfers lock level
/// rows in one global order.
async fn apply_effect(
    tx: &mut Transaction<'_, Postgres>,
    org_id: &OrgId,
    effect: &InventoryEffect,
) -> StoreResult<()> {
    for d in effect.deltas() {
        apply_level_delta(tx, org_id, &d.store_id, &d.sku_id, d.delta).await?;
    }
    Ok(())
}

async fn select_orders<'e, E>(executor: E, org_id: &OrgId) -> StoreResult<Vec<ConfirmedOrder>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let rows: Vec<OrderRow> = sqlx::query_as(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders_confirmed WHERE org_id = $1 ORDER BY id"
    ))
    .bind(org_id.as_str())
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list_orders", e))?;
    collect(rows)
}

async fn select_transfers<'e, E>(executor: E, org_id: &OrgId) -> StoreResult<Vec<ConfirmedTransfer>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let rows: Vec<TransferRow> = sqlx::query_as(&format!(
        "SELECT {TRANSFER_COLUMNS} FROM transfers_confirmed WHERE org_id = $1 ORDER BY id"
    ))
    .bind(org_id.as_str())
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list_transfers", e))?;
    collect(rows)
}

async fn set_level(
    tx: &mut Transaction<'_, Postgres>,
    level: &InventoryLevel,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO inventory_levels (org_id, store_id, sku_id, on_hand, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(level.org_id.as_str())
    .bind(level.store_id.as_str())
    .bind(level.sku_id.as_str())
    .bind(level.on_hand)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("set_level", e))?;
    Ok(())
}

#[async_trait]
impl TenantDirectory for PostgresLedgerStore {
    #[instrument(skip(self, req), fields(org_id = %req.org_id), err)]
    async fn upsert_organization(
        &self,
        req: &UpsertOrganization,
    ) -> StoreResult<(Organization, UpsertStatus)> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO organizations (org_id, display_name, notify_webhook, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (org_id) DO NOTHING
            "#,
        )
        .bind(req.org_id.as_str())
        .bind(req.display_name.as_deref())
        .bind(req.notify_webhook.as_deref())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_organization", e))?
        .rows_affected()
            > 0;

        if !inserted {
            sqlx::query(
                "UPDATE organizations SET display_name = $2, notify_webhook = $3 WHERE org_id = $1",
            )
            .bind(req.org_id.as_str())
            .bind(req.display_name.as_deref())
            .bind(req.notify_webhook.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_organization", e))?;
        }

        let row: OrganizationRow = sqlx::query_as(
            "SELECT org_id, display_name, notify_webhook, created_at FROM organizations WHERE org_id = $1",
        )
        .bind(req.org_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_organization", e))?;
        let org = Organization::try_from(row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let status = if inserted {
            UpsertStatus::Created
        } else {
            UpsertStatus::Updated
        };
        Ok((org, status))
    }

    async fn get_organization(&self, org_id: &OrgId) -> StoreResult<Option<Organization>> {
        let row: Option<OrganizationRow> = sqlx::query_as(
            "SELECT org_id, display_name, notify_webhook, created_at FROM organizations WHERE org_id = $1",
        )
        .bind(org_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_organization", e))?;
        row.map(Organization::try_from).transpose()
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn delete_organization(&self, org_id: &OrgId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM organizations WHERE org_id = $1")
            .bind(org_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_organization", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, stores), fields(org_id = %org_id, requested = stores.len()), err)]
    async fn add_stores(&self, org_id: &OrgId, stores: &[StoreId]) -> StoreResult<usize> {
        let mut tx = self.begin().await?;
        if !Self::org_exists(&mut tx, org_id).await? {
            return Err(StoreError::UnknownOrg(org_id.clone()));
        }
        let mut added = 0;
        for store_id in stores {
            added += sqlx::query(
                "INSERT INTO org_store_map (org_id, store_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(org_id.as_str())
            .bind(store_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("add_store", e))?
            .rows_affected() as usize;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(added)
    }

    #[instrument(skip(self, skus), fields(org_id = %org_id, requested = skus.len()), err)]
    async fn add_skus(&self, org_id: &OrgId, skus: &[SkuId]) -> StoreResult<usize> {
        let mut tx = self.begin().await?;
        if !Self::org_exists(&mut tx, org_id).await? {
            return Err(StoreError::UnknownOrg(org_id.clone()));
        }
        let mut added = 0;
        for sku_id in skus {
            added += sqlx::query(
                "INSERT INTO org_sku_map (org_id, sku_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(org_id.as_str())
            .bind(sku_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("add_sku", e))?
            .rows_affected() as usize;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(added)
    }

    async fn list_stores(&self, org_id: &OrgId) -> StoreResult<Vec<StoreId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT store_id FROM org_store_map WHERE org_id = $1 ORDER BY store_id")
                .bind(org_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_stores", e))?;
        rows.into_iter()
            .map(|(s,)| StoreId::new(s).map_err(|e| StoreError::Decode(e.to_string())))
            .collect()
    }

    async fn list_skus(&self, org_id: &OrgId) -> StoreResult<Vec<SkuId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT sku_id FROM org_sku_map WHERE org_id = $1 ORDER BY sku_id")
                .bind(org_id.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_skus", e))?;
        rows.into_iter()
            .map(|(s,)| SkuId::new(s).map_err(|e| StoreError::Decode(e.to_string())))
            .collect()
    }

    async fn is_store_valid(&self, org_id: &OrgId, store_id: &StoreId) -> StoreResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM org_store_map WHERE org_id = $1 AND store_id = $2")
                .bind(org_id.as_str())
                .bind(store_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("is_store_valid", e))?;
        Ok(row.is_some())
    }

    async fn is_sku_valid(&self, org_id: &OrgId, sku_id: &SkuId) -> StoreResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM org_sku_map WHERE org_id = $1 AND sku_id = $2")
                .bind(org_id.as_str())
                .bind(sku_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("is_sku_valid", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self, user), fields(org_id = %user.org_id), err)]
    async fn create_user(&self, user: &NewUser) -> StoreResult<(i64, bool)> {
        let mut tx = self.begin().await?;
        if !Self::org_exists(&mut tx, &user.org_id).await? {
            return Err(StoreError::UnknownOrg(user.org_id.clone()));
        }
        let inserted: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO users (email, password_digest, org_id, role, display_name, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&user.email)
        .bind(&user.password_digest)
        .bind(user.org_id.as_str())
        .bind(&user.role)
        .bind(user.display_name.as_deref())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;

        let outcome = match inserted {
            Some((id,)) => (id, true),
            None => {
                let (id,): (i64,) =
                    sqlx::query_as("SELECT id FROM users WHERE lower(email) = lower($1)")
                        .bind(&user.email)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| map_sqlx_error("select_user", e))?;
                (id, false)
            }
        };
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, email, password_digest, org_id, role, display_name, created_at
            FROM users
            WHERE lower(email) = lower($1)
            "#,
        )
        .bind(email.trim())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_user_by_email", e))?;
        row.map(User::try_from).transpose()
    }

    async fn org_counts(&self, org_id: &OrgId) -> StoreResult<OrgCounts> {
        sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM org_store_map WHERE org_id = $1)       AS stores,
                (SELECT COUNT(*) FROM org_sku_map WHERE org_id = $1)         AS skus,
                (SELECT COUNT(*) FROM orders_confirmed WHERE org_id = $1)    AS orders,
                (SELECT COUNT(*) FROM transfers_confirmed WHERE org_id = $1) AS transfers,
                (SELECT COUNT(*) FROM inventory_levels WHERE org_id = $1)    AS inventory_rows,
                (SELECT COUNT(*) FROM events WHERE org_id = $1)              AS events,
                (SELECT COUNT(*) FROM users WHERE org_id = $1)               AS users
            "#,
        )
        .bind(org_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("org_counts", e))
    }
}

#[async_trait]
impl IdempotencyLedger for PostgresLedgerStore {
    #[instrument(
        skip(self, order),
        fields(
            org_id = %order.org_id,
            store_id = %order.store_id,
            sku_id = %order.sku_id,
            idem_key = %order.idempotency_key
        ),
        err
    )]
    async fn record_order(&self, order: ValidOrder) -> StoreResult<RecordOutcome<ConfirmedOrder>> {
        let mut tx = self.begin().await?;
        let inserted: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO orders_confirmed (org_id, store_id, sku_id, qty, approved_at, approved_by, idem_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (org_id, store_id, sku_id, idem_key) DO NOTHING
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order.org_id.as_str())
        .bind(order.store_id.as_str())
        .bind(order.sku_id.as_str())
        .bind(order.quantity.units())
        .bind(order.approved_at)
        .bind(order.approved_by.as_str())
        .bind(order.idempotency_key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        if let Some(row) = inserted {
            let record = ConfirmedOrder::try_from(row)?;
            apply_effect(&mut tx, &record.org_id, &InventoryEffect::from(&record)).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(RecordOutcome::Applied(record));
        }

        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        let existing: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders_confirmed
            WHERE org_id = $1 AND store_id = $2 AND sku_id = $3 AND idem_key = $4
            "#
        ))
        .bind(order.org_id.as_str())
        .bind(order.store_id.as_str())
        .bind(order.sku_id.as_str())
        .bind(order.idempotency_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_order", e))?;

        match existing {
            Some(row) => {
                debug!("order already recorded");
                Ok(RecordOutcome::AlreadyRecorded(ConfirmedOrder::try_from(row)?))
            }
            None => Err(StoreError::Conflict(format!(
                "order key {} collided but no row was found",
                order.idempotency_key
            ))),
        }
    }

    #[instrument(
        skip(self, transfer),
        fields(
            org_id = %transfer.org_id,
            from_store = %transfer.from_store,
            to_store = %transfer.to_store,
            sku_id = %transfer.sku_id,
            idem_key = %transfer.idempotency_key
        ),
        err
    )]
    async fn record_transfer(
        &self,
        transfer: ValidTransfer,
    ) -> StoreResult<RecordOutcome<ConfirmedTransfer>> {
        let mut tx = self.begin().await?;
        let inserted: Option<TransferRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO transfers_confirmed
                (org_id, from_store, to_store, sku_id, qty, approved_at, approved_by, idem_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (org_id, from_store, to_store, sku_id, idem_key) DO NOTHING
            RETURNING {TRANSFER_COLUMNS}
            "#
        ))
        .bind(transfer.org_id.as_str())
        .bind(transfer.from_store.as_str())
        .bind(transfer.to_store.as_str())
        .bind(transfer.sku_id.as_str())
        .bind(transfer.quantity.units())
        .bind(transfer.approved_at)
        .bind(transfer.approved_by.as_str())
        .bind(transfer.idempotency_key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_transfer", e))?;

        if let Some(row) = inserted {
            let record = ConfirmedTransfer::try_from(row)?;
            apply_effect(&mut tx, &record.org_id, &InventoryEffect::from(&record)).await?;
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(RecordOutcome::Applied(record));
        }

        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))?;
        let existing: Option<TransferRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSFER_COLUMNS} FROM transfers_confirmed
            WHERE org_id = $1 AND from_store = $2 AND to_store = $3 AND sku_id = $4 AND idem_key = $5
            "#
        ))
        .bind(transfer.org_id.as_str())
        .bind(transfer.from_store.as_str())
        .bind(transfer.to_store.as_str())
        .bind(transfer.sku_id.as_str())
        .bind(transfer.idempotency_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_transfer", e))?;

        match existing {
            Some(row) => {
                debug!("transfer already recorded");
                Ok(RecordOutcome::AlreadyRecorded(ConfirmedTransfer::try_from(row)?))
            }
            None => Err(StoreError::Conflict(format!(
                "transfer key {} collided but no row was found",
                transfer.idempotency_key
            ))),
        }
    }

    async fn list_orders(&self, org_id: &OrgId) -> StoreResult<Vec<ConfirmedOrder>> {
        select_orders(&self.pool, org_id).await
    }

    async fn list_transfers(&self, org_id: &OrgId) -> StoreResult<Vec<ConfirmedTransfer>> {
        select_transfers(&self.pool, org_id).await
    }
}

#[async_trait]
impl InventoryProjection for PostgresLedgerStore {
    async fn inventory_level(
        &self,
        org_id: &OrgId,
        store_id: &StoreId,
        sku_id: &SkuId,
    ) -> StoreResult<Option<InventoryLevel>> {
        let row: Option<LevelRow> = sqlx::query_as(
            r#"
            SELECT org_id, store_id, sku_id, on_hand FROM inventory_levels
            WHERE org_id = $1 AND store_id = $2 AND sku_id = $3
            "#,
        )
        .bind(org_id.as_str())
        .bind(store_id.as_str())
        .bind(sku_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("inventory_level", e))?;
        row.map(InventoryLevel::try_from).transpose()
    }

    async fn inventory_levels(
        &self,
        org_id: &OrgId,
        filter: &LevelFilter,
    ) -> StoreResult<Vec<InventoryLevel>> {
        let rows: Vec<LevelRow> = sqlx::query_as(
            r#"
            SELECT org_id, store_id, sku_id, on_hand FROM inventory_levels
            WHERE org_id = $1
                AND ($2::text IS NULL OR store_id = $2)
                AND ($3::text IS NULL OR sku_id = $3)
            ORDER BY store_id, sku_id
            "#,
        )
        .bind(org_id.as_str())
        .bind(filter.store_id.as_ref().map(|s| s.as_str()))
        .bind(filter.sku_id.as_ref().map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("inventory_levels", e))?;
        collect(rows)
    }

    async fn ledger_snapshot(&self, org_id: &OrgId) -> StoreResult<LedgerSnapshot> {
        let mut tx = self.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("snapshot_isolation", e))?;
        if !Self::org_exists(&mut tx, org_id).await? {
            return Err(StoreError::UnknownOrg(org_id.clone()));
        }
        let orders = select_orders(&mut *tx, org_id).await?;
        let transfers = select_transfers(&mut *tx, org_id).await?;
        let levels: Vec<LevelRow> = sqlx::query_as(
            r#"
            SELECT org_id, store_id, sku_id, on_hand FROM inventory_levels
            WHERE org_id = $1 ORDER BY store_id, sku_id
            "#,
        )
        .bind(org_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("snapshot_levels", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(LedgerSnapshot {
            orders,
            transfers,
            levels: collect(levels)?,
        })
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn rebuild_levels(&self, org_id: &OrgId) -> StoreResult<RebuiltLevels> {
        let mut tx = self.begin().await?;
        if !Self::org_exists(&mut tx, org_id).await? {
            return Err(StoreError::UnknownOrg(org_id.clone()));
        }
        sqlx::query("LOCK TABLE orders_confirmed, transfers_confirmed IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_ledger", e))?;

        let orders = select_orders(&mut *tx, org_id).await?;
        let transfers = select_transfers(&mut *tx, org_id).await?;
        let previous: Vec<LevelRow> = sqlx::query_as(
            "DELETE FROM inventory_levels WHERE org_id = $1 RETURNING org_id, store_id, sku_id, on_hand",
        )
        .bind(org_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("clear_levels", e))?;

        let snapshot = LedgerSnapshot {
            orders,
            transfers,
            levels: collect(previous)?,
        };
        let (fold, drift) = snapshot.drift().map_err(StoreError::out_of_range)?;
        let levels = fold.into_levels(org_id);
        for level in &levels {
            set_level(&mut tx, level).await?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(rows = levels.len(), drift = drift.len(), "levels rebuilt");
        Ok(RebuiltLevels {
            drift,
            rows: levels.len(),
        })
    }
}

#[async_trait]
impl AuditLog for PostgresLedgerStore {
    #[instrument(skip(self, event), fields(org_id = %event.org_id, event_type = %event.event_type), err)]
    async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO events (event_id, org_id, ts, event_type, payload)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(event.event_id)
        .bind(event.org_id.as_str())
        .bind(event.occurred_at)
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_event", e))?;
        Ok(AuditEvent::from_new(id, event))
    }

    async fn poll_events(
        &self,
        org_id: &OrgId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE org_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3"
        ))
        .bind(org_id.as_str())
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("poll_events", e))?;
        Ok(collect(rows)?)
    }

    async fn recent_events(&self, org_id: &OrgId, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE org_id = $1 ORDER BY ts DESC, id DESC LIMIT $2"
        ))
        .bind(org_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_events", e))?;
        Ok(collect(rows)?)
    }
}
