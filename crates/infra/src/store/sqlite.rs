//! SQLite-backed ledger store: the single-file fallback when no Postgres
//! server is configured, and the backend the SQL-level tests run against.
//!
//! Same contract as the Postgres store. SQLite has no JSONB/UUID types, so
//! payloads and event ids are stored as text.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, instrument};

use stockledger_core::{OrgId, SkuId, StoreId};
use stockledger_events::{AuditEvent, NewAuditEvent};
use stockledger_ledger::{
    ConfirmedOrder, ConfirmedTransfer, InventoryEffect, InventoryLevel, LedgerSnapshot,
    LevelDelta, NewUser, Organization, RecordOutcome, UpsertOrganization, UpsertStatus, User,
    ValidOrder, ValidTransfer, add_on_hand,
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
const EVENT_COLUMNS: &str = "id, event_id, org_id, ts, event_type, payload";

#[derive(Debug, Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating the file if needed), then ensure the schema exists.
    ///
    /// In-memory URLs get a single pinned connection: each SQLite connection
    /// to `:memory:` would otherwise see its own empty database.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_sqlite_url", e))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect_with(options)
                .await
        }
        .map_err(|e| map_sqlx_error("connect", e))?;

        schema::ensure_sqlite(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn in_memory() -> StoreResult<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn org_exists(tx: &mut Transaction<'_, Sqlite>, org_id: &OrgId) -> StoreResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM organizations WHERE org_id = ?")
            .bind(org_id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("org_exists", e))?;
        Ok(row.is_some())
    }
}

async fn write_level(
    tx: &mut Transaction<'_, Sqlite>,
    org_id: &OrgId,
    store_id: &StoreId,
    sku_id: &SkuId,
    on_hand: i64,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO inventory_levels (org_id, store_id, sku_id, on_hand, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (org_id, store_id, sku_id)
        DO UPDATE SET
            on_hand = excluded.on_hand,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(org_id.as_str())
    .bind(store_id.as_str())
    .bind(sku_id.as_str())
    .bind(on_hand)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_level", e))?;
    Ok(())
}

/// SQLite turns an overflowing `on_hand + delta` into a REAL, so the sum is
/// checked here. The caller's transaction already holds the write lock.
async fn apply_level_delta(
    tx: &mut Transaction<'_, Sqlite>,
    org_id: &OrgId,
    delta: &LevelDelta,
) -> StoreResult<()> {
    let current: Option<(i64,)> = sqlx::query_as(
        "SELECT on_hand FROM inventory_levels WHERE org_id = ? AND store_id = ? AND sku_id = ?",
    )
    .bind(org_id.as_str())
    .bind(delta.store_id.as_str())
    .bind(delta.sku_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("read_level", e))?;

    let current = current.map_or(0, |(on_hand,)| on_hand);
    let next = add_on_hand(&delta.store_id, &delta.sku_id, current, delta.delta)
        .map_err(StoreError::out_of_range)?;
    write_level(tx, org_id, &delta.store_id, &delta.sku_id, next).await
}

async fn apply_effect(
    tx: &mut Transaction<'_, Sqlite>,
    org_id: &OrgId,
    effect: &InventoryEffect,
) -> StoreResult<()> {
    for delta in effect.deltas() {
        apply_level_delta(tx, org_id, &delta).await?;
    }
    Ok(())
}

async fn select_orders<'e, E>(executor: E, org_id: &OrgId) -> StoreResult<Vec<ConfirmedOrder>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<OrderRow> = sqlx::query_as(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders_confirmed WHERE org_id = ? ORDER BY id"
    ))
    .bind(org_id.as_str())
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list_orders", e))?;
    collect(rows)
}

async fn select_transfers<'e, E>(executor: E, org_id: &OrgId) -> StoreResult<Vec<ConfirmedTransfer>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows: Vec<TransferRow> = sqlx::query_as(&format!(
        "SELECT {TRANSFER_COLUMNS} FROM transfers_confirmed WHERE org_id = ? ORDER BY id"
    ))
    .bind(org_id.as_str())
    .fetch_all(executor)
    .await
    .map_err(|e| map_sqlx_error("list_transfers", e))?;
    collect(rows)
}

#[async_trait]
impl TenantDirectory for SqliteLedgerStore {
    #[instrument(skip(self, req), fields(org_id = %req.org_id), err)]
    async fn upsert_organization(
        &self,
        req: &UpsertOrganization,
    ) -> StoreResult<(Organization, UpsertStatus)> {
        let mut tx = self.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO organizations (org_id, display_name, notify_webhook, created_at)
            VALUES (?, ?, ?, ?)
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
            sqlx::query("UPDATE organizations SET display_name = ?2, notify_webhook = ?3 WHERE org_id = ?1")
                .bind(req.org_id.as_str())
                .bind(req.display_name.as_deref())
                .bind(req.notify_webhook.as_deref())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("update_organization", e))?;
        }

        let row: OrganizationRow = sqlx::query_as(
            "SELECT org_id, display_name, notify_webhook, created_at FROM organizations WHERE org_id = ?",
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
            "SELECT org_id, display_name, notify_webhook, created_at FROM organizations WHERE org_id = ?",
        )
        .bind(org_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_organization", e))?;
        row.map(Organization::try_from).transpose()
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    async fn delete_organization(&self, org_id: &OrgId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM organizations WHERE org_id = ?")
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
                "INSERT INTO org_store_map (org_id, store_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
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
                "INSERT INTO org_sku_map (org_id, sku_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
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
            sqlx::query_as("SELECT store_id FROM org_store_map WHERE org_id = ? ORDER BY store_id")
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
            sqlx::query_as("SELECT sku_id FROM org_sku_map WHERE org_id = ? ORDER BY sku_id")
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
            sqlx::query_as("SELECT 1 FROM org_store_map WHERE org_id = ? AND store_id = ?")
                .bind(org_id.as_str())
                .bind(store_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("is_store_valid", e))?;
        Ok(row.is_some())
    }

    async fn is_sku_valid(&self, org_id: &OrgId, sku_id: &SkuId) -> StoreResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM org_sku_map WHERE org_id = ? AND sku_id = ?")
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
            VALUES (?, ?, ?, ?, ?, ?)
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
                    sqlx::query_as("SELECT id FROM users WHERE lower(email) = lower(?)")
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
            WHERE lower(email) = lower(?)
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
                (SELECT COUNT(*) FROM org_store_map WHERE org_id = ?1)       AS stores,
                (SELECT COUNT(*) FROM org_sku_map WHERE org_id = ?1)         AS skus,
                (SELECT COUNT(*) FROM orders_confirmed WHERE org_id = ?1)    AS orders,
                (SELECT COUNT(*) FROM transfers_confirmed WHERE org_id = ?1) AS transfers,
                (SELECT COUNT(*) FROM inventory_levels WHERE org_id = ?1)    AS inventory_rows,
                (SELECT COUNT(*) FROM events WHERE org_id = ?1)              AS events,
                (SELECT COUNT(*) FROM users WHERE org_id = ?1)               AS users
            "#,
        )
        .bind(org_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("org_counts", e))
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteLedgerStore {
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
            VALUES (?, ?, ?, ?, ?, ?, ?)
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
            WHERE org_id = ? AND store_id = ? AND sku_id = ? AND idem_key = ?
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
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
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
            WHERE org_id = ? AND from_store = ? AND to_store = ? AND sku_id = ? AND idem_key = ?
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
impl InventoryProjection for SqliteLedgerStore {
    async fn inventory_level(
        &self,
        org_id: &OrgId,
        store_id: &StoreId,
        sku_id: &SkuId,
    ) -> StoreResult<Option<InventoryLevel>> {
        let row: Option<LevelRow> = sqlx::query_as(
            r#"
            SELECT org_id, store_id, sku_id, on_hand FROM inventory_levels
            WHERE org_id = ? AND store_id = ? AND sku_id = ?
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
            WHERE org_id = ?1
                AND (?2 IS NULL OR store_id = ?2)
                AND (?3 IS NULL OR sku_id = ?3)
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
        if !Self::org_exists(&mut tx, org_id).await? {
            return Err(StoreError::UnknownOrg(org_id.clone()));
        }
        let orders = select_orders(&mut *tx, org_id).await?;
        let transfers = select_transfers(&mut *tx, org_id).await?;
        let levels: Vec<LevelRow> = sqlx::query_as(
            r#"
            SELECT org_id, store_id, sku_id, on_hand FROM inventory_levels
            WHERE org_id = ? ORDER BY store_id, sku_id
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
        // Writing first takes the database write lock before the ledger is read.
        let previous: Vec<LevelRow> = sqlx::query_as(
            "DELETE FROM inventory_levels WHERE org_id = ? RETURNING org_id, store_id, sku_id, on_hand",
        )
        .bind(org_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("clear_levels", e))?;
        if !Self::org_exists(&mut tx, org_id).await? {
            return Err(StoreError::UnknownOrg(org_id.clone()));
        }

        let snapshot = LedgerSnapshot {
            orders: select_orders(&mut *tx, org_id).await?,
            transfers: select_transfers(&mut *tx, org_id).await?,
            levels: collect(previous)?,
        };
        let (fold, drift) = snapshot.drift().map_err(StoreError::out_of_range)?;
        let levels = fold.into_levels(org_id);
        for level in &levels {
            write_level(&mut tx, org_id, &level.store_id, &level.sku_id, level.on_hand).await?;
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
impl AuditLog for SqliteLedgerStore {
    #[instrument(skip(self, event), fields(org_id = %event.org_id, event_type = %event.event_type), err)]
    async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        let payload = serde_json::to_string(&event.payload)?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO events (event_id, org_id, ts, event_type, payload)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.org_id.as_str())
        // Fixed width so that ordering by the text column is ordering by time.
        .bind(event.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(event.event_type.as_str())
        .bind(payload)
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
            "SELECT {EVENT_COLUMNS} FROM events WHERE org_id = ? AND id > ? ORDER BY id ASC LIMIT ?"
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
            "SELECT {EVENT_COLUMNS} FROM events WHERE org_id = ? ORDER BY ts DESC, id DESC LIMIT ?"
        ))
        .bind(org_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_events", e))?;
        Ok(collect(rows)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::{ApproverId, IdempotencyKey, Quantity};

    fn org() -> OrgId {
        OrgId::new("A").unwrap()
    }

    fn store(s: &str) -> StoreId {
        StoreId::new(s).unwrap()
    }

    fn sku() -> SkuId {
        SkuId::new("X").unwrap()
    }

    async fn seeded() -> SqliteLedgerStore {
        let db = SqliteLedgerStore::in_memory().await.unwrap();
        db.upsert_organization(&UpsertOrganization {
            org_id: org(),
            display_name: Some("Org A".into()),
            notify_webhook: None,
        })
        .await
        .unwrap();
        db.add_stores(&org(), &[store("S1"), store("S2")]).await.unwrap();
        db.add_skus(&org(), &[sku()]).await.unwrap();
        db
    }

    fn order(key: &str, st: &str, qty: i64) -> ValidOrder {
        ValidOrder {
            org_id: org(),
            store_id: store(st),
            sku_id: sku(),
            quantity: Quantity::new(qty).unwrap(),
            approved_at: Utc::now(),
            approved_by: ApproverId::new("ops@a.test").unwrap(),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    fn transfer(key: &str, from: &str, to: &str, qty: i64) -> ValidTransfer {
        ValidTransfer {
            org_id: org(),
            from_store: store(from),
            to_store: store(to),
            sku_id: sku(),
            quantity: Quantity::new(qty).unwrap(),
            approved_at: Utc::now(),
            approved_by: ApproverId::new("ops@a.test").unwrap(),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    async fn on_hand(db: &SqliteLedgerStore, st: &str) -> Option<i64> {
        db.inventory_level(&org(), &store(st), &sku())
            .await
            .unwrap()
            .map(|l| l.on_hand)
    }

    #[tokio::test]
    async fn schema_is_safe_to_reapply() {
        let db = SqliteLedgerStore::in_memory().await.unwrap();
        schema::ensure_sqlite(db.pool()).await.unwrap();
        schema::ensure_sqlite(db.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn upsert_reports_created_then_updated() {
        let db = seeded().await;
        let (org_row, status) = db
            .upsert_organization(&UpsertOrganization {
                org_id: org(),
                display_name: Some("Renamed".into()),
                notify_webhook: Some("https://hooks.example/a".into()),
            })
            .await
            .unwrap();
        assert_eq!(status, UpsertStatus::Updated);
        assert_eq!(org_row.display_name.as_deref(), Some("Renamed"));
    }

    #[tokio::test]
    async fn order_then_duplicate_then_transfer() {
        let db = seeded().await;

        let first = db.record_order(order("k1", "S1", 10)).await.unwrap();
        assert!(first.is_applied());
        assert_eq!(on_hand(&db, "S1").await, Some(10));

        let replay = db.record_order(order("k1", "S1", 10)).await.unwrap();
        assert!(!replay.is_applied());
        assert_eq!(replay.record().id, first.record().id);
        assert_eq!(replay.record().approved_at, first.record().approved_at);
        assert_eq!(on_hand(&db, "S1").await, Some(10));
        assert_eq!(db.list_orders(&org()).await.unwrap().len(), 1);

        db.record_transfer(transfer("k2", "S1", "S2", 4)).await.unwrap();
        assert_eq!(on_hand(&db, "S1").await, Some(6));
        assert_eq!(on_hand(&db, "S2").await, Some(4));
    }

    #[tokio::test]
    async fn negative_on_hand_is_stored() {
        let db = seeded().await;
        db.record_transfer(transfer("t1", "S1", "S2", 5)).await.unwrap();
        assert_eq!(on_hand(&db, "S1").await, Some(-5));
    }

    #[tokio::test]
    async fn foreign_keys_reject_non_member_store() {
        let db = seeded().await;
        let err = db.record_order(order("k9", "S9", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)), "{err:?}");
        assert_eq!(db.org_counts(&org()).await.unwrap().orders, 0);
        assert_eq!(on_hand(&db, "S9").await, None);
    }

    #[tokio::test]
    async fn check_constraint_rejects_same_store_transfer() {
        let db = seeded().await;
        let err = db.record_transfer(transfer("t1", "S1", "S1", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)), "{err:?}");
        assert_eq!(db.org_counts(&org()).await.unwrap().inventory_rows, 0);
    }

    async fn tamper(db: &SqliteLedgerStore, st: &str, on_hand: i64) {
        sqlx::query(
            r#"
            INSERT INTO inventory_levels (org_id, store_id, sku_id, on_hand, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (org_id, store_id, sku_id) DO UPDATE SET on_hand = excluded.on_hand
            "#,
        )
        .bind(org().as_str())
        .bind(st)
        .bind(sku().as_str())
        .bind(on_hand)
        .bind(Utc::now())
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn rebuild_levels_rewrites_the_projection() {
        let db = seeded().await;
        db.record_order(order("k1", "S1", 10)).await.unwrap();
        db.record_transfer(transfer("t1", "S1", "S2", 4)).await.unwrap();
        tamper(&db, "S1", 0).await;
        sqlx::query("DELETE FROM inventory_levels WHERE store_id = 'S2'")
            .execute(db.pool())
            .await
            .unwrap();

        let snapshot = db.ledger_snapshot(&org()).await.unwrap();
        assert_eq!((snapshot.orders.len(), snapshot.transfers.len()), (1, 1));
        assert_eq!(snapshot.levels.len(), 1);

        let rebuilt = db.rebuild_levels(&org()).await.unwrap();
        assert_eq!(rebuilt.rows, 2);
        assert_eq!(rebuilt.drift.len(), 2);
        assert_eq!(on_hand(&db, "S1").await, Some(6));
        assert_eq!(on_hand(&db, "S2").await, Some(4));

        let again = db.rebuild_levels(&org()).await.unwrap();
        assert!(again.drift.is_empty());
    }

    #[tokio::test]
    async fn rebuild_and_snapshot_reject_unknown_org() {
        let db = seeded().await;
        let ghost = OrgId::new("ghost").unwrap();
        assert!(matches!(
            db.rebuild_levels(&ghost).await,
            Err(StoreError::UnknownOrg(_))
        ));
        assert!(matches!(
            db.ledger_snapshot(&ghost).await,
            Err(StoreError::UnknownOrg(_))
        ));
    }

    #[tokio::test]
    async fn overflowing_order_rolls_back_and_keeps_an_integer() {
        let db = seeded().await;
        db.record_order(order("full", "S1", i64::MAX)).await.unwrap();

        let err = db.record_order(order("one-more", "S1", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)), "{err:?}");
        assert!(!err.is_retryable());

        let (kind,): (String,) = sqlx::query_as(
            "SELECT typeof(on_hand) FROM inventory_levels WHERE store_id = 'S1'",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();
        assert_eq!(kind, "integer");
        assert_eq!(on_hand(&db, "S1").await, Some(i64::MAX));
        assert_eq!(db.list_orders(&org()).await.unwrap().len(), 1);

        // The key was not consumed and the store keeps working.
        db.record_transfer(transfer("drain", "S1", "S2", 1)).await.unwrap();
        let retried = db.record_order(order("one-more", "S1", 1)).await.unwrap();
        assert!(retried.is_applied());
        assert_eq!(on_hand(&db, "S1").await, Some(i64::MAX));
    }

    #[tokio::test]
    async fn overflowing_transfer_touches_neither_store() {
        let db = seeded().await;
        db.record_order(order("full", "S2", i64::MAX)).await.unwrap();
        let err = db.record_transfer(transfer("t1", "S1", "S2", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)), "{err:?}");
        assert_eq!(on_hand(&db, "S1").await, None);
        assert_eq!(on_hand(&db, "S2").await, Some(i64::MAX));
        assert_eq!(db.org_counts(&org()).await.unwrap().transfers, 0);
    }

    #[tokio::test]
    async fn events_poll_by_cursor_and_list_recent_first() {
        let db = seeded().await;
        for i in 0..3 {
            db.emit(&org(), "custom".into(), serde_json::json!({ "n": i }))
                .await
                .unwrap();
        }
        let page = db.poll_events(&org(), 0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].payload["n"], 0);
        let rest = db.poll_events(&org(), page[1].id, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload["n"], 2);

        let recent = db.recent_events(&org(), 1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, rest[0].id);
    }

    #[tokio::test]
    async fn delete_cascades_to_owned_rows() {
        let db = seeded().await;
        db.record_order(order("k1", "S1", 10)).await.unwrap();
        db.emit(&org(), "custom".into(), serde_json::json!({})).await.unwrap();
        let user = NewUser::new("ana@a.test", "pw", org(), Some("admin"), None).unwrap();
        db.create_user(&user).await.unwrap();

        assert!(db.delete_organization(&org()).await.unwrap());
        assert_eq!(db.org_counts(&org()).await.unwrap(), OrgCounts::default());
    }

    #[tokio::test]
    async fn user_creation_is_idempotent_on_email() {
        let db = seeded().await;
        let user = NewUser::new("Ana@A.test", "pw", org(), None, None).unwrap();
        let (id, created) = db.create_user(&user).await.unwrap();
        assert!(created);
        assert_eq!(db.create_user(&user).await.unwrap(), (id, false));
        let found = db.find_user_by_email("ANA@a.test").await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.verify_password("pw"));
    }

    #[tokio::test]
    async fn membership_for_unknown_org_is_rejected() {
        let db = seeded().await;
        let err = db
            .add_stores(&OrgId::new("nope").unwrap(), &[store("S1")])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::UnknownOrg(OrgId::new("nope").unwrap()));
    }
}
