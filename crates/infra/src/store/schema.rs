//! Idempotent DDL for the relational backends.
//!
//! Every statement is create-if-absent, so `ensure_*` can run on every
//! start. The three unique constraints (`uq_orders_idem`,
//! `uq_transfers_idem`, `uq_inventory_coord`) carry the idempotency and
//! one-row-per-coordinate guarantees; do not relax them.

use sqlx::{PgPool, SqlitePool};
use tracing::info;

use super::{StoreResult, map_sqlx_error};

pub const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        org_id         TEXT PRIMARY KEY,
        display_name   TEXT,
        notify_webhook TEXT,
        created_at     TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS org_store_map (
        org_id   TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        store_id TEXT NOT NULL,
        PRIMARY KEY (org_id, store_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS org_sku_map (
        org_id TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        sku_id TEXT NOT NULL,
        PRIMARY KEY (org_id, sku_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders_confirmed (
        id          BIGSERIAL PRIMARY KEY,
        org_id      TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        store_id    TEXT NOT NULL,
        sku_id      TEXT NOT NULL,
        qty         BIGINT NOT NULL CHECK (qty > 0),
        approved_at TIMESTAMPTZ NOT NULL,
        approved_by TEXT NOT NULL,
        idem_key    TEXT NOT NULL,
        CONSTRAINT uq_orders_idem UNIQUE (org_id, store_id, sku_id, idem_key),
        FOREIGN KEY (org_id, store_id) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, sku_id) REFERENCES org_sku_map(org_id, sku_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfers_confirmed (
        id          BIGSERIAL PRIMARY KEY,
        org_id      TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        from_store  TEXT NOT NULL,
        to_store    TEXT NOT NULL,
        sku_id      TEXT NOT NULL,
        qty         BIGINT NOT NULL CHECK (qty > 0),
        approved_at TIMESTAMPTZ NOT NULL,
        approved_by TEXT NOT NULL,
        idem_key    TEXT NOT NULL,
        CONSTRAINT uq_transfers_idem UNIQUE (org_id, from_store, to_store, sku_id, idem_key),
        CONSTRAINT ck_transfers_distinct CHECK (from_store <> to_store),
        FOREIGN KEY (org_id, from_store) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, to_store) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, sku_id) REFERENCES org_sku_map(org_id, sku_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inventory_levels (
        org_id     TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        store_id   TEXT NOT NULL,
        sku_id     TEXT NOT NULL,
        on_hand    BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL,
        CONSTRAINT uq_inventory_coord UNIQUE (org_id, store_id, sku_id),
        FOREIGN KEY (org_id, store_id) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, sku_id) REFERENCES org_sku_map(org_id, sku_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id         BIGSERIAL PRIMARY KEY,
        event_id   UUID NOT NULL UNIQUE,
        org_id     TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        ts         TIMESTAMPTZ NOT NULL,
        event_type TEXT NOT NULL,
        payload    JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_org_ts ON events (org_id, ts DESC)",
    "CREATE INDEX IF NOT EXISTS idx_events_org_id ON events (org_id, id)",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id              BIGSERIAL PRIMARY KEY,
        email           TEXT NOT NULL,
        password_digest TEXT NOT NULL,
        org_id          TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        role            TEXT NOT NULL,
        display_name    TEXT,
        created_at      TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_users_email ON users (lower(email))",
];

pub const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        org_id         TEXT PRIMARY KEY,
        display_name   TEXT,
        notify_webhook TEXT,
        created_at     TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS org_store_map (
        org_id   TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        store_id TEXT NOT NULL,
        PRIMARY KEY (org_id, store_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS org_sku_map (
        org_id TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        sku_id TEXT NOT NULL,
        PRIMARY KEY (org_id, sku_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders_confirmed (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id      TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        store_id    TEXT NOT NULL,
        sku_id      TEXT NOT NULL,
        qty         INTEGER NOT NULL CHECK (qty > 0),
        approved_at TEXT NOT NULL,
        approved_by TEXT NOT NULL,
        idem_key    TEXT NOT NULL,
        CONSTRAINT uq_orders_idem UNIQUE (org_id, store_id, sku_id, idem_key),
        FOREIGN KEY (org_id, store_id) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, sku_id) REFERENCES org_sku_map(org_id, sku_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS transfers_confirmed (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id      TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        from_store  TEXT NOT NULL,
        to_store    TEXT NOT NULL,
        sku_id      TEXT NOT NULL,
        qty         INTEGER NOT NULL CHECK (qty > 0),
        approved_at TEXT NOT NULL,
        approved_by TEXT NOT NULL,
        idem_key    TEXT NOT NULL,
        CONSTRAINT uq_transfers_idem UNIQUE (org_id, from_store, to_store, sku_id, idem_key),
        CONSTRAINT ck_transfers_distinct CHECK (from_store <> to_store),
        FOREIGN KEY (org_id, from_store) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, to_store) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, sku_id) REFERENCES org_sku_map(org_id, sku_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS inventory_levels (
        org_id     TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        store_id   TEXT NOT NULL,
        sku_id     TEXT NOT NULL,
        on_hand    INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        CONSTRAINT uq_inventory_coord UNIQUE (org_id, store_id, sku_id),
        FOREIGN KEY (org_id, store_id) REFERENCES org_store_map(org_id, store_id) ON DELETE CASCADE,
        FOREIGN KEY (org_id, sku_id) REFERENCES org_sku_map(org_id, sku_id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id   TEXT NOT NULL UNIQUE,
        org_id     TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        ts         TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload    TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_org_ts ON events (org_id, ts DESC)",
    "CREATE INDEX IF NOT EXISTS idx_events_org_id ON events (org_id, id)",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        email           TEXT NOT NULL,
        password_digest TEXT NOT NULL,
        org_id          TEXT NOT NULL REFERENCES organizations(org_id) ON DELETE CASCADE,
        role            TEXT NOT NULL,
        display_name    TEXT,
        created_at      TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_users_email ON users (lower(email))",
];

pub async fn ensure_postgres(pool: &PgPool) -> StoreResult<()> {
    for statement in POSTGRES_SCHEMA {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    info!(statements = POSTGRES_SCHEMA.len(), "postgres schema ensured");
    Ok(())
}

pub async fn ensure_sqlite(pool: &SqlitePool) -> StoreResult<()> {
    for statement in SQLITE_SCHEMA {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    info!(statements = SQLITE_SCHEMA.len(), "sqlite schema ensured");
    Ok(())
}
