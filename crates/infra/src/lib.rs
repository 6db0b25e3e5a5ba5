//! `stockledger-infra`: storage backends and orchestration for the ledger.
//!
//! - [`store`]: storage traits plus in-memory, Postgres and SQLite backends
//! - [`applier`]: the confirmation pipeline (validate, record+project, audit)
//! - [`audit`]: audit log decorator that publishes to an event bus
//! - [`reconcile`]: fold-equivalence check and explicit repair
//! - [`config`]: environment configuration and backend selection

pub mod applier;
pub mod audit;
pub mod config;
pub mod reconcile;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use applier::{ApplyError, LedgerApplier};
pub use audit::PublishingAuditLog;
pub use config::{Backend, ConfigError, DatabaseConfig, LedgerConfig};
pub use reconcile::{ReconcileError, ReconcileReport, Reconciler, RepairReport};
pub use store::{
    AuditError, AuditLog, IdempotencyLedger, InMemoryLedgerStore, InventoryProjection,
    LedgerStore, LevelFilter, OrgCounts, PostgresLedgerStore, RebuiltLevels, SqliteLedgerStore,
    StoreError, StoreResult, TenantDirectory,
};
