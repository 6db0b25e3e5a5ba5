//! `stockledger-ledger`: the inventory ledger domain.
//!
//! Pure types and functions only: tenant directory records, confirmation
//! requests and ledger rows, the per-request state machine, batch approvals,
//! inventory effects with the ledger fold, and the audit events the ledger
//! emits. Persistence and orchestration live in `stockledger-infra`.

pub mod batch;
pub mod confirmation;
pub mod directory;
pub mod events;
pub mod outcome;
pub mod projection;

pub use batch::{BatchSummary, LineResult, OrderLine, TransferLine};
pub use confirmation::{
    ConfirmOrder, ConfirmTransfer, ConfirmedOrder, ConfirmedTransfer, OrderKey, TransferKey,
    ValidOrder, ValidTransfer,
};
pub use directory::{NewUser, OrgScope, Organization, UpsertOrganization, UpsertStatus, User};
pub use events::LedgerEvent;
pub use outcome::{ConfirmationState, ConfirmationStatus, Receipt, RecordOutcome};
pub use projection::{
    InventoryEffect, InventoryLevel, LedgerFold, LedgerSnapshot, LevelDelta, LevelDrift,
    add_on_hand, diff_levels, fold_ledger,
};
