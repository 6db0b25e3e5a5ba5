//! Confirmation pipeline.
//!
//! ```text
//! request
//!   ↓ validate (quantity, from ≠ to, org/store/SKU scope)   → Rejected
//!   ↓ insert ledger row + apply inventory effect (one tx)   → Duplicate on key collision
//!   ↓ append audit event (best-effort, after commit)
//! Receipt
//! ```
//!
//! Validation never writes. The storage unique constraint is the only
//! idempotency guard, so concurrent duplicates resolve to exactly one
//! `Recorded` receipt without any application-level lock. An audit failure
//! is logged and leaves the receipt at `Projected`; it never undoes the
//! ledger row or its inventory effect.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use stockledger_core::{ApproverId, DomainError, OrgId, SkuId, StoreId};
use stockledger_events::{Event, NewAuditEvent};
use stockledger_ledger::events::OrgCreated;
use stockledger_ledger::{
    BatchSummary, ConfirmOrder, ConfirmTransfer, ConfirmationState, ConfirmedOrder,
    ConfirmedTransfer, LedgerEvent, OrderLine, OrgScope, Organization, Receipt, RecordOutcome,
    TransferLine, UpsertOrganization, UpsertStatus, User,
};

use crate::store::{AuditLog, LedgerStore, StoreError};

#[derive(Debug, Error)]
pub enum ApplyError {
    /// Deterministic rejection; nothing was persisted.
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// Storage failed; the transaction guarantees no partial application.
    #[error(transparent)]
    Persistence(StoreError),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Persistence(e) if e.is_retryable())
    }
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownOrg(org_id) => {
                ApplyError::Validation(DomainError::not_found(format!("organization {org_id}")))
            }
            // A membership row vanished between the scope check and the insert.
            StoreError::Constraint(msg) => ApplyError::Validation(DomainError::out_of_scope(msg)),
            StoreError::OutOfRange(msg) => ApplyError::Validation(DomainError::validation(msg)),
            other => ApplyError::Persistence(other),
        }
    }
}

/// Tracks one request through [`ConfirmationState`].
#[derive(Debug)]
struct Progress(ConfirmationState);

impl Progress {
    fn new() -> Self {
        Self(ConfirmationState::Received)
    }

    fn advance(&mut self, next: ConfirmationState) {
        debug_assert!(
            self.0.can_transition_to(next),
            "illegal transition {} -> {next}",
            self.0
        );
        self.0 = next;
    }
}

pub struct LedgerApplier<S: ?Sized> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
}

impl<S: ?Sized> Clone for LedgerApplier<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            audit: self.audit.clone(),
        }
    }
}

impl<S> LedgerApplier<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Create or update an organization; the first creation is audited.
    #[instrument(skip(self, req), fields(org_id = %req.org_id), err)]
    pub async fn register_organization(
        &self,
        req: UpsertOrganization,
    ) -> Result<(Organization, UpsertStatus), ApplyError> {
        let req = req.normalized()?;
        let (org, status) = self.store.upsert_organization(&req).await?;
        if status == UpsertStatus::Created {
            info!("organization created");
            let event = LedgerEvent::OrgCreated(OrgCreated {
                org_id: org.org_id.clone(),
                display_name: org.display_name.clone(),
                occurred_at: org.created_at,
            });
            self.notify(&org.org_id, &event).await;
        }
        Ok((org, status))
    }

    pub async fn verify_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<User>, ApplyError> {
        let user = self.store.find_user_by_email(email).await?;
        Ok(user.filter(|u| u.verify_password(password)))
    }

    #[instrument(
        skip(self, req),
        fields(
            org_id = %req.org_id,
            store_id = %req.store_id,
            sku_id = %req.sku_id,
            idem_key = %req.idempotency_key
        ),
        err
    )]
    pub async fn confirm_order(&self, req: ConfirmOrder) -> Result<Receipt, ApplyError> {
        let mut progress = Progress::new();
        let outcome = match self.apply_order(req, None, &mut progress).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.rejected(err, &mut progress)),
        };
        if outcome.is_applied() {
            let event = LedgerEvent::order_confirmed(outcome.record());
            if self.notify(&outcome.record().org_id, &event).await {
                progress.advance(ConfirmationState::Notified);
            }
        }
        Ok(order_receipt(&outcome, progress.0))
    }

    #[instrument(
        skip(self, req),
        fields(
            org_id = %req.org_id,
            from_store = %req.from_store,
            to_store = %req.to_store,
            sku_id = %req.sku_id,
            idem_key = %req.idempotency_key
        ),
        err
    )]
    pub async fn confirm_transfer(&self, req: ConfirmTransfer) -> Result<Receipt, ApplyError> {
        let mut progress = Progress::new();
        let outcome = match self.apply_transfer(req, None, &mut progress).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.rejected(err, &mut progress)),
        };
        if outcome.is_applied() {
            let event = LedgerEvent::transfer_confirmed(outcome.record());
            if self.notify(&outcome.record().org_id, &event).await {
                progress.advance(ConfirmationState::Notified);
            }
        }
        Ok(transfer_receipt(&outcome, progress.0))
    }

    /// Apply a batch of order lines under `{prefix}:{store}:{sku}` keys.
    ///
    /// Lines are independent: a line failing validation is counted as
    /// rejected and the rest still apply. A storage failure aborts the
    /// batch; re-running it with the same prefix is safe. One
    /// `orders_approved` event summarizes the batch.
    #[instrument(skip(self, lines), fields(org_id = %org_id, lines = lines.len()), err)]
    pub async fn confirm_orders(
        &self,
        org_id: &OrgId,
        approved_by: &ApproverId,
        prefix: &str,
        lines: Vec<OrderLine>,
    ) -> Result<BatchSummary, ApplyError> {
        let scope = self.batch_scope(org_id, prefix).await?;
        let mut summary = BatchSummary::default();
        for (index, line) in lines.into_iter().enumerate() {
            let req = match line.into_request(org_id, approved_by, prefix) {
                Ok(req) => req,
                Err(err) => {
                    summary.rejected(index, err.to_string());
                    continue;
                }
            };
            let key = req.idempotency_key.clone();
            match self.apply_order(req, Some(&scope), &mut Progress::new()).await {
                Ok(outcome) => summary.accepted(key, outcome.status(), outcome.record().id),
                Err(ApplyError::Validation(err)) => summary.rejected(index, err.to_string()),
                Err(err) => return Err(err),
            }
        }
        info!(
            applied = summary.applied,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "order batch applied"
        );
        let event = LedgerEvent::orders_approved(approved_by, prefix, &summary);
        self.notify(org_id, &event).await;
        Ok(summary)
    }

    /// Transfer counterpart of [`confirm_orders`](Self::confirm_orders), keyed
    /// `{prefix}:{from}:{to}:{sku}`.
    #[instrument(skip(self, lines), fields(org_id = %org_id, lines = lines.len()), err)]
    pub async fn confirm_transfers(
        &self,
        org_id: &OrgId,
        approved_by: &ApproverId,
        prefix: &str,
        lines: Vec<TransferLine>,
    ) -> Result<BatchSummary, ApplyError> {
        let scope = self.batch_scope(org_id, prefix).await?;
        let mut summary = BatchSummary::default();
        for (index, line) in lines.into_iter().enumerate() {
            let req = match line.into_request(org_id, approved_by, prefix) {
                Ok(req) => req,
                Err(err) => {
                    summary.rejected(index, err.to_string());
                    continue;
                }
            };
            let key = req.idempotency_key.clone();
            match self.apply_transfer(req, Some(&scope), &mut Progress::new()).await {
                Ok(outcome) => summary.accepted(key, outcome.status(), outcome.record().id),
                Err(ApplyError::Validation(err)) => summary.rejected(index, err.to_string()),
                Err(err) => return Err(err),
            }
        }
        info!(
            applied = summary.applied,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "transfer batch applied"
        );
        let event = LedgerEvent::transfers_approved(approved_by, prefix, &summary);
        self.notify(org_id, &event).await;
        Ok(summary)
    }

    /// Validate, then record. Stops at `Projected` or `Duplicate`.
    async fn apply_order(
        &self,
        req: ConfirmOrder,
        scope: Option<&OrgScope>,
        progress: &mut Progress,
    ) -> Result<RecordOutcome<ConfirmedOrder>, ApplyError> {
        let order = req.validate(Utc::now())?;
        match scope {
            Some(scope) => {
                check_store(scope.is_store_valid(&order.store_id), &order.org_id, &order.store_id)?;
                check_sku(scope.is_sku_valid(&order.sku_id), &order.org_id, &order.sku_id)?;
            }
            None => {
                self.require_org(&order.org_id).await?;
                let store_ok = self.store.is_store_valid(&order.org_id, &order.store_id).await?;
                check_store(store_ok, &order.org_id, &order.store_id)?;
                let sku_ok = self.store.is_sku_valid(&order.org_id, &order.sku_id).await?;
                check_sku(sku_ok, &order.org_id, &order.sku_id)?;
            }
        }
        progress.advance(ConfirmationState::Validated);

        let outcome = self.store.record_order(order).await?;
        self.record_progress(&outcome, progress);
        Ok(outcome)
    }

    async fn apply_transfer(
        &self,
        req: ConfirmTransfer,
        scope: Option<&OrgScope>,
        progress: &mut Progress,
    ) -> Result<RecordOutcome<ConfirmedTransfer>, ApplyError> {
        let transfer = req.validate(Utc::now())?;
        let org_id = &transfer.org_id;
        match scope {
            Some(scope) => {
                check_store(scope.is_store_valid(&transfer.from_store), org_id, &transfer.from_store)?;
                check_store(scope.is_store_valid(&transfer.to_store), org_id, &transfer.to_store)?;
                check_sku(scope.is_sku_valid(&transfer.sku_id), org_id, &transfer.sku_id)?;
            }
            None => {
                self.require_org(org_id).await?;
                for store_id in [&transfer.from_store, &transfer.to_store] {
                    let ok = self.store.is_store_valid(org_id, store_id).await?;
                    check_store(ok, org_id, store_id)?;
                }
                let sku_ok = self.store.is_sku_valid(org_id, &transfer.sku_id).await?;
                check_sku(sku_ok, org_id, &transfer.sku_id)?;
            }
        }
        progress.advance(ConfirmationState::Validated);

        let outcome = self.store.record_transfer(transfer).await?;
        self.record_progress(&outcome, progress);
        Ok(outcome)
    }

    fn record_progress<T>(&self, outcome: &RecordOutcome<T>, progress: &mut Progress) {
        if outcome.is_applied() {
            progress.advance(ConfirmationState::Recorded);
            progress.advance(ConfirmationState::Projected);
            info!("confirmation recorded");
        } else {
            progress.advance(ConfirmationState::Duplicate);
            debug!("duplicate submission, returning the original record");
        }
    }

    fn rejected(&self, err: ApplyError, progress: &mut Progress) -> ApplyError {
        if let ApplyError::Validation(reason) = &err {
            if progress.0 == ConfirmationState::Received {
                progress.advance(ConfirmationState::Rejected);
            }
            debug!(%reason, state = %progress.0, "confirmation rejected");
        }
        err
    }

    async fn require_org(&self, org_id: &OrgId) -> Result<(), ApplyError> {
        match self.store.get_organization(org_id).await? {
            Some(_) => Ok(()),
            None => Err(DomainError::not_found(format!("organization {org_id}")).into()),
        }
    }

    async fn batch_scope(&self, org_id: &OrgId, prefix: &str) -> Result<OrgScope, ApplyError> {
        if prefix.trim().is_empty() {
            return Err(DomainError::validation("idempotency prefix cannot be blank").into());
        }
        self.require_org(org_id).await?;
        let stores: BTreeSet<StoreId> = self.store.list_stores(org_id).await?.into_iter().collect();
        let skus: BTreeSet<SkuId> = self.store.list_skus(org_id).await?.into_iter().collect();
        Ok(OrgScope { stores, skus })
    }

    /// Append the audit event. Returns whether it was written.
    async fn notify(&self, org_id: &OrgId, event: &LedgerEvent) -> bool {
        let new_event = match NewAuditEvent::from_typed(org_id.clone(), event) {
            Ok(e) => e,
            Err(err) => {
                warn!(event_type = %event.event_type(), error = %err, "audit payload not serializable");
                return false;
            }
        };
        match self.audit.append(new_event).await {
            Ok(_) => true,
            Err(err) => {
                warn!(
                    org_id = %org_id,
                    event_type = %event.event_type(),
                    error = %err,
                    "audit emit failed after commit; ledger and projection unaffected"
                );
                false
            }
        }
    }
}

fn check_store(valid: bool, org_id: &OrgId, store_id: &StoreId) -> Result<(), DomainError> {
    if valid {
        Ok(())
    } else {
        Err(DomainError::out_of_scope(format!(
            "store {store_id} is not registered for {org_id}"
        )))
    }
}

fn check_sku(valid: bool, org_id: &OrgId, sku_id: &SkuId) -> Result<(), DomainError> {
    if valid {
        Ok(())
    } else {
        Err(DomainError::out_of_scope(format!(
            "sku {sku_id} is not registered for {org_id}"
        )))
    }
}

fn order_receipt(outcome: &RecordOutcome<ConfirmedOrder>, state: ConfirmationState) -> Receipt {
    let record = outcome.record();
    Receipt {
        status: outcome.status(),
        ledger_id: record.id,
        approved_at: record.approved_at,
        approved_by: record.approved_by.clone(),
        state,
    }
}

fn transfer_receipt(
    outcome: &RecordOutcome<ConfirmedTransfer>,
    state: ConfirmationState,
) -> Receipt {
    let record = outcome.record();
    Receipt {
        status: outcome.status(),
        ledger_id: record.id,
        approved_at: record.approved_at,
        approved_by: record.approved_by.clone(),
        state,
    }
}
