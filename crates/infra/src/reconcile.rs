//! Fold-equivalence check between the ledger and the inventory projection.
//!
//! `reconcile` only reports: drift is logged at `error` level and audited as
//! `reconciliation_drift`, never corrected. `repair` is the explicit operator
//! action that overwrites the projection with the fold.
//!
//! Both read the ledger and the levels through one store transaction
//! ([`InventoryProjection::ledger_snapshot`] and
//! [`InventoryProjection::rebuild_levels`]), so a confirmation committing
//! concurrently is never half-counted and never erased by a repair.
//!
//! [`InventoryProjection::ledger_snapshot`]: crate::store::InventoryProjection::ledger_snapshot
//! [`InventoryProjection::rebuild_levels`]: crate::store::InventoryProjection::rebuild_levels

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use stockledger_core::OrgId;
use stockledger_events::NewAuditEvent;
use stockledger_ledger::events::{ProjectionRepaired, ReconciliationDrift};
use stockledger_ledger::{LedgerEvent, LevelDrift};

use crate::store::{AuditLog, LedgerStore, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("organization not found: {0}")]
    UnknownOrg(OrgId),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownOrg(org_id) => ReconcileError::UnknownOrg(org_id),
            other => ReconcileError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub org_id: OrgId,
    /// Coordinates the ledger accounts for.
    pub checked: usize,
    pub drift: Vec<LevelDrift>,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.drift.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub org_id: OrgId,
    pub corrected: usize,
    pub rows: usize,
}

pub struct Reconciler<S: ?Sized> {
    store: Arc<S>,
    audit: Arc<dyn AuditLog>,
}

impl<S> Reconciler<S>
where
    S: LedgerStore + ?Sized,
{
    pub fn new(store: Arc<S>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    #[instrument(skip(self), fields(org_id = %org_id), err)]
    pub async fn reconcile(&self, org_id: &OrgId) -> Result<ReconcileReport, ReconcileError> {
        let snapshot = self.store.ledger_snapshot(org_id).await?;
        let (fold, drift) = snapshot.drift().map_err(StoreError::out_of_range)?;
        for d in &drift {
            error!(
                store_id = %d.store_id,
                sku_id = %d.sku_id,
                expected = ?d.expected,
                stored = ?d.stored,
                "inventory level drifted from the ledger"
            );
        }
        if !drift.is_empty() {
            let event = LedgerEvent::ReconciliationDrift(ReconciliationDrift {
                drift: drift.clone(),
                occurred_at: Utc::now(),
            });
            self.audit_event(org_id, &event).await;
        }
        Ok(ReconcileReport {
            org_id: org_id.clone(),
            checked: fold.levels().len(),
            drift,
        })
    }

    /// Replace every level of the org with the fold of its ledger.
    #[instrument(skip(self), fields(org_id = %org_id), err)]
    pub async fn repair(&self, org_id: &OrgId) -> Result<RepairReport, ReconcileError> {
        let rebuilt = self.store.rebuild_levels(org_id).await?;

        let report = RepairReport {
            org_id: org_id.clone(),
            corrected: rebuilt.drift.len(),
            rows: rebuilt.rows,
        };
        info!(corrected = report.corrected, rows = report.rows, "projection rebuilt from ledger");
        let event = LedgerEvent::ProjectionRepaired(ProjectionRepaired {
            corrected: report.corrected,
            rows: report.rows,
            occurred_at: Utc::now(),
        });
        self.audit_event(org_id, &event).await;
        Ok(report)
    }

    async fn audit_event(&self, org_id: &OrgId, event: &LedgerEvent) {
        let result = match NewAuditEvent::from_typed(org_id.clone(), event) {
            Ok(new_event) => self.audit.append(new_event).await.map(|_| ()),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = result {
            warn!(org_id = %org_id, error = %err, "reconciliation audit event not written");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::{ApproverId, IdempotencyKey, SkuId, StoreId};
    use stockledger_events::EventType;
    use stockledger_ledger::{ConfirmOrder, InventoryLevel, UpsertOrganization};

    use crate::applier::LedgerApplier;
    use crate::store::{InMemoryLedgerStore, InventoryProjection, TenantDirectory};

    fn org() -> OrgId {
        OrgId::new("A").unwrap()
    }

    async fn setup() -> (Arc<InMemoryLedgerStore>, Reconciler<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let audit: Arc<dyn AuditLog> = store.clone();
        let applier = LedgerApplier::new(store.clone(), audit.clone());
        applier
            .register_organization(UpsertOrganization {
                org_id: org(),
                display_name: None,
                notify_webhook: None,
            })
            .await
            .unwrap();
        store.add_stores(&org(), &[StoreId::new("S1").unwrap()]).await.unwrap();
        store.add_skus(&org(), &[SkuId::new("X").unwrap()]).await.unwrap();
        applier
            .confirm_order(ConfirmOrder {
                org_id: org(),
                store_id: StoreId::new("S1").unwrap(),
                sku_id: SkuId::new("X").unwrap(),
                quantity: 10,
                approved_by: ApproverId::new("ops").unwrap(),
                idempotency_key: IdempotencyKey::new("k1").unwrap(),
            })
            .await
            .unwrap();
        let reconciler = Reconciler::new(store.clone(), audit);
        (store, reconciler)
    }

    #[tokio::test]
    async fn consistent_projection_reports_no_drift() {
        let (_, reconciler) = setup().await;
        let report = reconciler.reconcile(&org()).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn drift_is_reported_not_corrected() {
        let (store, reconciler) = setup().await;
        store
            .tamper_level(InventoryLevel {
                org_id: org(),
                store_id: StoreId::new("S1").unwrap(),
                sku_id: SkuId::new("X").unwrap(),
                on_hand: 7,
            })
            .unwrap();

        let report = reconciler.reconcile(&org()).await.unwrap();
        assert_eq!(report.drift.len(), 1);
        assert_eq!(report.drift[0].expected, Some(10));
        assert_eq!(report.drift[0].stored, Some(7));

        let level = store
            .inventory_level(&org(), &StoreId::new("S1").unwrap(), &SkuId::new("X").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.on_hand, 7);

        let recent = store.recent_events(&org(), 1).await.unwrap();
        assert_eq!(recent[0].event_type, EventType::ReconciliationDrift);
    }

    #[tokio::test]
    async fn repair_restores_fold_equivalence() {
        let (store, reconciler) = setup().await;
        store
            .tamper_level(InventoryLevel {
                org_id: org(),
                store_id: StoreId::new("S1").unwrap(),
                sku_id: SkuId::new("X").unwrap(),
                on_hand: -3,
            })
            .unwrap();

        let report = reconciler.repair(&org()).await.unwrap();
        assert_eq!((report.corrected, report.rows), (1, 1));
        assert!(reconciler.reconcile(&org()).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn unknown_org_is_an_error() {
        let (_, reconciler) = setup().await;
        let err = reconciler.reconcile(&OrgId::new("nope").unwrap()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownOrg(_)));
        let err = reconciler.repair(&OrgId::new("nope").unwrap()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownOrg(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repair_during_confirmations_loses_nothing() {
        let (store, reconciler) = setup().await;
        let audit: Arc<dyn AuditLog> = store.clone();
        let applier = Arc::new(LedgerApplier::new(store.clone(), audit));
        let reconciler = Arc::new(reconciler);

        let writers: Vec<_> = (0..40).map(|i| {
            let applier = applier.clone();
            tokio::spawn(async move {
                applier
                    .confirm_order(ConfirmOrder {
                        org_id: org(),
                        store_id: StoreId::new("S1").unwrap(),
                        sku_id: SkuId::new("X").unwrap(),
                        quantity: 1,
                        approved_by: ApproverId::new("ops").unwrap(),
                        idempotency_key: IdempotencyKey::new(format!("c{i}")).unwrap(),
                    })
                    .await
                    .unwrap();
            })
        })
        .collect();
        let repairs = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                for _ in 0..20 {
                    reconciler.repair(&org()).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        for w in writers {
            w.await.unwrap();
        }
        repairs.await.unwrap();

        assert!(reconciler.reconcile(&org()).await.unwrap().is_consistent());
        let level = store
            .inventory_level(&org(), &StoreId::new("S1").unwrap(), &SkuId::new("X").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(level.on_hand, 10 + 40);
    }
}
