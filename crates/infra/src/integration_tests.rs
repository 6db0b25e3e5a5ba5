//! Integration tests for the full confirmation pipeline.
//!
//! Tests: request → LedgerApplier → ledger + projection (one tx) → audit log
//!
//! Verifies, against the in-memory and SQLite backends:
//! - Double submission applies once and replays the original metadata
//! - Validation failures persist nothing
//! - Concurrent duplicates produce exactly one `Recorded`, also on a
//!   file-backed SQLite pool with several connections
//! - On-hand overflow is a final rejection that writes nothing
//! - Repairs racing confirmations lose no effect
//! - Audit failures never roll back a confirmation
//! - The projection stays a fold of the ledger

use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;
use tempfile::TempDir;

use stockledger_core::{ApproverId, DomainError, IdempotencyKey, OrgId, SkuId, StoreId};
use stockledger_events::{AuditEvent, NewAuditEvent};
use stockledger_ledger::{
    ConfirmOrder, ConfirmTransfer, ConfirmationState, ConfirmationStatus, UpsertOrganization,
    fold_ledger,
};

use crate::applier::{ApplyError, LedgerApplier};
use crate::config::Backend;
use crate::reconcile::Reconciler;
use crate::store::{
    AuditError, AuditLog, InMemoryLedgerStore, LedgerStore, LevelFilter, SqliteLedgerStore,
    StoreError,
};

type Applier = LedgerApplier<dyn LedgerStore>;

fn org(id: &str) -> OrgId {
    OrgId::new(id).unwrap()
}

fn store(id: &str) -> StoreId {
    StoreId::new(id).unwrap()
}

fn sku(id: &str) -> SkuId {
    SkuId::new(id).unwrap()
}

fn order(org_id: &str, store_id: &str, qty: i64, key: &str) -> ConfirmOrder {
    ConfirmOrder {
        org_id: org(org_id),
        store_id: store(store_id),
        sku_id: sku("X"),
        quantity: qty,
        approved_by: ApproverId::new("ops@a.test").unwrap(),
        idempotency_key: IdempotencyKey::new(key).unwrap(),
    }
}

fn transfer(org_id: &str, from: &str, to: &str, qty: i64, key: &str) -> ConfirmTransfer {
    ConfirmTransfer {
        org_id: org(org_id),
        from_store: store(from),
        to_store: store(to),
        sku_id: sku("X"),
        quantity: qty,
        approved_by: ApproverId::new("ops@a.test").unwrap(),
        idempotency_key: IdempotencyKey::new(key).unwrap(),
    }
}

fn applier_for(backend: Backend) -> Applier {
    LedgerApplier::new(backend.store, backend.audit)
}

async fn memory_applier() -> Applier {
    applier_for(Backend::from_store(Arc::new(InMemoryLedgerStore::new())))
}

async fn sqlite_applier() -> Applier {
    let store = SqliteLedgerStore::in_memory().await.unwrap();
    applier_for(Backend::from_store(Arc::new(store)))
}

/// SQLite on a temp file with a real multi-connection pool. Keep the
/// `TempDir` alive for the duration of the test.
async fn file_sqlite_applier() -> (Applier, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let store = SqliteLedgerStore::connect(&url, 4).await.unwrap();
    (applier_for(Backend::from_store(Arc::new(store))), dir)
}

/// Org `org_id` with stores S1, S2 and SKU X.
async fn seed(applier: &Applier, org_id: &str) {
    applier
        .register_organization(UpsertOrganization {
            org_id: org(org_id),
            display_name: None,
            notify_webhook: None,
        })
        .await
        .unwrap();
    applier
        .store()
        .add_stores(&org(org_id), &[store("S1"), store("S2")])
        .await
        .unwrap();
    applier.store().add_skus(&org(org_id), &[sku("X")]).await.unwrap();
}

async fn on_hand(applier: &Applier, org_id: &str, store_id: &str) -> Option<i64> {
    applier
        .store()
        .inventory_level(&org(org_id), &store(store_id), &sku("X"))
        .await
        .unwrap()
        .map(|l| l.on_hand)
}

async fn end_to_end_scenario(applier: Applier) {
    seed(&applier, "A").await;
    let a = org("A");

    let first = applier.confirm_order(order("A", "S1", 10, "k1")).await.unwrap();
    assert_eq!(first.status, ConfirmationStatus::Recorded);
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(10));

    let replay = applier.confirm_order(order("A", "S1", 10, "k1")).await.unwrap();
    assert_eq!(replay.status, ConfirmationStatus::Duplicate);
    assert_eq!(replay.approved_at, first.approved_at);
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(10));
    assert_eq!(applier.store().list_orders(&a).await.unwrap().len(), 1);

    applier
        .confirm_transfer(transfer("A", "S1", "S2", 4, "k2"))
        .await
        .unwrap();
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(6));
    assert_eq!(on_hand(&applier, "A", "S2").await, Some(4));

    let before = applier.store().org_counts(&a).await.unwrap();

    let same_store = applier
        .confirm_transfer(transfer("A", "S2", "S2", 1, "k3"))
        .await
        .unwrap_err();
    assert!(matches!(same_store, ApplyError::Validation(DomainError::Validation(_))));

    let unknown_store = applier.confirm_order(order("A", "S9", 1, "k4")).await.unwrap_err();
    assert!(matches!(unknown_store, ApplyError::Validation(DomainError::OutOfScope(_))));
    assert_eq!(on_hand(&applier, "A", "S9").await, None);

    let after = applier.store().org_counts(&a).await.unwrap();
    assert_eq!(after, before, "rejected requests must not write anything");

    let reconciler = Reconciler::new(applier.store().clone(), applier.audit().clone());
    assert!(reconciler.reconcile(&a).await.unwrap().is_consistent());
}

#[tokio::test]
async fn end_to_end_scenario_in_memory() {
    end_to_end_scenario(memory_applier().await).await;
}

#[tokio::test]
async fn end_to_end_scenario_sqlite() {
    end_to_end_scenario(sqlite_applier().await).await;
}

async fn negative_on_hand_is_preserved(applier: Applier) {
    seed(&applier, "A").await;
    applier
        .confirm_transfer(transfer("A", "S1", "S2", 3, "t1"))
        .await
        .unwrap();
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(-3));
    assert_eq!(on_hand(&applier, "A", "S2").await, Some(3));
}

#[tokio::test]
async fn negative_on_hand_is_preserved_in_memory() {
    negative_on_hand_is_preserved(memory_applier().await).await;
}

#[tokio::test]
async fn negative_on_hand_is_preserved_sqlite() {
    negative_on_hand_is_preserved(sqlite_applier().await).await;
}

async fn concurrent_duplicates(applier: Applier) {
    seed(&applier, "A").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let applier = applier.clone();
        handles.push(tokio::spawn(async move {
            applier.confirm_order(order("A", "S1", 5, "same-key")).await
        }));
    }

    let mut recorded = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap().status {
            ConfirmationStatus::Recorded => recorded += 1,
            ConfirmationStatus::Duplicate => duplicates += 1,
        }
    }
    assert_eq!((recorded, duplicates), (1, 7));
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(5));

    let confirmed = applier
        .audit()
        .poll_events(&org("A"), 0, 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == stockledger_events::EventType::OrderConfirmed)
        .count();
    assert_eq!(confirmed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_in_memory() {
    concurrent_duplicates(memory_applier().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_sqlite() {
    concurrent_duplicates(sqlite_applier().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_sqlite_file_pool() {
    let (applier, _dir) = file_sqlite_applier().await;
    concurrent_duplicates(applier).await;
}

async fn overflow_is_rejected(applier: Applier) {
    seed(&applier, "A").await;
    applier
        .confirm_order(order("A", "S1", i64::MAX, "full"))
        .await
        .unwrap();
    let before = applier.store().org_counts(&org("A")).await.unwrap();

    let err = applier
        .confirm_order(order("A", "S1", 1, "one-more"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Validation(DomainError::Validation(_))), "{err:?}");
    assert!(!err.is_retryable());

    let err = applier
        .confirm_transfer(transfer("A", "S2", "S1", 1, "into-full"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplyError::Validation(DomainError::Validation(_))), "{err:?}");

    assert_eq!(applier.store().org_counts(&org("A")).await.unwrap(), before);
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(i64::MAX));
    assert_eq!(on_hand(&applier, "A", "S2").await, None);

    // The backend is still healthy afterwards.
    let ok = applier.confirm_order(order("A", "S2", 3, "k2")).await.unwrap();
    assert_eq!(ok.status, ConfirmationStatus::Recorded);
    let reconciler = Reconciler::new(applier.store().clone(), applier.audit().clone());
    assert!(reconciler.reconcile(&org("A")).await.unwrap().is_consistent());
}

#[tokio::test]
async fn overflow_is_rejected_in_memory() {
    overflow_is_rejected(memory_applier().await).await;
}

#[tokio::test]
async fn overflow_is_rejected_sqlite() {
    overflow_is_rejected(sqlite_applier().await).await;
}

/// Confirmations and repairs interleave; every effect survives.
async fn repair_races_confirmations(applier: Applier) {
    seed(&applier, "A").await;
    let reconciler = Arc::new(Reconciler::new(
        applier.store().clone(),
        applier.audit().clone(),
    ));

    let mut writers = Vec::new();
    for i in 0..24 {
        let applier = applier.clone();
        writers.push(tokio::spawn(async move {
            let key = format!("o{i}");
            applier.confirm_order(order("A", "S1", 2, &key)).await.unwrap();
            let key = format!("t{i}");
            let (from, to) = if i % 2 == 0 { ("S1", "S2") } else { ("S2", "S1") };
            applier
                .confirm_transfer(transfer("A", from, to, 1, &key))
                .await
                .unwrap();
        }));
    }
    let repairs = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                reconciler.repair(&org("A")).await.unwrap();
                tokio::task::yield_now().await;
            }
        })
    };
    for w in writers {
        w.await.unwrap();
    }
    repairs.await.unwrap();

    assert!(reconciler.reconcile(&org("A")).await.unwrap().is_consistent());
    let s1 = on_hand(&applier, "A", "S1").await.unwrap();
    let s2 = on_hand(&applier, "A", "S2").await.unwrap();
    assert_eq!((s1, s2), (48, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repair_races_confirmations_in_memory() {
    repair_races_confirmations(memory_applier().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repair_races_confirmations_sqlite_file_pool() {
    let (applier, _dir) = file_sqlite_applier().await;
    repair_races_confirmations(applier).await;
}

struct UnreachableAudit;

#[async_trait]
impl AuditLog for UnreachableAudit {
    async fn append(&self, _event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        Err(AuditError::Store(StoreError::Unavailable("audit sink unreachable".into())))
    }

    async fn poll_events(
        &self,
        _org_id: &OrgId,
        _after: i64,
        _limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(Vec::new())
    }

    async fn recent_events(&self, _org_id: &OrgId, _limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn audit_failure_does_not_roll_back() {
    let store: Arc<dyn LedgerStore> = Arc::new(InMemoryLedgerStore::new());
    let applier: Applier = LedgerApplier::new(store, Arc::new(UnreachableAudit));
    seed(&applier, "A").await;

    let receipt = applier.confirm_order(order("A", "S1", 10, "k1")).await.unwrap();

    assert_eq!(receipt.status, ConfirmationStatus::Recorded);
    assert_eq!(receipt.state, ConfirmationState::Projected);
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(10));
    assert_eq!(applier.store().list_orders(&org("A")).await.unwrap().len(), 1);

    let replay = applier.confirm_order(order("A", "S1", 10, "k1")).await.unwrap();
    assert!(replay.is_duplicate());
}

#[tokio::test]
async fn tenants_are_isolated() {
    let applier = memory_applier().await;
    seed(&applier, "A").await;
    seed(&applier, "B").await;

    applier.confirm_order(order("A", "S1", 10, "k1")).await.unwrap();
    let b = applier.confirm_order(order("B", "S1", 2, "k1")).await.unwrap();

    assert_eq!(b.status, ConfirmationStatus::Recorded);
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(10));
    assert_eq!(on_hand(&applier, "B", "S1").await, Some(2));

    assert!(applier.store().delete_organization(&org("B")).await.unwrap());
    assert_eq!(on_hand(&applier, "A", "S1").await, Some(10));
    let gone = applier.confirm_order(order("B", "S1", 1, "k2")).await.unwrap_err();
    assert!(matches!(gone, ApplyError::Validation(DomainError::NotFound(_))));
}

#[derive(Debug, Clone)]
enum Step {
    Order { store: usize, qty: i64 },
    Transfer { from: usize, to: usize, qty: i64 },
    Replay(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..3, 1i64..50).prop_map(|(store, qty)| Step::Order { store, qty }),
        (0usize..3, 0usize..3, 1i64..50).prop_map(|(from, to, qty)| Step::Transfer { from, to, qty }),
        (0usize..20).prop_map(Step::Replay),
    ]
}

const STORES: [&str; 3] = ["S1", "S2", "S3"];

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Whatever mix of orders, transfers, replays and rejections is applied,
    /// the stored levels equal the fold of the stored ledger.
    #[test]
    fn projection_is_a_fold_of_the_ledger(steps in prop::collection::vec(step(), 1..30)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let applier = memory_applier().await;
            seed(&applier, "A").await;
            applier.store().add_stores(&org("A"), &[store("S3")]).await.unwrap();

            let mut sent: Vec<Result<ConfirmOrder, ConfirmTransfer>> = Vec::new();
            for (i, s) in steps.iter().enumerate() {
                let key = format!("k{i}");
                match s {
                    Step::Order { store, qty } => {
                        let req = order("A", STORES[*store], *qty, &key);
                        applier.confirm_order(req.clone()).await.unwrap();
                        sent.push(Ok(req));
                    }
                    Step::Transfer { from, to, qty } => {
                        let req = transfer("A", STORES[*from], STORES[*to], *qty, &key);
                        let result = applier.confirm_transfer(req.clone()).await;
                        assert_eq!(result.is_err(), from == to);
                        sent.push(Err(req));
                    }
                    Step::Replay(n) => {
                        if let Some(prev) = sent.get(*n).cloned() {
                            match prev {
                                Ok(req) => { applier.confirm_order(req).await.unwrap(); }
                                Err(req) => { let _ = applier.confirm_transfer(req).await; }
                            }
                        }
                    }
                }
            }

            let a = org("A");
            let orders = applier.store().list_orders(&a).await.unwrap();
            let transfers = applier.store().list_transfers(&a).await.unwrap();
            let expected = fold_ledger(&orders, &transfers).unwrap().into_levels(&a);
            let stored = applier
                .store()
                .inventory_levels(&a, &LevelFilter::default())
                .await
                .unwrap();
            assert_eq!(stored, expected);

            let total: i64 = stored.iter().map(|l| l.on_hand).sum();
            let received: i64 = orders.iter().map(|o| o.quantity.units()).sum();
            assert_eq!(total, received);
        });
    }
}
