//! Inventory effects and the fold that rebuilds levels from the ledger.
//!
//! The stored inventory levels must always equal [`fold_ledger`] over the
//! confirmed orders and transfers. Negative on-hand is a legitimate result
//! (a transfer approved before stock arrived) and is kept as-is. A level
//! that would leave the `i64` range is refused, never wrapped.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, OrgId, Quantity, SkuId, StoreId};

use crate::confirmation::{ConfirmedOrder, ConfirmedTransfer};

/// Projected on-hand for one `(org, store, sku)` coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryLevel {
    pub org_id: OrgId,
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub on_hand: i64,
}

/// Coordinate key inside one organization.
pub type LevelKey = (StoreId, SkuId);

/// A single signed change to one coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelDelta {
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub delta: i64,
}

/// The inventory effect of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryEffect {
    /// `+qty` at the store.
    Receive {
        store_id: StoreId,
        sku_id: SkuId,
        quantity: Quantity,
    },
    /// `-qty` at the source, `+qty` at the destination.
    Move {
        from_store: StoreId,
        to_store: StoreId,
        sku_id: SkuId,
        quantity: Quantity,
    },
}

impl InventoryEffect {
    /// Signed changes, ordered by store id. Writers apply them in this order
    /// so that two opposite transfers lock their rows in the same sequence.
    pub fn deltas(&self) -> Vec<LevelDelta> {
        match self {
            InventoryEffect::Receive {
                store_id,
                sku_id,
                quantity,
            } => vec![LevelDelta {
                store_id: store_id.clone(),
                sku_id: sku_id.clone(),
                delta: quantity.units(),
            }],
            InventoryEffect::Move {
                from_store,
                to_store,
                sku_id,
                quantity,
            } => {
                let mut deltas = vec![
                    LevelDelta {
                        store_id: from_store.clone(),
                        sku_id: sku_id.clone(),
                        delta: -quantity.units(),
                    },
                    LevelDelta {
                        store_id: to_store.clone(),
                        sku_id: sku_id.clone(),
                        delta: quantity.units(),
                    },
                ];
                deltas.sort_by(|a, b| a.store_id.cmp(&b.store_id));
                deltas
            }
        }
    }
}

/// `current + delta`, refusing results outside the `i64` range.
pub fn add_on_hand(
    store_id: &StoreId,
    sku_id: &SkuId,
    current: i64,
    delta: i64,
) -> DomainResult<i64> {
    current
        .checked_add(delta)
        .ok_or_else(|| on_hand_overflow(store_id, sku_id))
}

fn on_hand_overflow(store_id: &StoreId, sku_id: &SkuId) -> DomainError {
    DomainError::validation(format!("on-hand overflow at {store_id}/{sku_id}"))
}

impl From<&ConfirmedOrder> for InventoryEffect {
    fn from(order: &ConfirmedOrder) -> Self {
        InventoryEffect::Receive {
            store_id: order.store_id.clone(),
            sku_id: order.sku_id.clone(),
            quantity: order.quantity,
        }
    }
}

impl From<&ConfirmedTransfer> for InventoryEffect {
    fn from(transfer: &ConfirmedTransfer) -> Self {
        InventoryEffect::Move {
            from_store: transfer.from_store.clone(),
            to_store: transfer.to_store.clone(),
            sku_id: transfer.sku_id.clone(),
            quantity: transfer.quantity,
        }
    }
}

/// Incremental fold state for one organization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerFold {
    levels: BTreeMap<LevelKey, i64>,
}

impl LedgerFold {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the effect, creating the row at zero when absent. On overflow
    /// nothing is applied.
    pub fn apply(&mut self, effect: &InventoryEffect) -> DomainResult<()> {
        let updates = effect
            .deltas()
            .into_iter()
            .map(|d| {
                let current = self.on_hand(&d.store_id, &d.sku_id).unwrap_or(0);
                let next = add_on_hand(&d.store_id, &d.sku_id, current, d.delta)?;
                Ok(((d.store_id, d.sku_id), next))
            })
            .collect::<DomainResult<Vec<_>>>()?;
        self.levels.extend(updates);
        Ok(())
    }

    pub fn on_hand(&self, store_id: &StoreId, sku_id: &SkuId) -> Option<i64> {
        self.levels.get(&(store_id.clone(), sku_id.clone())).copied()
    }

    pub fn levels(&self) -> &BTreeMap<LevelKey, i64> {
        &self.levels
    }

    pub fn into_levels(self, org_id: &OrgId) -> Vec<InventoryLevel> {
        self.levels
            .into_iter()
            .map(|((store_id, sku_id), on_hand)| InventoryLevel {
                org_id: org_id.clone(),
                store_id,
                sku_id,
                on_hand,
            })
            .collect()
    }
}

/// Recompute levels from scratch. Order of application does not matter:
/// sums are taken in `i128` and only the final level must fit in `i64`.
pub fn fold_ledger<'a>(
    orders: impl IntoIterator<Item = &'a ConfirmedOrder>,
    transfers: impl IntoIterator<Item = &'a ConfirmedTransfer>,
) -> DomainResult<LedgerFold> {
    let effects = orders
        .into_iter()
        .map(InventoryEffect::from)
        .chain(transfers.into_iter().map(InventoryEffect::from));

    let mut sums: BTreeMap<LevelKey, i128> = BTreeMap::new();
    for effect in effects {
        for d in effect.deltas() {
            *sums.entry((d.store_id, d.sku_id)).or_insert(0) += i128::from(d.delta);
        }
    }

    let levels = sums
        .into_iter()
        .map(|((store_id, sku_id), sum)| match i64::try_from(sum) {
            Ok(on_hand) => Ok(((store_id, sku_id), on_hand)),
            Err(_) => Err(on_hand_overflow(&store_id, &sku_id)),
        })
        .collect::<DomainResult<BTreeMap<_, _>>>()?;
    Ok(LedgerFold { levels })
}

/// The ledger rows and stored levels of one organization, read together.
///
/// Backends fill it from a single transaction so that a confirmation
/// committing concurrently is either fully inside or fully outside.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub orders: Vec<ConfirmedOrder>,
    pub transfers: Vec<ConfirmedTransfer>,
    pub levels: Vec<InventoryLevel>,
}

impl LedgerSnapshot {
    pub fn fold(&self) -> DomainResult<LedgerFold> {
        fold_ledger(&self.orders, &self.transfers)
    }

    /// The fold and every coordinate where the stored levels disagree with it.
    pub fn drift(&self) -> DomainResult<(LedgerFold, Vec<LevelDrift>)> {
        let fold = self.fold()?;
        let drift = diff_levels(&fold, &self.levels);
        Ok((fold, drift))
    }
}

/// A coordinate where the stored level disagrees with the ledger.
///
/// `stored` is `None` when the row is missing; `expected` is `None` when a
/// row exists that no ledger entry accounts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelDrift {
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub expected: Option<i64>,
    pub stored: Option<i64>,
}

/// Diff stored levels against the fold. Empty means consistent.
pub fn diff_levels(expected: &LedgerFold, stored: &[InventoryLevel]) -> Vec<LevelDrift> {
    let mut actual: BTreeMap<LevelKey, i64> = BTreeMap::new();
    for level in stored {
        actual.insert((level.store_id.clone(), level.sku_id.clone()), level.on_hand);
    }

    let mut drift = Vec::new();
    for (key, want) in expected.levels() {
        match actual.remove(key) {
            Some(have) if have == *want => {}
            have => drift.push(LevelDrift {
                store_id: key.0.clone(),
                sku_id: key.1.clone(),
                expected: Some(*want),
                stored: have,
            }),
        }
    }
    // Stray zero rows are harmless leftovers of an upsert; anything else is drift.
    for ((store_id, sku_id), have) in actual {
        if have != 0 {
            drift.push(LevelDrift {
                store_id,
                sku_id,
                expected: None,
                stored: Some(have),
            });
        }
    }
    drift
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use stockledger_core::{ApproverId, IdempotencyKey};

    fn org() -> OrgId {
        OrgId::new("A").unwrap()
    }

    fn store(s: &str) -> StoreId {
        StoreId::new(s).unwrap()
    }

    fn sku(s: &str) -> SkuId {
        SkuId::new(s).unwrap()
    }

    fn order(id: i64, st: &str, qty: i64) -> ConfirmedOrder {
        ConfirmedOrder {
            id,
            org_id: org(),
            store_id: store(st),
            sku_id: sku("X"),
            quantity: Quantity::new(qty).unwrap(),
            approved_at: Utc::now(),
            approved_by: ApproverId::new("ops").unwrap(),
            idempotency_key: IdempotencyKey::new(format!("o{id}")).unwrap(),
        }
    }

    fn transfer(id: i64, from: &str, to: &str, qty: i64) -> ConfirmedTransfer {
        ConfirmedTransfer {
            id,
            org_id: org(),
            from_store: store(from),
            to_store: store(to),
            sku_id: sku("X"),
            quantity: Quantity::new(qty).unwrap(),
            approved_at: Utc::now(),
            approved_by: ApproverId::new("ops").unwrap(),
            idempotency_key: IdempotencyKey::new(format!("t{id}")).unwrap(),
        }
    }

    #[test]
    fn order_then_transfer_scenario() {
        let fold = fold_ledger(&[order(1, "S1", 10)], &[transfer(1, "S1", "S2", 4)]).unwrap();
        assert_eq!(fold.on_hand(&store("S1"), &sku("X")), Some(6));
        assert_eq!(fold.on_hand(&store("S2"), &sku("X")), Some(4));
    }

    #[test]
    fn negative_on_hand_is_preserved() {
        let fold = fold_ledger(&Vec::<ConfirmedOrder>::new(), &[transfer(1, "S1", "S2", 3)]).unwrap();
        assert_eq!(fold.on_hand(&store("S1"), &sku("X")), Some(-3));
    }

    #[test]
    fn diff_reports_missing_wrong_and_stray_rows() {
        let fold = fold_ledger(
            &[order(1, "S1", 10), order(2, "S2", 5)],
            &Vec::<ConfirmedTransfer>::new(),
        )
        .unwrap();
        let stored = vec![
            InventoryLevel { org_id: org(), store_id: store("S1"), sku_id: sku("X"), on_hand: 9 },
            InventoryLevel { org_id: org(), store_id: store("S3"), sku_id: sku("X"), on_hand: 2 },
            InventoryLevel { org_id: org(), store_id: store("S4"), sku_id: sku("X"), on_hand: 0 },
        ];
        let drift = diff_levels(&fold, &stored);
        assert_eq!(drift.len(), 3);
        assert!(drift.contains(&LevelDrift {
            store_id: store("S2"),
            sku_id: sku("X"),
            expected: Some(5),
            stored: None,
        }));
        assert!(drift.iter().any(|d| d.store_id == store("S1") && d.stored == Some(9)));
        assert!(drift.iter().any(|d| d.store_id == store("S3") && d.expected.is_none()));
    }

    #[test]
    fn transfer_deltas_are_ordered_by_store() {
        let forward = InventoryEffect::from(&transfer(1, "S1", "S2", 3)).deltas();
        let backward = InventoryEffect::from(&transfer(2, "S2", "S1", 3)).deltas();
        let stores = |d: &[LevelDelta]| d.iter().map(|d| d.store_id.clone()).collect::<Vec<_>>();
        assert_eq!(stores(&forward), vec![store("S1"), store("S2")]);
        assert_eq!(stores(&backward), vec![store("S1"), store("S2")]);
        assert_eq!(backward[0].delta, 3);
        assert_eq!(backward[1].delta, -3);
    }

    #[test]
    fn overflowing_apply_is_refused_and_leaves_the_fold_untouched() {
        let mut fold = LedgerFold::new();
        fold.apply(&InventoryEffect::from(&order(1, "S1", i64::MAX))).unwrap();
        let before = fold.clone();

        let err = fold.apply(&InventoryEffect::from(&order(2, "S1", 1))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(fold, before);

        // A move out of the full store still works.
        fold.apply(&InventoryEffect::from(&transfer(1, "S1", "S2", 1))).unwrap();
        assert_eq!(fold.on_hand(&store("S1"), &sku("X")), Some(i64::MAX - 1));
    }

    #[test]
    fn full_fold_only_checks_the_final_level() {
        // Orders alone exceed i64::MAX at S1; the transfer brings it back.
        let fold = fold_ledger(
            &[order(1, "S1", i64::MAX), order(2, "S1", 1)],
            &[transfer(1, "S1", "S2", 1)],
        )
        .unwrap();
        assert_eq!(fold.on_hand(&store("S1"), &sku("X")), Some(i64::MAX));
        assert_eq!(fold.on_hand(&store("S2"), &sku("X")), Some(1));

        let err = fold_ledger(
            &[order(1, "S1", i64::MAX), order(2, "S1", 1)],
            &Vec::<ConfirmedTransfer>::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("on-hand overflow"));
    }

    #[test]
    fn snapshot_reports_drift_against_its_own_levels() {
        let snapshot = LedgerSnapshot {
            orders: vec![order(1, "S1", 10)],
            transfers: vec![],
            levels: vec![InventoryLevel {
                org_id: org(),
                store_id: store("S1"),
                sku_id: sku("X"),
                on_hand: 7,
            }],
        };
        let (fold, drift) = snapshot.drift().unwrap();
        assert_eq!(fold.on_hand(&store("S1"), &sku("X")), Some(10));
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].stored, Some(7));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Order(usize, i64),
        Transfer(usize, usize, i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1i64..50).prop_map(|(s, q)| Op::Order(s, q)),
            (0usize..3, 0usize..3, 1i64..50)
                .prop_filter("distinct stores", |(a, b, _)| a != b)
                .prop_map(|(a, b, q)| Op::Transfer(a, b, q)),
        ]
    }

    proptest! {
        #[test]
        fn incremental_matches_full_fold(ops in prop::collection::vec(op(), 0..40)) {
            let stores = ["S1", "S2", "S3"];
            let mut incremental = LedgerFold::new();
            let mut orders = Vec::new();
            let mut transfers = Vec::new();
            for (i, op) in ops.iter().enumerate() {
                let id = i as i64 + 1;
                match op {
                    Op::Order(s, q) => {
                        let o = order(id, stores[*s], *q);
                        incremental.apply(&InventoryEffect::from(&o)).unwrap();
                        orders.push(o);
                    }
                    Op::Transfer(a, b, q) => {
                        let t = transfer(id, stores[*a], stores[*b], *q);
                        incremental.apply(&InventoryEffect::from(&t)).unwrap();
                        transfers.push(t);
                    }
                }
            }
            let rebuilt = fold_ledger(&orders, &transfers).unwrap();
            prop_assert_eq!(&rebuilt, &incremental);
            prop_assert!(diff_levels(&rebuilt, &incremental.clone().into_levels(&org())).is_empty());

            // Transfers conserve units across stores.
            let total: i64 = rebuilt.levels().values().sum();
            let received: i64 = orders.iter().map(|o| o.quantity.units()).sum();
            prop_assert_eq!(total, received);
        }
    }
}
