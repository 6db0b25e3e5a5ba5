//! In-memory backend for tests and local development.
//!
//! All state sits behind one `RwLock`; each operation takes the lock once,
//! so a ledger insert and its inventory effect are applied together or not
//! at all, and readers never observe half of a confirmation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use stockledger_core::{OrgId, SkuId, StoreId};
use stockledger_events::{AuditEvent, NewAuditEvent};
use stockledger_ledger::{
    ConfirmedOrder, ConfirmedTransfer, InventoryEffect, InventoryLevel, LedgerSnapshot, NewUser,
    OrderKey, Organization, RecordOutcome, TransferKey, UpsertOrganization, UpsertStatus, User,
    ValidOrder, ValidTransfer, add_on_hand,
};

use super::{
    AuditError, AuditLog, IdempotencyLedger, InventoryProjection, LevelFilter, OrgCounts,
    RebuiltLevels, StoreError, StoreResult, TenantDirectory,
};

type Coord = (OrgId, StoreId, SkuId);

#[derive(Debug, Default)]
struct State {
    orgs: BTreeMap<OrgId, Organization>,
    stores: BTreeSet<(OrgId, StoreId)>,
    skus: BTreeSet<(OrgId, SkuId)>,
    orders: Vec<ConfirmedOrder>,
    order_keys: HashMap<OrderKey, usize>,
    transfers: Vec<ConfirmedTransfer>,
    transfer_keys: HashMap<TransferKey, usize>,
    levels: BTreeMap<Coord, i64>,
    events: Vec<AuditEvent>,
    users: Vec<User>,
    next_order_id: i64,
    next_transfer_id: i64,
    next_event_id: i64,
    next_user_id: i64,
}

impl State {
    fn require_org(&self, org_id: &OrgId) -> StoreResult<()> {
        if self.orgs.contains_key(org_id) {
            Ok(())
        } else {
            Err(StoreError::UnknownOrg(org_id.clone()))
        }
    }

    /// Same membership rules the relational foreign keys enforce.
    fn require_member(&self, org_id: &OrgId, store_id: &StoreId, sku_id: &SkuId) -> StoreResult<()> {
        if !self.stores.contains(&(org_id.clone(), store_id.clone())) {
            return Err(StoreError::Constraint(format!(
                "store {store_id} is not a member of {org_id}"
            )));
        }
        if !self.skus.contains(&(org_id.clone(), sku_id.clone())) {
            return Err(StoreError::Constraint(format!(
                "sku {sku_id} is not a member of {org_id}"
            )));
        }
        Ok(())
    }

    /// Checked: on overflow no level changes.
    fn apply_effect(&mut self, org_id: &OrgId, effect: &InventoryEffect) -> StoreResult<()> {
        let mut updates = Vec::new();
        for d in effect.deltas() {
            let key = (org_id.clone(), d.store_id, d.sku_id);
            let current = self.levels.get(&key).copied().unwrap_or(0);
            let next =
                add_on_hand(&key.1, &key.2, current, d.delta).map_err(StoreError::out_of_range)?;
            updates.push((key, next));
        }
        self.levels.extend(updates);
        Ok(())
    }

    fn levels_of(&self, org_id: &OrgId) -> Vec<InventoryLevel> {
        self.levels
            .iter()
            .filter(|((o, _, _), _)| o == org_id)
            .map(|((o, store, sku), on_hand)| InventoryLevel {
                org_id: o.clone(),
                store_id: store.clone(),
                sku_id: sku.clone(),
                on_hand: *on_hand,
            })
            .collect()
    }

    fn snapshot(&self, org_id: &OrgId) -> StoreResult<LedgerSnapshot> {
        self.require_org(org_id)?;
        Ok(LedgerSnapshot {
            orders: self.orders.iter().filter(|r| &r.org_id == org_id).cloned().collect(),
            transfers: self
                .transfers
                .iter()
                .filter(|r| &r.org_id == org_id)
                .cloned()
                .collect(),
            levels: self.levels_of(org_id),
        })
    }

    fn purge_org(&mut self, org_id: &OrgId) {
        self.stores.retain(|(o, _)| o != org_id);
        self.skus.retain(|(o, _)| o != org_id);
        self.orders.retain(|r| &r.org_id != org_id);
        self.transfers.retain(|r| &r.org_id != org_id);
        self.order_keys = self
            .orders
            .iter()
            .enumerate()
            .map(|(i, r)| (r.natural_key(), i))
            .collect();
        self.transfer_keys = self
            .transfers
            .iter()
            .enumerate()
            .map(|(i, r)| (r.natural_key(), i))
            .collect();
        self.levels.retain(|(o, _, _), _| o != org_id);
        self.events.retain(|e| &e.org_id != org_id);
        self.users.retain(|u| &u.org_id != org_id);
    }
}

/// In-memory ledger store (tests/dev). Not durable.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<State>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| StoreError::poisoned())
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| StoreError::poisoned())
    }

    /// Overwrite one level without touching the ledger. Tests use this to
    /// simulate drift.
    pub fn tamper_level(&self, level: InventoryLevel) -> StoreResult<()> {
        let mut state = self.write()?;
        state
            .levels
            .insert((level.org_id, level.store_id, level.sku_id), level.on_hand);
        Ok(())
    }
}

#[async_trait]
impl TenantDirectory for InMemoryLedgerStore {
    async fn upsert_organization(
        &self,
        req: &UpsertOrganization,
    ) -> StoreResult<(Organization, UpsertStatus)> {
        let mut state = self.write()?;
        match state.orgs.get_mut(&req.org_id) {
            Some(existing) => {
                existing.display_name = req.display_name.clone();
                existing.notify_webhook = req.notify_webhook.clone();
                Ok((existing.clone(), UpsertStatus::Updated))
            }
            None => {
                let org = Organization {
                    org_id: req.org_id.clone(),
                    display_name: req.display_name.clone(),
                    notify_webhook: req.notify_webhook.clone(),
                    created_at: Utc::now(),
                };
                state.orgs.insert(org.org_id.clone(), org.clone());
                Ok((org, UpsertStatus::Created))
            }
        }
    }

    async fn get_organization(&self, org_id: &OrgId) -> StoreResult<Option<Organization>> {
        Ok(self.read()?.orgs.get(org_id).cloned())
    }

    async fn delete_organization(&self, org_id: &OrgId) -> StoreResult<bool> {
        let mut state = self.write()?;
        if state.orgs.remove(org_id).is_none() {
            return Ok(false);
        }
        state.purge_org(org_id);
        Ok(true)
    }

    async fn add_stores(&self, org_id: &OrgId, stores: &[StoreId]) -> StoreResult<usize> {
        let mut state = self.write()?;
        state.require_org(org_id)?;
        Ok(stores
            .iter()
            .filter(|s| state.stores.insert((org_id.clone(), (*s).clone())))
            .count())
    }

    async fn add_skus(&self, org_id: &OrgId, skus: &[SkuId]) -> StoreResult<usize> {
        let mut state = self.write()?;
        state.require_org(org_id)?;
        Ok(skus
            .iter()
            .filter(|s| state.skus.insert((org_id.clone(), (*s).clone())))
            .count())
    }

    async fn list_stores(&self, org_id: &OrgId) -> StoreResult<Vec<StoreId>> {
        let state = self.read()?;
        Ok(state
            .stores
            .iter()
            .filter(|(o, _)| o == org_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn list_skus(&self, org_id: &OrgId) -> StoreResult<Vec<SkuId>> {
        let state = self.read()?;
        Ok(state
            .skus
            .iter()
            .filter(|(o, _)| o == org_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn is_store_valid(&self, org_id: &OrgId, store_id: &StoreId) -> StoreResult<bool> {
        Ok(self.read()?.stores.contains(&(org_id.clone(), store_id.clone())))
    }

    async fn is_sku_valid(&self, org_id: &OrgId, sku_id: &SkuId) -> StoreResult<bool> {
        Ok(self.read()?.skus.contains(&(org_id.clone(), sku_id.clone())))
    }

    async fn create_user(&self, user: &NewUser) -> StoreResult<(i64, bool)> {
        let mut state = self.write()?;
        state.require_org(&user.org_id)?;
        let email = user.email.to_lowercase();
        if let Some(existing) = state.users.iter().find(|u| u.email.to_lowercase() == email) {
            return Ok((existing.id, false));
        }
        state.next_user_id += 1;
        let id = state.next_user_id;
        state.users.push(User {
            id,
            email: user.email.clone(),
            password_digest: user.password_digest.clone(),
            org_id: user.org_id.clone(),
            role: user.role.clone(),
            display_name: user.display_name.clone(),
            created_at: Utc::now(),
        });
        Ok((id, true))
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email = email.trim().to_lowercase();
        Ok(self
            .read()?
            .users
            .iter()
            .find(|u| u.email.to_lowercase() == email)
            .cloned())
    }

    async fn org_counts(&self, org_id: &OrgId) -> StoreResult<OrgCounts> {
        let state = self.read()?;
        let count = |n: usize| n as i64;
        Ok(OrgCounts {
            stores: count(state.stores.iter().filter(|(o, _)| o == org_id).count()),
            skus: count(state.skus.iter().filter(|(o, _)| o == org_id).count()),
            orders: count(state.orders.iter().filter(|r| &r.org_id == org_id).count()),
            transfers: count(state.transfers.iter().filter(|r| &r.org_id == org_id).count()),
            inventory_rows: count(state.levels.keys().filter(|(o, _, _)| o == org_id).count()),
            events: count(state.events.iter().filter(|e| &e.org_id == org_id).count()),
            users: count(state.users.iter().filter(|u| &u.org_id == org_id).count()),
        })
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedgerStore {
    async fn record_order(&self, order: ValidOrder) -> StoreResult<RecordOutcome<ConfirmedOrder>> {
        let mut state = self.write()?;
        state.require_org(&order.org_id)?;
        state.require_member(&order.org_id, &order.store_id, &order.sku_id)?;

        let key = order.natural_key();
        if let Some(&idx) = state.order_keys.get(&key) {
            return Ok(RecordOutcome::AlreadyRecorded(state.orders[idx].clone()));
        }

        let record = order.into_record(state.next_order_id + 1);
        state.apply_effect(&record.org_id, &InventoryEffect::from(&record))?;
        state.next_order_id = record.id;
        let idx = state.orders.len();
        state.orders.push(record.clone());
        state.order_keys.insert(key, idx);
        Ok(RecordOutcome::Applied(record))
    }

    async fn record_transfer(
        &self,
        transfer: ValidTransfer,
    ) -> StoreResult<RecordOutcome<ConfirmedTransfer>> {
        let mut state = self.write()?;
        state.require_org(&transfer.org_id)?;
        state.require_member(&transfer.org_id, &transfer.from_store, &transfer.sku_id)?;
        state.require_member(&transfer.org_id, &transfer.to_store, &transfer.sku_id)?;

        let key = transfer.natural_key();
        if let Some(&idx) = state.transfer_keys.get(&key) {
            return Ok(RecordOutcome::AlreadyRecorded(state.transfers[idx].clone()));
        }

        let record = transfer.into_record(state.next_transfer_id + 1);
        state.apply_effect(&record.org_id, &InventoryEffect::from(&record))?;
        state.next_transfer_id = record.id;
        let idx = state.transfers.len();
        state.transfers.push(record.clone());
        state.transfer_keys.insert(key, idx);
        Ok(RecordOutcome::Applied(record))
    }

    async fn list_orders(&self, org_id: &OrgId) -> StoreResult<Vec<ConfirmedOrder>> {
        let state = self.read()?;
        Ok(state.orders.iter().filter(|r| &r.org_id == org_id).cloned().collect())
    }

    async fn list_transfers(&self, org_id: &OrgId) -> StoreResult<Vec<ConfirmedTransfer>> {
        let state = self.read()?;
        Ok(state.transfers.iter().filter(|r| &r.org_id == org_id).cloned().collect())
    }
}

#[async_trait]
impl InventoryProjection for InMemoryLedgerStore {
    async fn inventory_level(
        &self,
        org_id: &OrgId,
        store_id: &StoreId,
        sku_id: &SkuId,
    ) -> StoreResult<Option<InventoryLevel>> {
        let state = self.read()?;
        let key = (org_id.clone(), store_id.clone(), sku_id.clone());
        Ok(state.levels.get(&key).map(|on_hand| InventoryLevel {
            org_id: key.0.clone(),
            store_id: key.1.clone(),
            sku_id: key.2.clone(),
            on_hand: *on_hand,
        }))
    }

    async fn inventory_levels(
        &self,
        org_id: &OrgId,
        filter: &LevelFilter,
    ) -> StoreResult<Vec<InventoryLevel>> {
        let state = self.read()?;
        Ok(state
            .levels
            .iter()
            .filter(|((o, store, sku), _)| {
                o == org_id
                    && filter.store_id.as_ref().is_none_or(|s| s == store)
                    && filter.sku_id.as_ref().is_none_or(|s| s == sku)
            })
            .map(|((o, store, sku), on_hand)| InventoryLevel {
                org_id: o.clone(),
                store_id: store.clone(),
                sku_id: sku.clone(),
                on_hand: *on_hand,
            })
            .collect())
    }

    async fn ledger_snapshot(&self, org_id: &OrgId) -> StoreResult<LedgerSnapshot> {
        self.read()?.snapshot(org_id)
    }

    async fn rebuild_levels(&self, org_id: &OrgId) -> StoreResult<RebuiltLevels> {
        let mut state = self.write()?;
        let (fold, drift) = state
            .snapshot(org_id)?
            .drift()
            .map_err(StoreError::out_of_range)?;
        let levels = fold.into_levels(org_id);
        state.levels.retain(|(o, _, _), _| o != org_id);
        for level in &levels {
            state.levels.insert(
                (level.org_id.clone(), level.store_id.clone(), level.sku_id.clone()),
                level.on_hand,
            );
        }
        Ok(RebuiltLevels {
            drift,
            rows: levels.len(),
        })
    }
}

#[async_trait]
impl AuditLog for InMemoryLedgerStore {
    async fn append(&self, event: NewAuditEvent) -> Result<AuditEvent, AuditError> {
        let mut state = self.write()?;
        state.require_org(&event.org_id)?;
        state.next_event_id += 1;
        let stored = AuditEvent::from_new(state.next_event_id, event);
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn poll_events(
        &self,
        org_id: &OrgId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, AuditError> {
        let state = self.read()?;
        Ok(state
            .events
            .iter()
            .filter(|e| &e.org_id == org_id && e.id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_events(&self, org_id: &OrgId, limit: usize) -> Result<Vec<AuditEvent>, AuditError> {
        let state = self.read()?;
        let mut events: Vec<AuditEvent> = state
            .events
            .iter()
            .filter(|e| &e.org_id == org_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at).then(b.id.cmp(&a.id)));
        events.truncate(limit);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockledger_core::{ApproverId, IdempotencyKey, Quantity};

    fn id<T: std::str::FromStr>(s: &str) -> T
    where
        T::Err: core::fmt::Debug,
    {
        s.parse().unwrap()
    }

    async fn seeded() -> InMemoryLedgerStore {
        let store = InMemoryLedgerStore::new();
        store
            .upsert_organization(&UpsertOrganization {
                org_id: id("A"),
                display_name: None,
                notify_webhook: None,
            })
            .await
            .unwrap();
        store.add_stores(&id("A"), &[id("S1"), id("S2")]).await.unwrap();
        store.add_skus(&id("A"), &[id("X")]).await.unwrap();
        store
    }

    fn order(key: &str, qty: i64) -> ValidOrder {
        ValidOrder {
            org_id: id("A"),
            store_id: id("S1"),
            sku_id: id("X"),
            quantity: Quantity::new(qty).unwrap(),
            approved_at: Utc::now(),
            approved_by: ApproverId::new("ops").unwrap(),
            idempotency_key: IdempotencyKey::new(key).unwrap(),
        }
    }

    #[tokio::test]
    async fn membership_inserts_are_idempotent() {
        let store = seeded().await;
        let added = store.add_stores(&id("A"), &[id("S2"), id("S3")]).await.unwrap();
        assert_eq!(added, 1);
        assert_eq!(store.list_stores(&id("A")).await.unwrap().len(), 3);
        assert!(store.is_store_valid(&id("A"), &id("S3")).await.unwrap());
        assert!(!store.is_store_valid(&id("B"), &id("S3")).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_order_returns_original_row() {
        let store = seeded().await;
        let first = store.record_order(order("k1", 10)).await.unwrap();
        let second = store.record_order(order("k1", 99)).await.unwrap();
        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(second.record().quantity.units(), 10);
        let level = store.inventory_level(&id("A"), &id("S1"), &id("X")).await.unwrap().unwrap();
        assert_eq!(level.on_hand, 10);
    }

    #[tokio::test]
    async fn overflowing_order_is_refused_without_side_effects() {
        let store = seeded().await;
        store.record_order(order("full", i64::MAX)).await.unwrap();

        let err = store.record_order(order("one-more", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange(_)));
        assert!(!err.is_retryable());

        let level = store.inventory_level(&id("A"), &id("S1"), &id("X")).await.unwrap().unwrap();
        assert_eq!(level.on_hand, i64::MAX);
        assert_eq!(store.list_orders(&id("A")).await.unwrap().len(), 1);

        // The lock is not poisoned and ids stay dense.
        let other = store
            .record_order(ValidOrder {
                store_id: id("S2"),
                ..order("s2", 5)
            })
            .await
            .unwrap();
        assert_eq!(other.record().id, 2);
    }

    #[tokio::test]
    async fn rebuild_restores_levels_and_reports_drift() {
        let store = seeded().await;
        store.record_order(order("k1", 10)).await.unwrap();
        store
            .tamper_level(InventoryLevel {
                org_id: id("A"),
                store_id: id("S1"),
                sku_id: id("X"),
                on_hand: 3,
            })
            .unwrap();
        store
            .tamper_level(InventoryLevel {
                org_id: id("A"),
                store_id: id("S2"),
                sku_id: id("X"),
                on_hand: 8,
            })
            .unwrap();

        let snapshot = store.ledger_snapshot(&id("A")).await.unwrap();
        assert_eq!(snapshot.orders.len(), 1);
        assert_eq!(snapshot.levels.len(), 2);

        let rebuilt = store.rebuild_levels(&id("A")).await.unwrap();
        assert_eq!(rebuilt.drift.len(), 2);
        assert_eq!(rebuilt.rows, 1);
        let levels = store.inventory_levels(&id("A"), &LevelFilter::default()).await.unwrap();
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].on_hand, 10);

        assert!(matches!(
            store.rebuild_levels(&id("B")).await,
            Err(StoreError::UnknownOrg(_))
        ));
    }

    #[tokio::test]
    async fn delete_cascades_everything() {
        let store = seeded().await;
        store.record_order(order("k1", 3)).await.unwrap();
        store
            .emit(&id("A"), "custom".into(), serde_json::json!({}))
            .await
            .unwrap();
        assert!(store.delete_organization(&id("A")).await.unwrap());
        assert_eq!(store.org_counts(&id("A")).await.unwrap(), OrgCounts::default());
        assert!(!store.delete_organization(&id("A")).await.unwrap());
    }

    #[tokio::test]
    async fn users_are_unique_by_lowercased_email() {
        let store = seeded().await;
        let user = NewUser::new("Ana@X.io", "pw", id("A"), None, None).unwrap();
        let (first, created) = store.create_user(&user).await.unwrap();
        assert!(created);
        let again = NewUser::new("ana@x.io", "other", id("A"), None, None).unwrap();
        assert_eq!(store.create_user(&again).await.unwrap(), (first, false));
        let found = store.find_user_by_email("ANA@x.io").await.unwrap().unwrap();
        assert!(found.verify_password("pw"));
    }
}
