//! Confirmation requests and the ledger records they become.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockledger_core::{
    ApproverId, DomainError, DomainResult, IdempotencyKey, OrgId, Quantity, SkuId, StoreId,
};

/// Request: confirm one replenishment order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOrder {
    pub org_id: OrgId,
    pub store_id: StoreId,
    pub sku_id: SkuId,
    /// Raw units as submitted; validated into a [`Quantity`].
    pub quantity: i64,
    pub approved_by: ApproverId,
    pub idempotency_key: IdempotencyKey,
}

/// Request: confirm one stock movement between two stores of an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmTransfer {
    pub org_id: OrgId,
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub sku_id: SkuId,
    pub quantity: i64,
    pub approved_by: ApproverId,
    pub idempotency_key: IdempotencyKey,
}

/// A shape-validated order, ready for the tenant check and the ledger insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidOrder {
    pub org_id: OrgId,
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub quantity: Quantity,
    pub approved_at: DateTime<Utc>,
    pub approved_by: ApproverId,
    pub idempotency_key: IdempotencyKey,
}

/// A shape-validated transfer (positive quantity, distinct stores).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTransfer {
    pub org_id: OrgId,
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub sku_id: SkuId,
    pub quantity: Quantity,
    pub approved_at: DateTime<Utc>,
    pub approved_by: ApproverId,
    pub idempotency_key: IdempotencyKey,
}

impl ConfirmOrder {
    pub fn validate(self, approved_at: DateTime<Utc>) -> DomainResult<ValidOrder> {
        let quantity = Quantity::new(self.quantity)?;
        Ok(ValidOrder {
            org_id: self.org_id,
            store_id: self.store_id,
            sku_id: self.sku_id,
            quantity,
            approved_at,
            approved_by: self.approved_by,
            idempotency_key: self.idempotency_key,
        })
    }
}

impl ConfirmTransfer {
    pub fn validate(self, approved_at: DateTime<Utc>) -> DomainResult<ValidTransfer> {
        let quantity = Quantity::new(self.quantity)?;
        if self.from_store == self.to_store {
            return Err(DomainError::validation(format!(
                "transfer source and destination must differ (both {})",
                self.from_store
            )));
        }
        Ok(ValidTransfer {
            org_id: self.org_id,
            from_store: self.from_store,
            to_store: self.to_store,
            sku_id: self.sku_id,
            quantity,
            approved_at,
            approved_by: self.approved_by,
            idempotency_key: self.idempotency_key,
        })
    }
}

/// Natural key of a confirmed order: `(org, store, sku, idem_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderKey {
    pub org_id: OrgId,
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub idempotency_key: IdempotencyKey,
}

/// Natural key of a confirmed transfer: `(org, from, to, sku, idem_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub org_id: OrgId,
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub sku_id: SkuId,
    pub idempotency_key: IdempotencyKey,
}

impl ValidOrder {
    pub fn natural_key(&self) -> OrderKey {
        OrderKey {
            org_id: self.org_id.clone(),
            store_id: self.store_id.clone(),
            sku_id: self.sku_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn into_record(self, id: i64) -> ConfirmedOrder {
        ConfirmedOrder {
            id,
            org_id: self.org_id,
            store_id: self.store_id,
            sku_id: self.sku_id,
            quantity: self.quantity,
            approved_at: self.approved_at,
            approved_by: self.approved_by,
            idempotency_key: self.idempotency_key,
        }
    }
}

impl ValidTransfer {
    pub fn natural_key(&self) -> TransferKey {
        TransferKey {
            org_id: self.org_id.clone(),
            from_store: self.from_store.clone(),
            to_store: self.to_store.clone(),
            sku_id: self.sku_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }

    pub fn into_record(self, id: i64) -> ConfirmedTransfer {
        ConfirmedTransfer {
            id,
            org_id: self.org_id,
            from_store: self.from_store,
            to_store: self.to_store,
            sku_id: self.sku_id,
            quantity: self.quantity,
            approved_at: self.approved_at,
            approved_by: self.approved_by,
            idempotency_key: self.idempotency_key,
        }
    }
}

/// Ledger row: one applied replenishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedOrder {
    pub id: i64,
    pub org_id: OrgId,
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub quantity: Quantity,
    pub approved_at: DateTime<Utc>,
    pub approved_by: ApproverId,
    pub idempotency_key: IdempotencyKey,
}

/// Ledger row: one applied store-to-store movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedTransfer {
    pub id: i64,
    pub org_id: OrgId,
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub sku_id: SkuId,
    pub quantity: Quantity,
    pub approved_at: DateTime<Utc>,
    pub approved_by: ApproverId,
    pub idempotency_key: IdempotencyKey,
}

impl ConfirmedOrder {
    pub fn natural_key(&self) -> OrderKey {
        OrderKey {
            org_id: self.org_id.clone(),
            store_id: self.store_id.clone(),
            sku_id: self.sku_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}

impl ConfirmedTransfer {
    pub fn natural_key(&self) -> TransferKey {
        TransferKey {
            org_id: self.org_id.clone(),
            from_store: self.from_store.clone(),
            to_store: self.to_store.clone(),
            sku_id: self.sku_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
        }
    }
}
