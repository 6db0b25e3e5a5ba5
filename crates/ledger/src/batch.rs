//! Batch approvals: many lines confirmed under one approver and key prefix.

use serde::{Deserialize, Serialize};

use stockledger_core::{
    ApproverId, DomainError, DomainResult, IdempotencyKey, OrgId, SkuId, StoreId,
};

use crate::confirmation::{ConfirmOrder, ConfirmTransfer};
use crate::outcome::ConfirmationStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub store_id: StoreId,
    pub sku_id: SkuId,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub from_store: StoreId,
    pub to_store: StoreId,
    pub sku_id: SkuId,
    pub quantity: i64,
}

/// `{prefix}:{store}:{sku}`. Re-running a batch with the same prefix replays it.
pub fn order_line_key(prefix: &str, line: &OrderLine) -> DomainResult<IdempotencyKey> {
    IdempotencyKey::new(format!("{}:{}:{}", prefix.trim(), line.store_id, line.sku_id))
}

/// `{prefix}:{from}:{to}:{sku}`.
pub fn transfer_line_key(prefix: &str, line: &TransferLine) -> DomainResult<IdempotencyKey> {
    IdempotencyKey::new(format!(
        "{}:{}:{}:{}",
        prefix.trim(),
        line.from_store,
        line.to_store,
        line.sku_id
    ))
}

fn check_prefix(prefix: &str) -> DomainResult<()> {
    if prefix.trim().is_empty() {
        return Err(DomainError::validation("idempotency prefix cannot be blank"));
    }
    Ok(())
}

impl OrderLine {
    pub fn into_request(
        self,
        org_id: &OrgId,
        approved_by: &ApproverId,
        prefix: &str,
    ) -> DomainResult<ConfirmOrder> {
        check_prefix(prefix)?;
        let idempotency_key = order_line_key(prefix, &self)?;
        Ok(ConfirmOrder {
            org_id: org_id.clone(),
            store_id: self.store_id,
            sku_id: self.sku_id,
            quantity: self.quantity,
            approved_by: approved_by.clone(),
            idempotency_key,
        })
    }
}

impl TransferLine {
    pub fn into_request(
        self,
        org_id: &OrgId,
        approved_by: &ApproverId,
        prefix: &str,
    ) -> DomainResult<ConfirmTransfer> {
        check_prefix(prefix)?;
        let idempotency_key = transfer_line_key(prefix, &self)?;
        Ok(ConfirmTransfer {
            org_id: org_id.clone(),
            from_store: self.from_store,
            to_store: self.to_store,
            sku_id: self.sku_id,
            quantity: self.quantity,
            approved_by: approved_by.clone(),
            idempotency_key,
        })
    }
}

/// Per-line result inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum LineResult {
    Accepted {
        idempotency_key: IdempotencyKey,
        status: ConfirmationStatus,
        ledger_id: i64,
    },
    Rejected {
        line: usize,
        reason: String,
    },
}

/// Counts returned for a batch. Lines are independent: a rejected line never
/// prevents the others from applying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub applied: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub lines: Vec<LineResult>,
}

impl BatchSummary {
    pub fn accepted(&mut self, idempotency_key: IdempotencyKey, status: ConfirmationStatus, ledger_id: i64) {
        match status {
            ConfirmationStatus::Recorded => self.applied += 1,
            ConfirmationStatus::Duplicate => self.duplicates += 1,
        }
        self.lines.push(LineResult::Accepted {
            idempotency_key,
            status,
            ledger_id,
        });
    }

    pub fn rejected(&mut self, line: usize, reason: impl Into<String>) {
        self.rejected += 1;
        self.lines.push(LineResult::Rejected {
            line,
            reason: reason.into(),
        });
    }

    pub fn total(&self) -> usize {
        self.applied + self.duplicates + self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> TransferLine {
        TransferLine {
            from_store: StoreId::new("S1").unwrap(),
            to_store: StoreId::new("S2").unwrap(),
            sku_id: SkuId::new("X").unwrap(),
            quantity: 4,
        }
    }

    #[test]
    fn keys_are_derived_from_prefix_and_coordinates() {
        let order = OrderLine {
            store_id: StoreId::new("S1").unwrap(),
            sku_id: SkuId::new("X").unwrap(),
            quantity: 2,
        };
        assert_eq!(order_line_key("run-7", &order).unwrap().as_str(), "run-7:S1:X");
        assert_eq!(transfer_line_key(" run-7 ", &line()).unwrap().as_str(), "run-7:S1:S2:X");
    }

    #[test]
    fn blank_prefix_is_rejected() {
        let org = OrgId::new("A").unwrap();
        let who = ApproverId::new("ops").unwrap();
        assert!(line().into_request(&org, &who, "  ").is_err());
        let req = line().into_request(&org, &who, "p").unwrap();
        assert_eq!(req.idempotency_key.as_str(), "p:S1:S2:X");
    }

    #[test]
    fn summary_counts_each_outcome() {
        let mut s = BatchSummary::default();
        let key = IdempotencyKey::new("k").unwrap();
        s.accepted(key.clone(), ConfirmationStatus::Recorded, 1);
        s.accepted(key, ConfirmationStatus::Duplicate, 1);
        s.rejected(2, "unknown store");
        assert_eq!((s.applied, s.duplicates, s.rejected), (1, 1, 1));
        assert_eq!(s.total(), 3);
    }
}
