//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! tenant-scoped identifiers, the positive `Quantity` value object and the
//! domain error model.

pub mod error;
pub mod id;
pub mod quantity;
pub mod value_object;

pub use error::{DomainError, DomainResult};
pub use id::{ApproverId, IdempotencyKey, OrgId, SkuId, StoreId};
pub use quantity::Quantity;
pub use value_object::ValueObject;
