//! Strongly-typed identifiers used across the domain.
//!
//! Organization, store and SKU identifiers are caller-supplied strings (for
//! example `"org_demo"`, `"S001"`, `"SKU-0042"`); they are scoped by the
//! organization, never global. Construction trims surrounding whitespace and
//! rejects blank or oversized values.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identifier of an organization (the tenant / isolation boundary).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrgId(String);

/// Identifier of a store, meaningful only within one organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoreId(String);

/// Identifier of a SKU, meaningful only within one organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SkuId(String);

/// Caller-supplied token that makes a confirmation apply at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

/// Identity of whoever approved a confirmation (usually an email address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ApproverId(String);

macro_rules! impl_string_newtype {
    ($t:ident, $name:literal, $max:expr) => {
        impl $t {
            /// Maximum accepted length in bytes (matches the column width).
            pub const MAX_LEN: usize = $max;

            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                let trimmed = value.trim();
                if trimmed.is_empty() {
                    return Err(DomainError::invalid_id(format!("{} cannot be blank", $name)));
                }
                if trimmed.len() > Self::MAX_LEN {
                    return Err(DomainError::invalid_id(format!(
                        "{} exceeds {} bytes",
                        $name,
                        Self::MAX_LEN
                    )));
                }
                if trimmed.len() == value.len() {
                    Ok(Self(value))
                } else {
                    Ok(Self(trimmed.to_string()))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_string_newtype!(OrgId, "org_id", 128);
impl_string_newtype!(StoreId, "store_id", 128);
impl_string_newtype!(SkuId, "sku_id", 128);
impl_string_newtype!(IdempotencyKey, "idem_key", 256);
impl_string_newtype!(ApproverId, "approved_by", 128);
