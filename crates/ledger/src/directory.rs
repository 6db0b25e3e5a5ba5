//! Tenant directory model: organizations, their store/SKU universes and the
//! user credentials stored for lookup.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use stockledger_core::{DomainError, DomainResult, OrgId, SkuId, StoreId};

/// A tenant. Owns every store/SKU membership, ledger row, inventory level,
/// audit event and user attached to its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: OrgId,
    pub display_name: Option<String>,
    /// Outbound notification endpoint (e.g. an incoming-webhook URL).
    pub notify_webhook: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Create-or-update request for an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOrganization {
    pub org_id: OrgId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub notify_webhook: Option<String>,
}

impl UpsertOrganization {
    /// Blank strings are treated as absent; webhooks must be http(s) URLs.
    pub fn normalized(mut self) -> DomainResult<Self> {
        self.display_name = non_blank(self.display_name);
        self.notify_webhook = non_blank(self.notify_webhook);
        if let Some(url) = &self.notify_webhook {
            if !(url.starts_with("https://") || url.starts_with("http://")) {
                return Err(DomainError::validation(format!(
                    "notify_webhook must be an http(s) URL (got {url:?})"
                )));
            }
        }
        Ok(self)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Whether an upsert created the organization or refreshed an existing one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertStatus {
    Created,
    Updated,
}

/// Snapshot of an organization's permitted coordinates.
///
/// Absence means "not permitted": an empty scope rejects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrgScope {
    pub stores: BTreeSet<StoreId>,
    pub skus: BTreeSet<SkuId>,
}

impl OrgScope {
    pub fn is_store_valid(&self, store_id: &StoreId) -> bool {
        self.stores.contains(store_id)
    }

    pub fn is_sku_valid(&self, sku_id: &SkuId) -> bool {
        self.skus.contains(sku_id)
    }
}

/// Parse raw membership ids, skipping blanks and the `nan` placeholder that
/// spreadsheet exports leave behind, and dropping duplicates.
pub fn parse_member_ids<T, I, S>(raw: I) -> Vec<T>
where
    T: core::str::FromStr + Ord,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<T> = raw
        .into_iter()
        .filter(|s| !s.as_ref().trim().eq_ignore_ascii_case("nan"))
        .filter_map(|s| s.as_ref().parse::<T>().ok())
        .collect();
    set.into_iter().collect()
}

/// A stored user credential record (lookup only, no sessions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_digest: String,
    pub org_id: OrgId,
    pub role: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn verify_password(&self, password: &str) -> bool {
        self.password_digest == password_digest(password)
    }
}

/// Request to store a user credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub password_digest: String,
    pub org_id: OrgId,
    pub role: String,
    pub display_name: Option<String>,
}

impl NewUser {
    pub const DEFAULT_ROLE: &'static str = "member";

    pub fn new(
        email: &str,
        password: &str,
        org_id: OrgId,
        role: Option<&str>,
        display_name: Option<String>,
    ) -> DomainResult<Self> {
        let email = normalize_email(email)?;
        if password.is_empty() {
            return Err(DomainError::validation("password cannot be empty"));
        }
        let role = role
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(Self::DEFAULT_ROLE)
            .to_string();
        Ok(Self {
            email,
            password_digest: password_digest(password),
            org_id,
            role,
            display_name: non_blank(display_name),
        })
    }
}

/// Lower-cased, trimmed email with a minimal shape check.
pub fn normalize_email(raw: &str) -> DomainResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.'),
        None => false,
    };
    if !valid || email.len() > 320 {
        return Err(DomainError::validation(format!("invalid email {raw:?}")));
    }
    Ok(email)
}

/// Hex SHA-256 of the password.
pub fn password_digest(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
