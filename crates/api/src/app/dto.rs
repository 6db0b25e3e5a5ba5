use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use stockledger_core::{ApproverId, DomainError, IdempotencyKey};
use stockledger_ledger::{OrderLine, TransferLine};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct UpsertOrganizationRequest {
    pub org_id: String,
    pub display_name: Option<String>,
    pub notify_webhook: Option<String>,
}

/// Raw ids; blanks and duplicates are dropped.
#[derive(Debug, Deserialize)]
pub struct MembershipRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub role: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyCredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmOrderRequest {
    pub store_id: String,
    pub sku_id: String,
    pub qty: i64,
    pub approved_by: String,
    #[serde(alias = "idem_key")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmTransferRequest {
    pub from_store: String,
    pub to_store: String,
    pub sku_id: String,
    pub qty: i64,
    pub approved_by: String,
    #[serde(alias = "idem_key")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OrderBatchRequest {
    pub approved_by: String,
    pub idem_prefix: String,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Deserialize)]
pub struct TransferBatchRequest {
    pub approved_by: String,
    pub idem_prefix: String,
    pub lines: Vec<TransferLine>,
}

#[derive(Debug, Default, Deserialize)]
pub struct InventoryQuery {
    pub store_id: Option<String>,
    pub sku_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventPollQuery {
    pub after: Option<i64>,
    pub limit: Option<usize>,
}

// -------------------------
// Parsing helpers
// -------------------------

/// Parse a typed id, mapping failures to a 400 JSON response.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: core::str::FromStr<Err = DomainError>,
{
    raw.parse::<T>().map_err(errors::domain_error_to_response)
}

pub fn parse_optional_id<T>(raw: Option<&str>) -> Result<Option<T>, axum::response::Response>
where
    T: core::str::FromStr<Err = DomainError>,
{
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => parse_id(s).map(Some),
        None => Ok(None),
    }
}

pub fn parse_approver(raw: &str) -> Result<ApproverId, axum::response::Response> {
    parse_id(raw)
}

/// Body field first, then the `Idempotency-Key` header.
pub fn idempotency_key(
    body: Option<&str>,
    headers: &HeaderMap,
) -> Result<IdempotencyKey, axum::response::Response> {
    let header = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok());
    match body.or(header) {
        Some(raw) => parse_id(raw),
        None => Err(errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "idempotency_key is required (body field or Idempotency-Key header)",
        )),
    }
}

/// Clamp a requested page size to `[1, max]`.
pub fn page_limit(requested: Option<usize>, max: usize) -> usize {
    requested.unwrap_or(max).clamp(1, max)
}
