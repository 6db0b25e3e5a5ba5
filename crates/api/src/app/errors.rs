use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use stockledger_core::DomainError;
use stockledger_infra::{ApplyError, AuditError, ReconcileError, StoreError};

pub fn apply_error_to_response(err: ApplyError) -> axum::response::Response {
    match err {
        ApplyError::Validation(e) => domain_error_to_response(e),
        ApplyError::Persistence(e) => store_error_to_response(e),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::OutOfScope(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "out_of_scope", msg)
        }
        DomainError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::UnknownOrg(org_id) => not_found(format!("organization {org_id}")),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Constraint(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "constraint_violation", msg)
        }
        StoreError::OutOfRange(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "out_of_range", msg)
        }
        e @ (StoreError::Unavailable(_) | StoreError::Storage(_)) => {
            tracing::warn!(error = %e, "storage failure");
            retryable_error(e.to_string())
        }
        StoreError::Decode(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "corrupt_row", msg)
        }
    }
}

pub fn audit_error_to_response(err: AuditError) -> axum::response::Response {
    match err {
        AuditError::Store(e) => store_error_to_response(e),
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "audit_error", other.to_string()),
    }
}

pub fn reconcile_error_to_response(err: ReconcileError) -> axum::response::Response {
    match err {
        ReconcileError::UnknownOrg(org_id) => not_found(format!("organization {org_id}")),
        ReconcileError::Store(e) => store_error_to_response(e),
    }
}

pub fn not_found(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", message)
}

/// 503 telling the caller to retry with the same idempotency key.
pub fn retryable_error(message: impl Into<String>) -> axum::response::Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(json!({
            "error": "persistence_failure",
            "message": message.into(),
            "retryable": true,
        })),
    )
        .into_response()
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
