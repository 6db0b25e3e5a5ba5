use std::sync::Arc;

use axum::{
    extract::{Path, State},
    middleware::Next,
    response::Response,
};
use stockledger_core::OrgId;
use stockledger_infra::TenantDirectory;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::OrgContext;

/// Resolve `:org_id` into an [`OrgContext`]. Unknown or malformed ids are
/// rejected with 404 before any handler runs.
pub async fn org_middleware(
    State(services): State<Arc<AppServices>>,
    Path(raw_org_id): Path<String>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Ok(org_id) = raw_org_id.parse::<OrgId>() else {
        return errors::not_found(format!("organization {raw_org_id:?}"));
    };

    let organization = match services.store.get_organization(&org_id).await {
        Ok(Some(org)) => org,
        Ok(None) => return errors::not_found(format!("organization {org_id}")),
        Err(e) => return errors::store_error_to_response(e),
    };

    req.extensions_mut().insert(OrgContext::new(organization));
    next.run(req).await
}
