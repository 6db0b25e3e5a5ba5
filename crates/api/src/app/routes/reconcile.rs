use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::OrgContext;

/// POST /orgs/:org_id/reconcile. Reports drift, never corrects it.
pub async fn reconcile(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    match services.reconciler.reconcile(org.org_id()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::reconcile_error_to_response(e),
    }
}

/// POST /orgs/:org_id/repair. Rebuilds the projection from the ledger.
pub async fn repair(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    match services.reconciler.repair(org.org_id()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::reconcile_error_to_response(e),
    }
}
