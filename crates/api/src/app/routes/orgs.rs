use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use stockledger_core::{OrgId, SkuId, StoreId};
use stockledger_infra::TenantDirectory;
use stockledger_ledger::directory::parse_member_ids;
use stockledger_ledger::{NewUser, UpsertOrganization, UpsertStatus};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OrgContext;

/// POST /orgs
pub async fn upsert_org(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::UpsertOrganizationRequest>,
) -> axum::response::Response {
    let org_id: OrgId = match dto::parse_id(&body.org_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let req = UpsertOrganization {
        org_id,
        display_name: body.display_name,
        notify_webhook: body.notify_webhook,
    };
    match services.applier.register_organization(req).await {
        Ok((organization, status)) => {
            let code = match status {
                UpsertStatus::Created => StatusCode::CREATED,
                UpsertStatus::Updated => StatusCode::OK,
            };
            (
                code,
                Json(json!({
                    "status": status,
                    "organization": organization,
                })),
            )
                .into_response()
        }
        Err(e) => errors::apply_error_to_response(e),
    }
}

/// GET /orgs/:org_id
pub async fn get_org(Extension(org): Extension<OrgContext>) -> axum::response::Response {
    Json(org.organization().clone()).into_response()
}

/// DELETE /orgs/:org_id. Cascades to every owned record.
pub async fn delete_org(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    match services.store.delete_organization(org.org_id()).await {
        Ok(true) => {
            tracing::info!(org_id = %org.org_id(), "organization deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => errors::not_found(format!("organization {}", org.org_id())),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /orgs/:org_id/stores
pub async fn add_stores(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Json(body): Json<dto::MembershipRequest>,
) -> axum::response::Response {
    let ids: Vec<StoreId> = parse_member_ids(&body.ids);
    match services.store.add_stores(org.org_id(), &ids).await {
        Ok(added) => Json(json!({ "added": added, "requested": ids.len() })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /orgs/:org_id/stores
pub async fn list_stores(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    match services.store.list_stores(org.org_id()).await {
        Ok(stores) => Json(json!({ "stores": stores })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /orgs/:org_id/skus
pub async fn add_skus(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Json(body): Json<dto::MembershipRequest>,
) -> axum::response::Response {
    let ids: Vec<SkuId> = parse_member_ids(&body.ids);
    match services.store.add_skus(org.org_id(), &ids).await {
        Ok(added) => Json(json!({ "added": added, "requested": ids.len() })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /orgs/:org_id/skus
pub async fn list_skus(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    match services.store.list_skus(org.org_id()).await {
        Ok(skus) => Json(json!({ "skus": skus })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /orgs/:org_id/users
pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Json(body): Json<dto::CreateUserRequest>,
) -> axum::response::Response {
    let user = match NewUser::new(
        &body.email,
        &body.password,
        org.org_id().clone(),
        body.role.as_deref(),
        body.display_name,
    ) {
        Ok(u) => u,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.store.create_user(&user).await {
        Ok((id, created)) => {
            let code = if created { StatusCode::CREATED } else { StatusCode::OK };
            (code, Json(json!({ "id": id, "created": created }))).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /users/verify
pub async fn verify_credentials(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::VerifyCredentialsRequest>,
) -> axum::response::Response {
    match services.applier.verify_credentials(&body.email, &body.password).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "email or password is incorrect",
        ),
        Err(e) => errors::apply_error_to_response(e),
    }
}

/// GET /orgs/:org_id/diagnostics
pub async fn diagnostics(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    match services.store.org_counts(org.org_id()).await {
        Ok(counts) => Json(json!({ "org_id": org.org_id(), "counts": counts })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
