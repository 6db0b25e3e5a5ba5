use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use stockledger_infra::{InventoryProjection, LevelFilter};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OrgContext;

/// GET /orgs/:org_id/inventory[?store_id=&sku_id=]
pub async fn get_inventory(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<dto::InventoryQuery>,
) -> axum::response::Response {
    let filter = match (
        dto::parse_optional_id(query.store_id.as_deref()),
        dto::parse_optional_id(query.sku_id.as_deref()),
    ) {
        (Ok(store_id), Ok(sku_id)) => LevelFilter { store_id, sku_id },
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    match services.store.inventory_levels(org.org_id(), &filter).await {
        Ok(levels) => Json(json!({ "org_id": org.org_id(), "levels": levels })).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
