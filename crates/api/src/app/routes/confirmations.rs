use std::sync::Arc;

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use stockledger_ledger::{ConfirmOrder, ConfirmTransfer, Receipt};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::OrgContext;

/// 201 for a first application, 200 for a replay.
fn receipt_response(receipt: Receipt) -> Response {
    let code = if receipt.is_duplicate() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (code, Json(receipt)).into_response()
}

fn order_request(
    org: &OrgContext,
    headers: &HeaderMap,
    body: dto::ConfirmOrderRequest,
) -> Result<ConfirmOrder, Response> {
    Ok(ConfirmOrder {
        org_id: org.org_id().clone(),
        store_id: dto::parse_id(&body.store_id)?,
        sku_id: dto::parse_id(&body.sku_id)?,
        quantity: body.qty,
        approved_by: dto::parse_approver(&body.approved_by)?,
        idempotency_key: dto::idempotency_key(body.idempotency_key.as_deref(), headers)?,
    })
}

fn transfer_request(
    org: &OrgContext,
    headers: &HeaderMap,
    body: dto::ConfirmTransferRequest,
) -> Result<ConfirmTransfer, Response> {
    Ok(ConfirmTransfer {
        org_id: org.org_id().clone(),
        from_store: dto::parse_id(&body.from_store)?,
        to_store: dto::parse_id(&body.to_store)?,
        sku_id: dto::parse_id(&body.sku_id)?,
        quantity: body.qty,
        approved_by: dto::parse_approver(&body.approved_by)?,
        idempotency_key: dto::idempotency_key(body.idempotency_key.as_deref(), headers)?,
    })
}

/// POST /orgs/:org_id/orders
pub async fn confirm_order(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    headers: HeaderMap,
    Json(body): Json<dto::ConfirmOrderRequest>,
) -> Response {
    let req = match order_request(&org, &headers, body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    match services.applier.confirm_order(req).await {
        Ok(receipt) => receipt_response(receipt),
        Err(e) => errors::apply_error_to_response(e),
    }
}

/// POST /orgs/:org_id/transfers
pub async fn confirm_transfer(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    headers: HeaderMap,
    Json(body): Json<dto::ConfirmTransferRequest>,
) -> Response {
    let req = match transfer_request(&org, &headers, body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    match services.applier.confirm_transfer(req).await {
        Ok(receipt) => receipt_response(receipt),
        Err(e) => errors::apply_error_to_response(e),
    }
}

/// POST /orgs/:org_id/orders/batch
pub async fn confirm_order_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Json(body): Json<dto::OrderBatchRequest>,
) -> Response {
    let approver = match dto::parse_approver(&body.approved_by) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match services
        .applier
        .confirm_orders(org.org_id(), &approver, &body.idem_prefix, body.lines)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::apply_error_to_response(e),
    }
}

/// POST /orgs/:org_id/transfers/batch
pub async fn confirm_transfer_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Json(body): Json<dto::TransferBatchRequest>,
) -> Response {
    let approver = match dto::parse_approver(&body.approved_by) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    match services
        .applier
        .confirm_transfers(org.org_id(), &approver, &body.idem_prefix, body.lines)
        .await
    {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::apply_error_to_response(e),
    }
}
