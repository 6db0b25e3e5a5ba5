//! Audit log reads for external consumers: cursor polling, latest events
//! and the live SSE feed.

use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use stockledger_events::EventPage;

use crate::app::services::{self, AppServices};
use crate::app::{dto, errors};
use crate::context::OrgContext;

/// GET /orgs/:org_id/events?after=&limit=
///
/// Events with `id > after` in ascending order; resume with the returned
/// `cursor`.
pub async fn poll_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<dto::EventPollQuery>,
) -> axum::response::Response {
    let after = query.after.unwrap_or(0).max(0);
    let limit = dto::page_limit(query.limit, services.event_poll_max);
    match services.audit.poll_events(org.org_id(), after, limit).await {
        Ok(events) => Json(EventPage::new(events, after)).into_response(),
        Err(e) => errors::audit_error_to_response(e),
    }
}

/// GET /orgs/:org_id/events/recent?limit=
pub async fn recent_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
    Query(query): Query<dto::EventPollQuery>,
) -> axum::response::Response {
    let limit = dto::page_limit(query.limit, services.event_poll_max);
    match services.audit.recent_events(org.org_id(), limit).await {
        Ok(events) => Json(json!({ "events": events })).into_response(),
        Err(e) => errors::audit_error_to_response(e),
    }
}

/// GET /orgs/:org_id/events/stream
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(org): Extension<OrgContext>,
) -> axum::response::Response {
    services::org_sse_stream(services, org.org_id().clone()).into_response()
}
