use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::app::services::AppServices;
use crate::middleware;

pub mod confirmations;
pub mod events;
pub mod inventory;
pub mod orgs;
pub mod reconcile;
pub mod system;

/// Public routes plus everything under `/orgs/:org_id`, which goes through
/// the org middleware first.
pub fn router(services: Arc<AppServices>) -> Router {
    let org_scoped = Router::new()
        .route("/orgs/:org_id", get(orgs::get_org).delete(orgs::delete_org))
        .route("/orgs/:org_id/stores", get(orgs::list_stores).post(orgs::add_stores))
        .route("/orgs/:org_id/skus", get(orgs::list_skus).post(orgs::add_skus))
        .route("/orgs/:org_id/users", post(orgs::create_user))
        .route("/orgs/:org_id/diagnostics", get(orgs::diagnostics))
        .route("/orgs/:org_id/orders", post(confirmations::confirm_order))
        .route("/orgs/:org_id/orders/batch", post(confirmations::confirm_order_batch))
        .route("/orgs/:org_id/transfers", post(confirmations::confirm_transfer))
        .route(
            "/orgs/:org_id/transfers/batch",
            post(confirmations::confirm_transfer_batch),
        )
        .route("/orgs/:org_id/inventory", get(inventory::get_inventory))
        .route("/orgs/:org_id/events", get(events::poll_events))
        .route("/orgs/:org_id/events/recent", get(events::recent_events))
        .route("/orgs/:org_id/events/stream", get(events::stream_events))
        .route("/orgs/:org_id/reconcile", post(reconcile::reconcile))
        .route("/orgs/:org_id/repair", post(reconcile::repair))
        .route_layer(axum::middleware::from_fn_with_state(
            services,
            middleware::org_middleware,
        ));

    Router::new()
        .route("/orgs", post(orgs::upsert_org))
        .route("/users/verify", post(orgs::verify_credentials))
        .merge(org_scoped)
}
