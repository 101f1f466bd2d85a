//! Route registration.

pub mod account;
pub mod admin;
pub mod webhooks;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhooks/stripe", post(webhooks::stripe_webhook))
        .route("/api/admin/billing/grant", post(admin::grant_manual_access))
        .route(
            "/api/admin/billing/sync-user",
            post(admin::sync_user_subscription),
        )
        .route(
            "/api/admin/billing/sync-customer",
            post(admin::sync_subscription_from_stripe),
        )
        .route("/api/admin/billing/revoke", post(admin::revoke_access))
        .route("/api/admin/billing/invariants", get(admin::check_invariants))
        .route("/api/account/entitlement", get(account::entitlement))
        .route(
            "/api/account/patreon/link",
            post(account::link_patreon).delete(account::unlink_patreon),
        )
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
