//! Member-facing account endpoints.

use axum::extract::State;
use axum::Json;
use samplevault_billing::{Entitlement, PatreonLink};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Current entitlement for the authenticated member, derived at read time
/// from the Stripe and Patreon paths.
pub async fn entitlement(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Entitlement>> {
    let user_id = auth.user_id.ok_or(ApiError::Unauthorized)?;
    let entitlement = state.billing.entitlement.entitlement_for(user_id).await?;
    Ok(Json(entitlement))
}

/// Membership handed over by the storefront's Patreon OAuth callback.
#[derive(Debug, Deserialize)]
pub struct PatreonLinkPayload {
    pub patreon_member_id: String,
    pub patreon_email: String,
    pub is_active: bool,
    pub tier: Option<String>,
}

pub async fn link_patreon(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<PatreonLinkPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = auth.user_id.ok_or(ApiError::Unauthorized)?;

    state
        .billing
        .patreon
        .link(PatreonLink {
            user_id,
            patreon_member_id: payload.patreon_member_id,
            patreon_email: payload.patreon_email,
            is_active: payload.is_active,
            tier: payload.tier,
        })
        .await?;

    Ok(Json(serde_json::json!({ "linked": true })))
}

pub async fn unlink_patreon(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = auth.user_id.ok_or(ApiError::Unauthorized)?;
    let unlinked = state.billing.patreon.unlink(user_id).await?;
    Ok(Json(serde_json::json!({ "unlinked": unlinked })))
}
