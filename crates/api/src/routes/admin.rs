//! Admin reconciliation endpoints.
//!
//! The reconciliation actions authorize internally (fresh is_admin check)
//! and always answer with the uniform `ActionResult` shape over HTTP 200,
//! so the admin UI can branch on `success` alone.

use axum::extract::State;
use axum::Json;
use samplevault_billing::{ActionResult, InvariantCheckSummary};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EmailPayload {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct SyncCustomerPayload {
    pub user_id: Uuid,
    pub customer_id: String,
}

pub async fn grant_manual_access(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<EmailPayload>,
) -> Json<ActionResult> {
    Json(
        state
            .billing
            .reconcile
            .grant_manual_access(auth.user_id, &payload.email)
            .await,
    )
}

pub async fn sync_user_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<EmailPayload>,
) -> Json<ActionResult> {
    Json(
        state
            .billing
            .reconcile
            .sync_user_subscription(auth.user_id, &payload.email)
            .await,
    )
}

pub async fn sync_subscription_from_stripe(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<SyncCustomerPayload>,
) -> Json<ActionResult> {
    Json(
        state
            .billing
            .reconcile
            .sync_subscription_from_stripe(auth.user_id, payload.user_id, &payload.customer_id)
            .await,
    )
}

pub async fn revoke_access(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(payload): Json<EmailPayload>,
) -> Json<ActionResult> {
    Json(
        state
            .billing
            .reconcile
            .revoke_access(auth.user_id, &payload.email)
            .await,
    )
}

/// Run the billing consistency checks.
pub async fn check_invariants(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let user_id = auth.user_id.ok_or(ApiError::Unauthorized)?;

    if !state.billing.store.is_admin(user_id).await? {
        tracing::warn!(user_id = %user_id, "Unauthorized invariant check attempt");
        return Err(ApiError::Forbidden);
    }

    let summary = state.billing.invariants.run_all().await?;
    Ok(Json(summary))
}
