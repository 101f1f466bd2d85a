//! Manual reconciliation actions.
//!
//! Admin-only repairs that force a subscription record to match Stripe's
//! current truth, or grant/revoke access with no billing relationship at all.
//! Every action returns the same result shape and never throws: failures -
//! authorization, lookups, database errors - come back as data so the caller
//! always has a message to show.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;
use crate::store::{BillingStore, GrantOutcome, SubscriptionRecord, SubscriptionStatus};
use crate::subscriptions::SubscriptionService;

/// Prefix marking synthetic identifiers created by support grants. Real
/// Stripe ids never start with it, so the two populations cannot collide.
pub const MANUAL_ID_PREFIX: &str = "manual_";

pub fn is_manual_id(id: &str) -> bool {
    id.starts_with(MANUAL_ID_PREFIX)
}

/// Synthetic one-year grant for a user with no billing relationship. Each
/// invocation opens a fresh window from `now`.
pub(crate) fn manual_grant_record(user_id: Uuid, now: OffsetDateTime) -> SubscriptionRecord {
    SubscriptionRecord {
        user_id,
        stripe_customer_id: format!("{MANUAL_ID_PREFIX}cus_{}", Uuid::new_v4()),
        stripe_subscription_id: format!("{MANUAL_ID_PREFIX}sub_{}", Uuid::new_v4()),
        status: SubscriptionStatus::Active,
        current_period_start: now,
        current_period_end: now + Duration::days(365),
        cancel_at_period_end: false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionTag {
    Created,
    Updated,
    Synced,
}

/// Uniform result of every reconciliation action.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionTag>,
}

impl ActionResult {
    pub fn ok(message: impl Into<String>, action: ActionTag) -> Self {
        Self {
            success: true,
            message: message.into(),
            action: Some(action),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            action: None,
        }
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    store: BillingStore,
    subscriptions: SubscriptionService,
}

impl ReconciliationService {
    pub fn new(store: BillingStore, subscriptions: SubscriptionService) -> Self {
        Self {
            store,
            subscriptions,
        }
    }

    /// Authorization gate run first on every action. The admin flag is read
    /// fresh from the profile store on each call; nothing is cached.
    async fn authorize(&self, caller: Option<Uuid>) -> Result<Uuid, ActionResult> {
        let Some(user_id) = caller else {
            return Err(ActionResult::fail("Not authenticated"));
        };

        match self.store.is_admin(user_id).await {
            Ok(true) => Ok(user_id),
            Ok(false) => Err(ActionResult::fail("Not authorized")),
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Admin check failed");
                Err(ActionResult::fail("Authorization check failed"))
            }
        }
    }

    /// Support-driven grant with no billing relationship. A user who already
    /// holds a real Stripe subscription is re-synced from Stripe instead of
    /// being blindly overwritten.
    pub async fn grant_manual_access(&self, caller: Option<Uuid>, email: &str) -> ActionResult {
        let admin_id = match self.authorize(caller).await {
            Ok(id) => id,
            Err(result) => return result,
        };

        let profile = match self.store.profile_by_email(email).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return ActionResult::fail("User not found"),
            Err(e) => return ActionResult::fail(format!("Database error: {e}")),
        };

        let rows = match self.store.find_subscriptions_for_user(profile.id).await {
            Ok(rows) => rows,
            Err(e) => return ActionResult::fail(format!("Database error: {e}")),
        };

        let result = if let Some(real) = rows
            .iter()
            .find(|row| !is_manual_id(&row.stripe_subscription_id))
        {
            tracing::info!(
                user_id = %profile.id,
                subscription_id = %real.stripe_subscription_id,
                "Grant requested for user with a real subscription - syncing from Stripe instead"
            );
            self.sync_from_provider_inner(profile.id, &real.stripe_customer_id)
                .await
        } else {
            let record = manual_grant_record(profile.id, OffsetDateTime::now_utc());
            match self.store.upsert_manual_grant(&record).await {
                Ok(GrantOutcome::Created) => ActionResult::ok(
                    format!("Manual access granted to {email} for one year"),
                    ActionTag::Created,
                ),
                Ok(GrantOutcome::Updated) => ActionResult::ok(
                    format!("Manual access for {email} renewed for one year"),
                    ActionTag::Updated,
                ),
                Err(e) => ActionResult::fail(format!("Database error: {e}")),
            }
        };

        self.audit(admin_id, "grant_manual_access", Some(email), &result)
            .await;
        result
    }

    /// Standalone repair: overwrite the local record with Stripe's current
    /// truth for the customer.
    pub async fn sync_subscription_from_stripe(
        &self,
        caller: Option<Uuid>,
        user_id: Uuid,
        customer_id: &str,
    ) -> ActionResult {
        let admin_id = match self.authorize(caller).await {
            Ok(id) => id,
            Err(result) => return result,
        };

        let result = self.sync_from_provider_inner(user_id, customer_id).await;

        self.audit(admin_id, "sync_subscription_from_stripe", None, &result)
            .await;
        result
    }

    /// Repair by email. Refuses manual grants: they are not provider-backed
    /// and there is nothing in Stripe to sync from.
    pub async fn sync_user_subscription(&self, caller: Option<Uuid>, email: &str) -> ActionResult {
        let admin_id = match self.authorize(caller).await {
            Ok(id) => id,
            Err(result) => return result,
        };

        let result = self.sync_user_subscription_inner(email).await;

        self.audit(admin_id, "sync_user_subscription", Some(email), &result)
            .await;
        result
    }

    async fn sync_user_subscription_inner(&self, email: &str) -> ActionResult {
        let profile = match self.store.profile_by_email(email).await {
            Ok(Some(profile)) => profile,
            Ok(None) => return ActionResult::fail("User not found"),
            Err(e) => return ActionResult::fail(format!("Database error: {e}")),
        };

        let rows = match self.store.find_subscriptions_for_user(profile.id).await {
            Ok(rows) => rows,
            Err(e) => return ActionResult::fail(format!("Database error: {e}")),
        };

        let Some(customer_id) = rows.first().map(|row| row.stripe_customer_id.clone()) else {
            return ActionResult::fail("No Stripe customer on file for this user");
        };

        if is_manual_id(&customer_id) {
            return ActionResult::fail(
                "Subscription was granted manually and is not backed by Stripe",
            );
        }

        self.sync_from_provider_inner(profile.id, &customer_id).await
    }

    /// Force the user's subscription to canceled. The row is kept and the
    /// Patreon entitlement path is untouched.
    pub async fn revoke_access(&self, caller: Option<Uuid>, email: &str) -> ActionResult {
        let admin_id = match self.authorize(caller).await {
            Ok(id) => id,
            Err(result) => return result,
        };

        let result = match self.store.profile_by_email(email).await {
            Ok(Some(profile)) => match self.store.revoke_user_subscriptions(profile.id).await {
                Ok(0) => ActionResult::fail("No subscription found for this user"),
                Ok(rows) => {
                    tracing::info!(
                        user_id = %profile.id,
                        rows_updated = rows,
                        "Access revoked"
                    );
                    ActionResult::ok(format!("Access revoked for {email}"), ActionTag::Updated)
                }
                Err(e) => ActionResult::fail(format!("Database error: {e}")),
            },
            Ok(None) => ActionResult::fail("User not found"),
            Err(e) => ActionResult::fail(format!("Database error: {e}")),
        };

        self.audit(admin_id, "revoke_access", Some(email), &result)
            .await;
        result
    }

    async fn sync_from_provider_inner(&self, user_id: Uuid, customer_id: &str) -> ActionResult {
        match self.subscriptions.sync_from_provider(user_id, customer_id).await {
            Ok(record) => ActionResult::ok(
                format!(
                    "Subscription {} synced from Stripe with status {}",
                    record.stripe_subscription_id, record.status
                ),
                ActionTag::Synced,
            ),
            Err(BillingError::NotFound(_)) => {
                ActionResult::fail("No subscriptions found in Stripe for this customer")
            }
            Err(e) => ActionResult::fail(format!("Stripe sync failed: {e}")),
        }
    }

    /// Audit-log the action; a logging failure never fails the action.
    async fn audit(
        &self,
        admin_id: Uuid,
        action: &str,
        target_email: Option<&str>,
        result: &ActionResult,
    ) {
        let detail = serde_json::json!({
            "success": result.success,
            "message": result.message,
        });

        if let Err(e) = self
            .store
            .insert_admin_audit(admin_id, action, target_email, Some(detail))
            .await
        {
            tracing::warn!(
                admin_id = %admin_id,
                action = %action,
                error = %e,
                "Failed to write admin audit log entry"
            );
        }
    }
}
