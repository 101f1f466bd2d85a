//! Typed repository over the billing tables.
//!
//! All SQL in the billing crate lives here so the shapes written to
//! `subscriptions`, `patreon_links`, `webhook_events` and `admin_audit_log`
//! are enforced by one set of record types instead of ad-hoc queries.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

// =============================================================================
// Record Types
// =============================================================================

/// Subscription status as reported by the billing provider.
///
/// The stored value is always the provider's last-known truth at the time of
/// the most recent accepted event, with the single exception of the
/// past_due/trialing payment guard in the webhook handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Ok(SubscriptionStatus::IncompleteExpired),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "paused" => Ok(SubscriptionStatus::Paused),
            other => Err(BillingError::InvalidInput(format!(
                "unknown subscription status: {other}"
            ))),
        }
    }

    /// Statuses that grant catalog access on their own.
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<stripe::SubscriptionStatus> for SubscriptionStatus {
    fn from(status: stripe::SubscriptionStatus) -> Self {
        match status {
            stripe::SubscriptionStatus::Trialing => SubscriptionStatus::Trialing,
            stripe::SubscriptionStatus::Active => SubscriptionStatus::Active,
            stripe::SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            stripe::SubscriptionStatus::Incomplete => SubscriptionStatus::Incomplete,
            stripe::SubscriptionStatus::IncompleteExpired => {
                SubscriptionStatus::IncompleteExpired
            }
            stripe::SubscriptionStatus::PastDue => SubscriptionStatus::PastDue,
            stripe::SubscriptionStatus::Unpaid => SubscriptionStatus::Unpaid,
            stripe::SubscriptionStatus::Paused => SubscriptionStatus::Paused,
        }
    }
}

/// Shape written on every subscription upsert
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
}

/// Stored subscription row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    /// Parsed status; `None` for rows written before the status vocabulary
    /// settled (surfaced by the invariant checker, never silently entitled).
    pub fn parsed_status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status).ok()
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PatreonLink {
    pub user_id: Uuid,
    pub patreon_member_id: String,
    pub patreon_email: String,
    pub is_active: bool,
    pub tier: Option<String>,
}

/// Result of the idempotency-ledger insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAdmission {
    /// First delivery; processing may proceed.
    Admitted,
    /// The event id was already recorded.
    Duplicate,
}

/// Result of the manual-grant upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Created,
    Updated,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct BillingStore {
    pool: PgPool,
}

impl BillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Idempotency ledger
    // ------------------------------------------------------------------

    /// Insert into the write-once ledger. A primary-key violation means the
    /// event was already handled and maps to `Duplicate`; any other error
    /// propagates so the caller can decide (the webhook handler fails open).
    pub async fn insert_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
    ) -> BillingResult<EventAdmission> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (event_id, event_type) VALUES ($1, $2)",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(EventAdmission::Admitted),
            Err(e) => {
                let unique_violation = e
                    .as_database_error()
                    .map(|db| db.is_unique_violation())
                    .unwrap_or(false);
                if unique_violation {
                    Ok(EventAdmission::Duplicate)
                } else {
                    Err(BillingError::Database(e.to_string()))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Upsert keyed by the provider subscription id.
    pub async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_customer_id, stripe_subscription_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW()
            )
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.user_id)
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_subscription_id)
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Bare status update keyed by the provider subscription id. Returns the
    /// number of rows touched (zero when the subscription was never synced).
    pub async fn update_subscription_status(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET status = $1, updated_at = NOW()
            WHERE stripe_subscription_id = $2
            "#,
        )
        .bind(status.as_str())
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Status + period refresh keyed by the provider subscription id, for the
    /// invoice-paid path when no owning user could be resolved.
    pub async fn update_subscription_from_provider(
        &self,
        stripe_subscription_id: &str,
        status: SubscriptionStatus,
        current_period_start: OffsetDateTime,
        current_period_end: OffsetDateTime,
        cancel_at_period_end: bool,
    ) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $1,
                current_period_start = $2,
                current_period_end = $3,
                cancel_at_period_end = $4,
                updated_at = NOW()
            WHERE stripe_subscription_id = $5
            "#,
        )
        .bind(status.as_str())
        .bind(current_period_start)
        .bind(current_period_end)
        .bind(cancel_at_period_end)
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn find_subscription_by_provider_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRow>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_customer_id, stripe_subscription_id, status,
                   current_period_start, current_period_end, cancel_at_period_end, updated_at
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// All subscription rows for a user, most recently updated first.
    pub async fn find_subscriptions_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionRow>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, stripe_customer_id, stripe_subscription_id, status,
                   current_period_start, current_period_end, cancel_at_period_end, updated_at
            FROM subscriptions
            WHERE user_id = $1
            ORDER BY updated_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Does the user hold a live (active/trialing) row under a different
    /// provider subscription id? Used to detect superseded deletion events.
    pub async fn has_other_live_subscription(
        &self,
        user_id: Uuid,
        stripe_subscription_id: &str,
    ) -> BillingResult<bool> {
        let exists: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM subscriptions
            WHERE user_id = $1
              AND stripe_subscription_id <> $2
              AND status IN ('active', 'trialing')
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(exists.is_some())
    }

    /// Per-user upsert for support-driven grants. The table is unique on
    /// stripe_subscription_id only (two provider ids for one user must be
    /// able to coexist while out-of-order deliveries settle), so the
    /// user-keyed conflict target is expressed as update-then-insert here.
    pub async fn upsert_manual_grant(
        &self,
        record: &SubscriptionRecord,
    ) -> BillingResult<GrantOutcome> {
        let updated = sqlx::query(
            r#"
            UPDATE subscriptions
            SET stripe_customer_id = $1,
                stripe_subscription_id = $2,
                status = $3,
                current_period_start = $4,
                current_period_end = $5,
                cancel_at_period_end = $6,
                updated_at = NOW()
            WHERE user_id = $7
            "#,
        )
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_subscription_id)
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.user_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() > 0 {
            return Ok(GrantOutcome::Updated);
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, stripe_customer_id, stripe_subscription_id, status,
                current_period_start, current_period_end, cancel_at_period_end,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.user_id)
        .bind(&record.stripe_customer_id)
        .bind(&record.stripe_subscription_id)
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .execute(&self.pool)
        .await?;

        Ok(GrantOutcome::Created)
    }

    /// Force all of a user's rows to canceled. Rows are never deleted.
    pub async fn revoke_user_subscriptions(&self, user_id: Uuid) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'canceled', updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub async fn profile_by_email(&self, email: &str) -> BillingResult<Option<Profile>> {
        let profile: Option<Profile> = sqlx::query_as(
            "SELECT id, email, full_name, is_admin FROM profiles WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    pub async fn profile_by_id(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let profile: Option<Profile> =
            sqlx::query_as("SELECT id, email, full_name, is_admin FROM profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(profile)
    }

    /// Fresh admin check; authorization is never cached.
    pub async fn is_admin(&self, user_id: Uuid) -> BillingResult<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_admin FROM profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(is_admin,)| is_admin).unwrap_or(false))
    }

    // ------------------------------------------------------------------
    // Patreon links
    // ------------------------------------------------------------------

    /// Replace the user's link wholesale: delete-then-insert in one
    /// transaction, so a re-link can never trip over a stale unique row.
    pub async fn replace_patreon_link(&self, link: &PatreonLink) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM patreon_links WHERE user_id = $1 OR patreon_member_id = $2")
            .bind(link.user_id)
            .bind(&link.patreon_member_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO patreon_links (
                id, user_id, patreon_member_id, patreon_email, is_active, tier
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(link.user_id)
        .bind(&link.patreon_member_id)
        .bind(&link.patreon_email)
        .bind(link.is_active)
        .bind(&link.tier)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn patreon_link_for_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<PatreonLink>> {
        let link: Option<PatreonLink> = sqlx::query_as(
            r#"
            SELECT user_id, patreon_member_id, patreon_email, is_active, tier
            FROM patreon_links
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(link)
    }

    pub async fn deactivate_patreon_link(&self, user_id: Uuid) -> BillingResult<u64> {
        let result =
            sqlx::query("UPDATE patreon_links SET is_active = FALSE WHERE user_id = $1")
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Admin audit log
    // ------------------------------------------------------------------

    pub async fn insert_admin_audit(
        &self,
        admin_user_id: Uuid,
        action: &str,
        target_email: Option<&str>,
        detail: Option<serde_json::Value>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO admin_audit_log (admin_user_id, action, target_email, detail)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(admin_user_id)
        .bind(action)
        .bind(target_email)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
