//! Billing invariants.
//!
//! Runnable consistency checks over the subscription store. Each check is a
//! single read-only SQL query; violations carry enough context to debug from
//! the admin panel without shell access.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::reconcile::MANUAL_ID_PREFIX;

/// A single failed check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected user(s)
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Entitlement may be wrong right now
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
}

/// Summary of a full invariant run
#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        let checks_run = 4;

        if let Some(v) = self.check_multiple_live_subscriptions().await? {
            violations.push(v);
        }
        if let Some(v) = self.check_unknown_statuses().await? {
            violations.push(v);
        }
        if let Some(v) = self.check_expired_manual_grants().await? {
            violations.push(v);
        }
        if let Some(v) = self.check_orphaned_owners().await? {
            violations.push(v);
        }

        let checks_failed = violations.len();
        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Two live rows for one user is expected only transiently, while
    /// out-of-order deliveries settle; a persistent pair needs repair.
    async fn check_multiple_live_subscriptions(
        &self,
    ) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS live_rows
            FROM subscriptions
            WHERE status IN ('active', 'trialing')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        Ok(Some(InvariantViolation {
            invariant: "single_live_subscription_per_user".to_string(),
            description: format!("{} user(s) hold more than one live subscription row", rows.len()),
            context: serde_json::json!({
                "counts": rows.iter().map(|(id, n)| serde_json::json!({"user_id": id, "live_rows": n})).collect::<Vec<_>>(),
            }),
            user_ids,
            severity: ViolationSeverity::Medium,
        }))
    }

    async fn check_unknown_statuses(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT user_id, status
            FROM subscriptions
            WHERE status NOT IN (
                'trialing', 'active', 'canceled', 'incomplete',
                'incomplete_expired', 'past_due', 'unpaid', 'paused'
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        Ok(Some(InvariantViolation {
            invariant: "known_status_vocabulary".to_string(),
            description: format!("{} row(s) carry a status outside the vocabulary", rows.len()),
            context: serde_json::json!({
                "statuses": rows.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>(),
            }),
            user_ids,
            severity: ViolationSeverity::Critical,
        }))
    }

    /// Manual grants run one year; an active manual row past its period end
    /// means the grant expiry was never enforced.
    async fn check_expired_manual_grants(&self) -> BillingResult<Option<InvariantViolation>> {
        let pattern = format!("{MANUAL_ID_PREFIX}%");
        let rows: Vec<(Uuid, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT user_id, current_period_end
            FROM subscriptions
            WHERE stripe_subscription_id LIKE $1
              AND status = 'active'
              AND current_period_end < NOW()
            "#,
        )
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        Ok(Some(InvariantViolation {
            invariant: "manual_grants_within_window".to_string(),
            description: format!("{} manual grant(s) are active past their one-year window", rows.len()),
            context: serde_json::json!({
                "expired": rows.iter().map(|(id, end)| serde_json::json!({
                    "user_id": id,
                    "period_end": end.unix_timestamp(),
                })).collect::<Vec<_>>(),
            }),
            user_ids,
            severity: ViolationSeverity::Medium,
        }))
    }

    async fn check_orphaned_owners(&self) -> BillingResult<Option<InvariantViolation>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT s.user_id, s.stripe_subscription_id
            FROM subscriptions s
            LEFT JOIN profiles p ON p.id = s.user_id
            WHERE p.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let user_ids: Vec<Uuid> = rows.iter().map(|(id, _)| *id).collect();
        Ok(Some(InvariantViolation {
            invariant: "subscription_owner_exists".to_string(),
            description: format!("{} subscription row(s) reference a missing profile", rows.len()),
            context: serde_json::json!({
                "subscription_ids": rows.iter().map(|(_, s)| s.clone()).collect::<Vec<_>>(),
            }),
            user_ids,
            severity: ViolationSeverity::High,
        }))
    }
}
