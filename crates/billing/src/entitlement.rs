//! Derived entitlement.
//!
//! `has_access` is never stored; it is computed at read time from the two
//! independent sources (Stripe subscription status and Patreon pledge) with
//! a fixed priority for the reported source:
//! `stripe_active > stripe_trialing > patreon > none`.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{BillingStore, SubscriptionRow, SubscriptionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    StripeActive,
    StripeTrialing,
    Patreon,
    None,
}

/// Priority tie-break across the two entitlement sources.
pub(crate) fn resolve_access(
    status: Option<SubscriptionStatus>,
    patreon_active: bool,
) -> (bool, AccessSource) {
    match status {
        Some(SubscriptionStatus::Active) => (true, AccessSource::StripeActive),
        Some(SubscriptionStatus::Trialing) => (true, AccessSource::StripeTrialing),
        _ if patreon_active => (true, AccessSource::Patreon),
        _ => (false, AccessSource::None),
    }
}

/// Pick the row that represents the user's current subscription: an
/// entitling row first (active over trialing), otherwise the most recently
/// updated row. Rows are expected most-recent-first.
pub(crate) fn pick_current_row(rows: &[SubscriptionRow]) -> Option<&SubscriptionRow> {
    rows.iter()
        .find(|r| r.parsed_status() == Some(SubscriptionStatus::Active))
        .or_else(|| {
            rows.iter()
                .find(|r| r.parsed_status() == Some(SubscriptionStatus::Trialing))
        })
        .or_else(|| rows.first())
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Entitlement {
    pub has_access: bool,
    pub access_source: AccessSource,
    pub status: Option<SubscriptionStatus>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub patreon_tier: Option<String>,
}

#[derive(Clone)]
pub struct EntitlementService {
    store: BillingStore,
}

impl EntitlementService {
    pub fn new(store: BillingStore) -> Self {
        Self { store }
    }

    pub async fn entitlement_for(&self, user_id: Uuid) -> BillingResult<Entitlement> {
        let rows = self.store.find_subscriptions_for_user(user_id).await?;
        let current = pick_current_row(&rows);
        let status = current.and_then(|row| row.parsed_status());

        let link = self.store.patreon_link_for_user(user_id).await?;
        let patreon_active = link.as_ref().map(|l| l.is_active).unwrap_or(false);

        let (has_access, access_source) = resolve_access(status, patreon_active);

        Ok(Entitlement {
            has_access,
            access_source,
            status,
            current_period_end: current.map(|row| row.current_period_end),
            cancel_at_period_end: current.map(|row| row.cancel_at_period_end),
            patreon_tier: link.and_then(|l| if l.is_active { l.tier } else { None }),
        })
    }
}
