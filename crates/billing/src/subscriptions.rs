//! Subscription sync against Stripe.
//!
//! Stripe is the source of truth for subscription state: every accepted
//! webhook event and every manual repair re-reads the subscription from the
//! API instead of trusting an embedded payload snapshot.

use stripe::{
    CancelSubscription, CustomerId, Expandable, ListSubscriptions, Subscription, SubscriptionId,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, SubscriptionRecord, SubscriptionStatus};

/// Priority used when picking "the most relevant" subscription during a
/// manual sync. Deliberately not a recency sort: an entitling subscription
/// always outranks a newer dead one.
const SYNC_PRIORITY: [SubscriptionStatus; 4] = [
    SubscriptionStatus::Active,
    SubscriptionStatus::Trialing,
    SubscriptionStatus::PastDue,
    SubscriptionStatus::Canceled,
];

/// Index of the most relevant entry, first match in `SYNC_PRIORITY` winning.
/// Falls back to the first entry when none of the ranked statuses appear.
pub(crate) fn pick_most_relevant(statuses: &[SubscriptionStatus]) -> Option<usize> {
    for wanted in SYNC_PRIORITY {
        if let Some(idx) = statuses.iter().position(|s| *s == wanted) {
            return Some(idx);
        }
    }
    if statuses.is_empty() {
        None
    } else {
        Some(0)
    }
}

/// Subscription retrieval, listing and sync
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    store: BillingStore,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, store: BillingStore) -> Self {
        Self { stripe, store }
    }

    pub fn store(&self) -> &BillingStore {
        &self.store
    }

    /// Fetch the subscription fresh from Stripe.
    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {e}")))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        Ok(subscription)
    }

    /// List all subscriptions Stripe holds for a customer.
    pub async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {e}")))?;

        let params = ListSubscriptions {
            customer: Some(customer_id),
            ..Default::default()
        };

        let subscriptions = Subscription::list(self.stripe.inner(), &params).await?;
        Ok(subscriptions.data)
    }

    /// Cancel immediately with Stripe and return the canceled subscription.
    pub async fn cancel_now(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {e}")))?;

        let params = CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };

        let subscription = Subscription::cancel(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            "Canceled subscription with Stripe"
        );

        Ok(subscription)
    }

    /// Map a Stripe subscription onto the stored record shape.
    pub fn record_from_stripe(user_id: Uuid, subscription: &Subscription) -> SubscriptionRecord {
        let customer_id = match &subscription.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(c) => c.id.to_string(),
        };

        let current_period_start =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
                .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let current_period_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .unwrap_or_else(|_| OffsetDateTime::now_utc());

        SubscriptionRecord {
            user_id,
            stripe_customer_id: customer_id,
            stripe_subscription_id: subscription.id.to_string(),
            status: SubscriptionStatus::from(subscription.status),
            current_period_start,
            current_period_end,
            cancel_at_period_end: subscription.cancel_at_period_end,
        }
    }

    /// Repair the local record from Stripe's current truth for a customer:
    /// list, pick the most relevant subscription, upsert. Returns the record
    /// that was written.
    pub async fn sync_from_provider(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<SubscriptionRecord> {
        let subscriptions = self.list_customer_subscriptions(customer_id).await?;

        let statuses: Vec<SubscriptionStatus> = subscriptions
            .iter()
            .map(|s| SubscriptionStatus::from(s.status))
            .collect();

        let idx = pick_most_relevant(&statuses).ok_or_else(|| {
            BillingError::NotFound(format!(
                "No subscriptions in Stripe for customer {customer_id}"
            ))
        })?;

        let record = Self::record_from_stripe(user_id, &subscriptions[idx]);
        self.store.upsert_subscription(&record).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.stripe_subscription_id,
            status = %record.status,
            candidates = subscriptions.len(),
            "Synced subscription from Stripe"
        );

        Ok(record)
    }
}
