//! Stripe webhook handling.
//!
//! One delivery is processed synchronously per HTTP request; Stripe owns all
//! retry. The handler keeps no state between invocations - idempotency and
//! ordering compensation live entirely in the store:
//!
//! - write-once event ledger (duplicate delivery short-circuits),
//! - staleness gate on destructive events,
//! - fresh re-fetch of the subscription on every accepted event,
//! - triple superseded-deletion check for out-of-order deletes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Expandable, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::notify::{subscription_type_tag, NotificationService};
use crate::store::{BillingStore, EventAdmission, SubscriptionStatus};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Metadata key carrying the owning account id. Set by the storefront on
/// checkout sessions, subscriptions and customers.
pub const USER_ID_METADATA_KEY: &str = "supabase_user_id";

/// Deletion events older than this are acknowledged but never applied; a
/// delayed redelivery must not erase a newer subscription state.
const STALE_DELETION_MAX_AGE_SECS: i64 = 3600;

/// Signature timestamps outside this window are rejected.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What a delivery amounted to; drives the acknowledgement body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Event was handled and any state transition applied.
    Processed,
    /// Event id was already in the ledger; nothing was written.
    Deduplicated,
    /// Destructive event arrived too late; acknowledged without applying.
    StaleRejected,
    /// Event type has no handler; acknowledged.
    Ignored,
}

/// True when a deletion event is too old to act on. Exactly one hour is
/// still acceptable; only strictly older deliveries are rejected.
pub(crate) fn deletion_is_stale(event_created: i64, now: i64) -> bool {
    now - event_created > STALE_DELETION_MAX_AGE_SECS
}

/// Resolve the status to store on a subscription.updated event.
///
/// Stripe can briefly report `trialing` before a failed-payment state has
/// propagated. If we had already marked the row past_due and the latest
/// invoice is still unsettled, the downgrade sticks. An `active` report
/// always wins - a paid transition must never be suppressed.
pub(crate) fn resolve_status_with_payment_guard(
    stored: Option<SubscriptionStatus>,
    fresh: SubscriptionStatus,
    latest_invoice_unsettled: bool,
) -> SubscriptionStatus {
    if fresh == SubscriptionStatus::Active {
        return SubscriptionStatus::Active;
    }
    if stored == Some(SubscriptionStatus::PastDue)
        && fresh == SubscriptionStatus::Trialing
        && latest_invoice_unsettled
    {
        return SubscriptionStatus::PastDue;
    }
    fresh
}

fn payment_guard_applies(stored: Option<SubscriptionStatus>, fresh: SubscriptionStatus) -> bool {
    stored == Some(SubscriptionStatus::PastDue) && fresh == SubscriptionStatus::Trialing
}

// =============================================================================
// Invoice owner resolution
// =============================================================================

/// Candidate user ids for an invoice, in fallback order.
#[derive(Debug, Default, Clone)]
pub(crate) struct InvoiceUserCandidates {
    pub subscription_metadata: Option<Uuid>,
    pub subscription_details_metadata: Option<Uuid>,
    pub line_metadata: Option<Uuid>,
    pub customer_metadata: Option<Uuid>,
    pub stored_owner: Option<Uuid>,
}

/// First candidate that resolves, tagged with where it came from.
pub(crate) fn first_resolved(c: &InvoiceUserCandidates) -> Option<(Uuid, &'static str)> {
    c.subscription_metadata
        .map(|u| (u, "subscription_metadata"))
        .or_else(|| {
            c.subscription_details_metadata
                .map(|u| (u, "subscription_details_metadata"))
        })
        .or_else(|| c.line_metadata.map(|u| (u, "line_metadata")))
        .or_else(|| c.customer_metadata.map(|u| (u, "customer_metadata")))
        .or_else(|| c.stored_owner.map(|u| (u, "stored_subscription")))
}

fn user_from_metadata(metadata: &std::collections::HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get(USER_ID_METADATA_KEY)
        .and_then(|v| Uuid::parse_str(v).ok())
}

/// The subscription_details and line-item metadata maps are read from the
/// serialized invoice; the pinned stripe bindings don't surface those nested
/// maps uniformly, and the chain only needs a string lookup.
fn invoice_embedded_user_ids(invoice: &Invoice) -> (Option<Uuid>, Option<Uuid>) {
    let value = match serde_json::to_value(invoice) {
        Ok(v) => v,
        Err(_) => return (None, None),
    };

    let details_path = format!("/subscription_details/metadata/{USER_ID_METADATA_KEY}");
    let from_details = value
        .pointer(&details_path)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok());

    let line_path = format!("/metadata/{USER_ID_METADATA_KEY}");
    let from_lines = value
        .pointer("/lines/data")
        .and_then(|v| v.as_array())
        .and_then(|lines| {
            lines.iter().find_map(|line| {
                line.pointer(&line_path)
                    .and_then(|v| v.as_str())
                    .and_then(|s| Uuid::parse_str(s).ok())
            })
        });

    (from_details, from_lines)
}

fn expandable_customer_id(customer: &Expandable<stripe::Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    }
}

fn invoice_subscription_id(invoice: &Invoice) -> Option<String> {
    match &invoice.subscription {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(s)) => Some(s.id.to_string()),
        None => None,
    }
}

// =============================================================================
// Handler
// =============================================================================

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    stripe: StripeClient,
    store: BillingStore,
    subscriptions: SubscriptionService,
    notify: NotificationService,
}

impl WebhookHandler {
    pub fn new(
        stripe: StripeClient,
        store: BillingStore,
        notify: NotificationService,
    ) -> Self {
        let subscriptions = SubscriptionService::new(stripe.clone(), store.clone());
        Self {
            stripe,
            store,
            subscriptions,
            notify,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verifier first, then falls back to manual signature
    /// verification to tolerate Stripe API versions newer than the bindings.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Library webhook parsing failed, trying manual verification"
                );
            }
        }

        // Signature header format: t=timestamp,v1=signature[,v0=signature]
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook signature timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Any error from here becomes a 500 so Stripe redelivers; the ledger
    /// makes the redelivery of an already-applied event a no-op.
    pub async fn handle_event(&self, event: Event) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        // Idempotency admission. A ledger failure that is not a duplicate is
        // fail-open: a risked duplicate beats a silently dropped event.
        match self.store.insert_webhook_event(&event_id, &event_type).await {
            Ok(EventAdmission::Admitted) => {}
            Ok(EventAdmission::Duplicate) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate webhook event - already processed"
                );
                return Ok(WebhookOutcome::Deduplicated);
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    error = %e,
                    "Webhook ledger insert failed - continuing without dedup"
                );
            }
        }

        // Staleness gate for destructive events.
        if event.type_ == EventType::CustomerSubscriptionDeleted {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            if deletion_is_stale(event.created, now) {
                tracing::warn!(
                    event_id = %event_id,
                    event_age_secs = now - event.created,
                    "Stale subscription deletion event - acknowledged, not applied"
                );
                return Ok(WebhookOutcome::StaleRejected);
            }
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Processing Stripe webhook event"
        );

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event).await?;
            }
            EventType::CustomerSubscriptionCreated => {
                self.handle_subscription_event(event, false).await?;
            }
            EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_event(event, true).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event).await?;
            }
            EventType::InvoicePaid => {
                self.handle_invoice_paid(event).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(event).await?;
            }
            _ => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Received unhandled Stripe event type - no handler configured"
                );
                return Ok(WebhookOutcome::Ignored);
            }
        }

        Ok(WebhookOutcome::Processed)
    }

    // ------------------------------------------------------------------
    // checkout.session.completed
    // ------------------------------------------------------------------

    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let user_id = session
            .metadata
            .as_ref()
            .and_then(user_from_metadata)
            .or_else(|| {
                session
                    .client_reference_id
                    .as_deref()
                    .and_then(|v| Uuid::parse_str(v).ok())
            })
            .ok_or_else(|| {
                BillingError::InvalidInput(
                    "Checkout session carries no resolvable user id".to_string(),
                )
            })?;

        let subscription_id = match &session.subscription {
            Some(Expandable::Id(id)) => id.to_string(),
            Some(Expandable::Object(s)) => s.id.to_string(),
            None => {
                return Err(BillingError::InvalidInput(
                    "Checkout session has no subscription".to_string(),
                ))
            }
        };

        if session.customer.is_none() {
            return Err(BillingError::InvalidInput(
                "Checkout session has no customer".to_string(),
            ));
        }

        // Never trust the session's embedded snapshot for period bounds.
        let subscription = self
            .subscriptions
            .retrieve_subscription(&subscription_id)
            .await?;

        let record = SubscriptionService::record_from_stripe(user_id, &subscription);
        let status = record.status;
        self.store.upsert_subscription(&record).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            status = %status,
            "Checkout completed, subscription stored"
        );

        match self.store.profile_by_id(user_id).await {
            Ok(Some(profile)) => {
                self.notify.profile_sync(
                    &profile.email,
                    profile.full_name.as_deref(),
                    subscription_type_tag(status),
                );
                if status.grants_access() {
                    self.notify.trial_started_event(&profile.email);
                }
                if status == SubscriptionStatus::Trialing {
                    self.notify.admin_trial_started(&profile.email);
                }
            }
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "No profile for checkout user - notifications skipped");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Profile lookup failed - notifications skipped");
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // customer.subscription.created / updated
    // ------------------------------------------------------------------

    async fn handle_subscription_event(&self, event: Event, is_update: bool) -> BillingResult<()> {
        let payload = self.extract_subscription(event)?;
        let subscription_id = payload.id.to_string();

        let user_id = match self.resolve_subscription_owner(&payload).await? {
            Some(user_id) => user_id,
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Subscription event carries no resolvable user id - skipping"
                );
                return Ok(());
            }
        };

        // The embedded payload may be stale, especially across the
        // trial -> active transition; the fresh fetch is ground truth.
        let mut subscription = self
            .subscriptions
            .retrieve_subscription(&subscription_id)
            .await?;
        let mut fresh_status = SubscriptionStatus::from(subscription.status);

        // A trial canceled mid-flight must never ride out to a charge.
        if fresh_status == SubscriptionStatus::Trialing && subscription.cancel_at_period_end {
            tracing::info!(
                subscription_id = %subscription_id,
                "Trialing subscription flagged cancel_at_period_end - canceling with Stripe now"
            );
            subscription = self.subscriptions.cancel_now(&subscription_id).await?;
            fresh_status = SubscriptionStatus::from(subscription.status);
        }

        let stored = self
            .store
            .find_subscription_by_provider_id(&subscription_id)
            .await?;
        let stored_status = stored.as_ref().and_then(|row| row.parsed_status());

        let resolved_status = if is_update && payment_guard_applies(stored_status, fresh_status) {
            let unsettled = self.latest_invoice_unsettled(&subscription).await?;
            let resolved =
                resolve_status_with_payment_guard(stored_status, fresh_status, unsettled);
            if resolved != fresh_status {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    fresh_status = %fresh_status,
                    "Latest invoice still unsettled - keeping past_due over reported trialing"
                );
            }
            resolved
        } else {
            fresh_status
        };

        let mut record = SubscriptionService::record_from_stripe(user_id, &subscription);
        record.status = resolved_status;
        self.store.upsert_subscription(&record).await?;

        let trial_converted = is_update
            && stored_status == Some(SubscriptionStatus::Trialing)
            && resolved_status == SubscriptionStatus::Active;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            status = %resolved_status,
            trial_converted = trial_converted,
            "Subscription event applied"
        );

        match self.store.profile_by_id(user_id).await {
            Ok(Some(profile)) => {
                self.notify.profile_sync(
                    &profile.email,
                    profile.full_name.as_deref(),
                    subscription_type_tag(resolved_status),
                );
                if trial_converted {
                    self.notify.admin_trial_converted(&profile.email);
                }
            }
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "No profile for subscription owner - notifications skipped");
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Profile lookup failed - notifications skipped");
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // customer.subscription.deleted
    // ------------------------------------------------------------------

    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let subscription_id = subscription.id.to_string();
        let customer_id = expandable_customer_id(&subscription.customer);

        let stored = self
            .store
            .find_subscription_by_provider_id(&subscription_id)
            .await?;

        let user_id = match self.resolve_subscription_owner(&subscription).await? {
            Some(user_id) => Some(user_id),
            None => stored.as_ref().map(|row| row.user_id),
        };

        // Three escalating checks before a deletion is applied; an
        // out-of-order delete must not clobber a newer subscription.
        if let Some(user_id) = user_id {
            if self
                .store
                .has_other_live_subscription(user_id, &subscription_id)
                .await?
            {
                tracing::info!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Deletion superseded - user holds another live subscription locally"
                );
                return Ok(());
            }
        }

        let listed = self
            .subscriptions
            .list_customer_subscriptions(&customer_id)
            .await?;

        if listed
            .iter()
            .any(|s| s.status == stripe::SubscriptionStatus::Active)
        {
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Deletion superseded - Stripe lists an active subscription for customer"
            );
            return Ok(());
        }

        if listed
            .iter()
            .any(|s| s.status == stripe::SubscriptionStatus::Trialing)
        {
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %subscription_id,
                "Deletion superseded - Stripe lists a trialing subscription for customer"
            );
            return Ok(());
        }

        let rows = self
            .store
            .update_subscription_status(&subscription_id, SubscriptionStatus::Canceled)
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            rows_updated = rows,
            "Subscription canceled"
        );

        if let Some(user_id) = user_id {
            if let Ok(Some(profile)) = self.store.profile_by_id(user_id).await {
                self.notify.profile_sync(
                    &profile.email,
                    profile.full_name.as_deref(),
                    subscription_type_tag(SubscriptionStatus::Canceled),
                );
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // invoice.payment_failed
    // ------------------------------------------------------------------

    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = self.extract_invoice(event)?;

        let Some(subscription_id) = invoice_subscription_id(&invoice) else {
            tracing::info!(invoice_id = %invoice.id, "Payment failed for non-subscription invoice - ignored");
            return Ok(());
        };

        let rows = self
            .store
            .update_subscription_status(&subscription_id, SubscriptionStatus::PastDue)
            .await?;

        tracing::warn!(
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            rows_updated = rows,
            "Invoice payment failed - subscription marked past_due"
        );

        Ok(())
    }

    // ------------------------------------------------------------------
    // invoice.paid
    // ------------------------------------------------------------------

    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let invoice = self.extract_invoice(event)?;

        let Some(subscription_id) = invoice_subscription_id(&invoice) else {
            tracing::info!(invoice_id = %invoice.id, "Paid invoice without subscription - ignored");
            return Ok(());
        };

        let subscription = self
            .subscriptions
            .retrieve_subscription(&subscription_id)
            .await?;

        let (from_details, from_lines) = invoice_embedded_user_ids(&invoice);
        let mut candidates = InvoiceUserCandidates {
            subscription_metadata: user_from_metadata(&subscription.metadata),
            subscription_details_metadata: from_details,
            line_metadata: from_lines,
            ..Default::default()
        };

        if first_resolved(&candidates).is_none() {
            if let Some(customer) = &invoice.customer {
                candidates.customer_metadata = self.customer_metadata_user(customer).await;
            }
        }

        if first_resolved(&candidates).is_none() {
            candidates.stored_owner = self
                .store
                .find_subscription_by_provider_id(&subscription_id)
                .await?
                .map(|row| row.user_id);
        }

        let resolved = first_resolved(&candidates);

        // A paid invoice is proof of successful payment; the stored status
        // resolves to active no matter what else has been reported.
        match resolved {
            Some((user_id, source)) => {
                let mut record = SubscriptionService::record_from_stripe(user_id, &subscription);
                record.status = SubscriptionStatus::Active;
                self.store.upsert_subscription(&record).await?;

                tracing::info!(
                    invoice_id = %invoice.id,
                    subscription_id = %subscription_id,
                    user_id = %user_id,
                    user_id_source = source,
                    "Invoice paid - subscription active"
                );

                if let Ok(Some(profile)) = self.store.profile_by_id(user_id).await {
                    self.notify.profile_sync(
                        &profile.email,
                        profile.full_name.as_deref(),
                        subscription_type_tag(SubscriptionStatus::Active),
                    );
                    if matches!(
                        invoice.billing_reason,
                        Some(stripe::InvoiceBillingReason::SubscriptionCycle)
                    ) {
                        self.notify.admin_trial_converted(&profile.email);
                    }
                }
            }
            None => {
                let record = SubscriptionService::record_from_stripe(Uuid::nil(), &subscription);
                let rows = self
                    .store
                    .update_subscription_from_provider(
                        &subscription_id,
                        SubscriptionStatus::Active,
                        record.current_period_start,
                        record.current_period_end,
                        record.cancel_at_period_end,
                    )
                    .await?;

                tracing::warn!(
                    invoice_id = %invoice.id,
                    subscription_id = %subscription_id,
                    rows_updated = rows,
                    "Invoice paid but no owner resolved - bare status update applied"
                );
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn extract_subscription(&self, event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_invoice(&self, event: Event) -> BillingResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Invoice".to_string(),
            )),
        }
    }

    /// Owner resolution for subscription events: subscription metadata first,
    /// customer metadata as fallback.
    async fn resolve_subscription_owner(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(user_id) = user_from_metadata(&subscription.metadata) {
            return Ok(Some(user_id));
        }
        Ok(self.customer_metadata_user(&subscription.customer).await)
    }

    /// Read the user id from customer metadata, fetching the customer when
    /// the event only embeds its id. Lookup failures resolve to None; the
    /// caller decides whether a missing owner is fatal.
    async fn customer_metadata_user(
        &self,
        customer: &Expandable<stripe::Customer>,
    ) -> Option<Uuid> {
        let metadata_user = |c: &stripe::Customer| {
            c.metadata
                .as_ref()
                .and_then(|m| m.get(USER_ID_METADATA_KEY))
                .and_then(|v| Uuid::parse_str(v).ok())
        };

        match customer {
            Expandable::Object(c) => metadata_user(c),
            Expandable::Id(customer_id) => {
                match stripe::Customer::retrieve(self.stripe.inner(), customer_id, &[]).await {
                    Ok(c) => metadata_user(&c),
                    Err(e) => {
                        tracing::warn!(
                            customer_id = %customer_id,
                            error = %e,
                            "Customer lookup for metadata fallback failed"
                        );
                        None
                    }
                }
            }
        }
    }

    /// Is the subscription's latest invoice still open or uncollectible?
    async fn latest_invoice_unsettled(&self, subscription: &Subscription) -> BillingResult<bool> {
        let status = match &subscription.latest_invoice {
            Some(Expandable::Object(invoice)) => invoice.status,
            Some(Expandable::Id(invoice_id)) => {
                let invoice = Invoice::retrieve(self.stripe.inner(), invoice_id, &[]).await?;
                invoice.status
            }
            None => return Ok(false),
        };

        Ok(matches!(
            status,
            Some(stripe::InvoiceStatus::Open) | Some(stripe::InvoiceStatus::Uncollectible)
        ))
    }
}
