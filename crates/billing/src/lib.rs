// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SampleVault Billing Module
//!
//! Reconciles Stripe subscription state and Patreon pledges into one
//! entitlement for the sample catalog.
//!
//! ## Features
//!
//! - **Webhook Processing**: Idempotent, out-of-order-tolerant handling of
//!   Stripe subscription/invoice/checkout events
//! - **Manual Reconciliation**: Admin repairs - grant, sync-from-Stripe,
//!   revoke - returning uniform results
//! - **Entitlement**: Derived `has_access` across the Stripe and Patreon
//!   paths, never stored
//! - **Patreon Links**: Replace-wholesale membership links
//! - **Notifications**: Fire-and-forget Klaviyo sync and Resend admin alerts
//! - **Invariants**: Runnable consistency checks over the store

pub mod client;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod notify;
pub mod patreon;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Entitlement
pub use entitlement::{AccessSource, Entitlement, EntitlementService};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notify::{AdminAlerts, KlaviyoClient, NotificationService};

// Patreon
pub use patreon::PatreonService;

// Reconciliation
pub use reconcile::{is_manual_id, ActionResult, ActionTag, ReconciliationService};

// Store
pub use store::{
    BillingStore, EventAdmission, PatreonLink, Profile, SubscriptionRecord, SubscriptionRow,
    SubscriptionStatus,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Webhooks
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: BillingStore,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub reconcile: ReconciliationService,
    pub entitlement: EntitlementService,
    pub patreon: PatreonService,
    pub notify: NotificationService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let notify = NotificationService::from_env();
        Ok(Self::new(stripe, notify, pool))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(stripe: StripeClient, notify: NotificationService, pool: PgPool) -> Self {
        let store = BillingStore::new(pool.clone());
        let subscriptions = SubscriptionService::new(stripe.clone(), store.clone());

        Self {
            store: store.clone(),
            subscriptions: subscriptions.clone(),
            webhooks: WebhookHandler::new(stripe, store.clone(), notify.clone()),
            reconcile: ReconciliationService::new(store.clone(), subscriptions),
            entitlement: EntitlementService::new(store.clone()),
            patreon: PatreonService::new(store),
            notify,
            invariants: InvariantChecker::new(pool),
        }
    }
}
