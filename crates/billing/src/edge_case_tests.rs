// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Core
//!
//! Covers the decision logic behind the webhook processor and the
//! reconciliation actions:
//! - Status resolution guards (past_due/trialing suppression, active wins)
//! - Staleness gate for deletion events
//! - Entitlement source priority
//! - Manual-sync pick priority
//! - Manual grant identifiers and windows
//! - Invoice owner-resolution fallback chain
//! - Notification sink payloads

#[cfg(test)]
mod status_guard_tests {
    use crate::store::SubscriptionStatus;
    use crate::webhooks::resolve_status_with_payment_guard;

    // =========================================================================
    // Active always wins: the guard must never suppress a paid transition
    // =========================================================================
    #[test]
    fn test_active_overrides_past_due() {
        let resolved = resolve_status_with_payment_guard(
            Some(SubscriptionStatus::PastDue),
            SubscriptionStatus::Active,
            true,
        );
        assert_eq!(resolved, SubscriptionStatus::Active);
    }

    // =========================================================================
    // past_due -> trialing with an unsettled invoice keeps past_due
    // =========================================================================
    #[test]
    fn test_trialing_suppressed_while_invoice_unsettled() {
        let resolved = resolve_status_with_payment_guard(
            Some(SubscriptionStatus::PastDue),
            SubscriptionStatus::Trialing,
            true,
        );
        assert_eq!(resolved, SubscriptionStatus::PastDue);
    }

    // =========================================================================
    // past_due -> trialing with the invoice settled trusts the fresh status
    // =========================================================================
    #[test]
    fn test_trialing_accepted_once_invoice_settled() {
        let resolved = resolve_status_with_payment_guard(
            Some(SubscriptionStatus::PastDue),
            SubscriptionStatus::Trialing,
            false,
        );
        assert_eq!(resolved, SubscriptionStatus::Trialing);
    }

    // =========================================================================
    // The guard only exists for the past_due -> trialing pair
    // =========================================================================
    #[test]
    fn test_guard_does_not_apply_outside_past_due() {
        let resolved = resolve_status_with_payment_guard(
            Some(SubscriptionStatus::Active),
            SubscriptionStatus::Trialing,
            true,
        );
        assert_eq!(resolved, SubscriptionStatus::Trialing);

        let resolved =
            resolve_status_with_payment_guard(None, SubscriptionStatus::Trialing, true);
        assert_eq!(resolved, SubscriptionStatus::Trialing);
    }

    #[test]
    fn test_canceled_passes_through() {
        let resolved = resolve_status_with_payment_guard(
            Some(SubscriptionStatus::PastDue),
            SubscriptionStatus::Canceled,
            true,
        );
        assert_eq!(resolved, SubscriptionStatus::Canceled);
    }
}

#[cfg(test)]
mod staleness_tests {
    use crate::webhooks::deletion_is_stale;

    const HOUR: i64 = 3600;

    // =========================================================================
    // A deletion exactly one hour old is still applied; older is rejected
    // =========================================================================
    #[test]
    fn test_one_hour_boundary() {
        let now = 1_700_000_000;
        assert!(!deletion_is_stale(now - HOUR, now), "exactly 1h is not stale");
        assert!(deletion_is_stale(now - HOUR - 1, now), "1h + 1s is stale");
        assert!(!deletion_is_stale(now - 10, now), "fresh event is not stale");
    }

    #[test]
    fn test_future_created_is_not_stale() {
        // Clock skew between Stripe and the host must not reject an event.
        let now = 1_700_000_000;
        assert!(!deletion_is_stale(now + 120, now));
    }
}

#[cfg(test)]
mod entitlement_tests {
    use crate::entitlement::{pick_current_row, resolve_access, AccessSource};
    use crate::store::{SubscriptionRow, SubscriptionStatus};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    // =========================================================================
    // Stripe outranks the membership link: trialing + active pledge reports
    // stripe_trialing, not patreon
    // =========================================================================
    #[test]
    fn test_stripe_trialing_outranks_patreon() {
        let (has_access, source) = resolve_access(Some(SubscriptionStatus::Trialing), true);
        assert!(has_access);
        assert_eq!(source, AccessSource::StripeTrialing);
    }

    #[test]
    fn test_stripe_active_outranks_everything() {
        let (has_access, source) = resolve_access(Some(SubscriptionStatus::Active), true);
        assert!(has_access);
        assert_eq!(source, AccessSource::StripeActive);
    }

    // =========================================================================
    // A dead subscription with an active pledge still grants access via
    // the patreon path
    // =========================================================================
    #[test]
    fn test_patreon_covers_canceled_subscription() {
        let (has_access, source) = resolve_access(Some(SubscriptionStatus::Canceled), true);
        assert!(has_access);
        assert_eq!(source, AccessSource::Patreon);

        let (has_access, source) = resolve_access(None, true);
        assert!(has_access);
        assert_eq!(source, AccessSource::Patreon);
    }

    #[test]
    fn test_no_source_means_no_access() {
        let (has_access, source) = resolve_access(Some(SubscriptionStatus::PastDue), false);
        assert!(!has_access);
        assert_eq!(source, AccessSource::None);

        let (has_access, source) = resolve_access(None, false);
        assert!(!has_access);
        assert_eq!(source, AccessSource::None);
    }

    fn make_row(status: &str, age_days: i64) -> SubscriptionRow {
        let now = OffsetDateTime::now_utc();
        SubscriptionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            stripe_customer_id: "cus_test".to_string(),
            stripe_subscription_id: format!("sub_{}", Uuid::new_v4()),
            status: status.to_string(),
            current_period_start: now - Duration::days(age_days + 30),
            current_period_end: now + Duration::days(30),
            cancel_at_period_end: false,
            updated_at: now - Duration::days(age_days),
        }
    }

    // =========================================================================
    // The current row is the entitling one, even when a dead row is newer
    // =========================================================================
    #[test]
    fn test_pick_current_prefers_entitling_row() {
        let rows = vec![make_row("canceled", 0), make_row("active", 5)];
        let picked = pick_current_row(&rows).unwrap();
        assert_eq!(picked.status, "active");
    }

    #[test]
    fn test_pick_current_prefers_active_over_trialing() {
        let rows = vec![make_row("trialing", 0), make_row("active", 5)];
        let picked = pick_current_row(&rows).unwrap();
        assert_eq!(picked.status, "active");
    }

    #[test]
    fn test_pick_current_falls_back_to_most_recent() {
        let rows = vec![make_row("canceled", 1), make_row("past_due", 9)];
        let picked = pick_current_row(&rows).unwrap();
        assert_eq!(picked.status, "canceled");

        assert!(pick_current_row(&[]).is_none());
    }
}

#[cfg(test)]
mod sync_priority_tests {
    use crate::store::SubscriptionStatus;
    use crate::subscriptions::pick_most_relevant;

    // =========================================================================
    // active > trialing > past_due > canceled, never recency
    // =========================================================================
    #[test]
    fn test_older_active_beats_newer_canceled() {
        // Stripe lists most-recent first; the older active entry still wins.
        let statuses = vec![SubscriptionStatus::Canceled, SubscriptionStatus::Active];
        assert_eq!(pick_most_relevant(&statuses), Some(1));
    }

    #[test]
    fn test_trialing_beats_past_due_and_canceled() {
        let statuses = vec![
            SubscriptionStatus::Canceled,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Trialing,
        ];
        assert_eq!(pick_most_relevant(&statuses), Some(2));
    }

    #[test]
    fn test_past_due_beats_canceled() {
        let statuses = vec![SubscriptionStatus::Canceled, SubscriptionStatus::PastDue];
        assert_eq!(pick_most_relevant(&statuses), Some(1));
    }

    // =========================================================================
    // Outside the ranked four, fall back to the first listed entry
    // =========================================================================
    #[test]
    fn test_unranked_statuses_fall_back_to_first() {
        let statuses = vec![
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
        ];
        assert_eq!(pick_most_relevant(&statuses), Some(0));
    }

    #[test]
    fn test_empty_list_picks_nothing() {
        assert_eq!(pick_most_relevant(&[]), None);
    }
}

#[cfg(test)]
mod manual_grant_tests {
    use crate::reconcile::{is_manual_id, manual_grant_record, MANUAL_ID_PREFIX};
    use crate::store::SubscriptionStatus;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    #[test]
    fn test_manual_id_detection() {
        assert!(is_manual_id("manual_sub_0a1b"));
        assert!(is_manual_id("manual_cus_0a1b"));
        assert!(!is_manual_id("sub_1NXWPnJ9K"));
        assert!(!is_manual_id("cus_OZzz"));
    }

    // =========================================================================
    // Grant rows: manual-prefixed ids, active, one-year window, no
    // cancel_at_period_end
    // =========================================================================
    #[test]
    fn test_grant_record_shape() {
        let user_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        let record = manual_grant_record(user_id, now);

        assert_eq!(record.user_id, user_id);
        assert!(record.stripe_subscription_id.starts_with(MANUAL_ID_PREFIX));
        assert!(record.stripe_customer_id.starts_with(MANUAL_ID_PREFIX));
        assert_eq!(record.status, SubscriptionStatus::Active);
        assert_eq!(record.current_period_start, now);
        assert_eq!(record.current_period_end, now + Duration::days(365));
        assert!(!record.cancel_at_period_end);
    }

    // =========================================================================
    // Re-granting extends the window from the new invocation time
    // =========================================================================
    #[test]
    fn test_regrant_extends_window_from_invocation() {
        let user_id = Uuid::new_v4();
        let first = OffsetDateTime::now_utc();
        let second = first + Duration::days(30);

        let a = manual_grant_record(user_id, first);
        let b = manual_grant_record(user_id, second);

        assert_eq!(b.current_period_end - a.current_period_end, Duration::days(30));
        assert_ne!(
            a.stripe_subscription_id, b.stripe_subscription_id,
            "each grant mints a fresh identifier"
        );
    }
}

#[cfg(test)]
mod invoice_owner_tests {
    use crate::webhooks::{first_resolved, InvoiceUserCandidates};
    use uuid::Uuid;

    // =========================================================================
    // The chain resolves in declared order
    // =========================================================================
    #[test]
    fn test_chain_order() {
        let sub = Uuid::new_v4();
        let details = Uuid::new_v4();
        let line = Uuid::new_v4();
        let customer = Uuid::new_v4();
        let stored = Uuid::new_v4();

        let mut candidates = InvoiceUserCandidates {
            subscription_metadata: Some(sub),
            subscription_details_metadata: Some(details),
            line_metadata: Some(line),
            customer_metadata: Some(customer),
            stored_owner: Some(stored),
        };
        assert_eq!(first_resolved(&candidates), Some((sub, "subscription_metadata")));

        candidates.subscription_metadata = None;
        assert_eq!(
            first_resolved(&candidates),
            Some((details, "subscription_details_metadata"))
        );

        candidates.subscription_details_metadata = None;
        assert_eq!(first_resolved(&candidates), Some((line, "line_metadata")));

        candidates.line_metadata = None;
        assert_eq!(first_resolved(&candidates), Some((customer, "customer_metadata")));

        candidates.customer_metadata = None;
        assert_eq!(first_resolved(&candidates), Some((stored, "stored_subscription")));
    }

    // =========================================================================
    // No metadata anywhere but an existing local row: the stored owner is
    // the last resort
    // =========================================================================
    #[test]
    fn test_stored_owner_is_last_resort() {
        let stored = Uuid::new_v4();
        let candidates = InvoiceUserCandidates {
            stored_owner: Some(stored),
            ..Default::default()
        };
        assert_eq!(first_resolved(&candidates), Some((stored, "stored_subscription")));
    }

    #[test]
    fn test_nothing_resolves() {
        assert_eq!(first_resolved(&InvoiceUserCandidates::default()), None);
    }
}

#[cfg(test)]
mod notify_tests {
    use crate::notify::{subscription_type_tag, KlaviyoClient};
    use crate::store::SubscriptionStatus;

    #[test]
    fn test_subscription_type_tag_mapping() {
        assert_eq!(subscription_type_tag(SubscriptionStatus::Trialing), "stripe_trialing");
        assert_eq!(subscription_type_tag(SubscriptionStatus::Canceled), "canceled");
        assert_eq!(subscription_type_tag(SubscriptionStatus::Active), "stripe_active");
        assert_eq!(subscription_type_tag(SubscriptionStatus::PastDue), "stripe_active");
    }

    // =========================================================================
    // Profile sync posts the subscription_type property to Klaviyo
    // =========================================================================
    #[tokio::test]
    async fn test_profile_sync_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/profile-import/")
            .match_header("authorization", "Klaviyo-API-Key test-key")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "data": {
                    "type": "profile",
                    "attributes": {
                        "email": "member@example.com",
                        "properties": { "subscription_type": "stripe_trialing" },
                    },
                },
            })))
            .with_status(202)
            .create_async()
            .await;

        let client = KlaviyoClient::with_base_url("test-key".to_string(), server.url());
        client
            .sync_profile("member@example.com", Some("Ada"), "stripe_trialing")
            .await
            .unwrap();

        mock.assert_async().await;
    }

    // =========================================================================
    // A non-2xx from the sink surfaces as an error (callers log, not fail)
    // =========================================================================
    #[tokio::test]
    async fn test_sink_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/events/")
            .with_status(500)
            .create_async()
            .await;

        let client = KlaviyoClient::with_base_url("test-key".to_string(), server.url());
        let result = client.track_event("member@example.com", "Started Trial").await;
        assert!(result.is_err());
    }
}
