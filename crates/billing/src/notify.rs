//! Outbound notification sinks.
//!
//! Two sinks: Klaviyo (email-marketing profile sync + conversion events) and
//! Resend (admin alert emails). Both are fire-and-forget: the webhook and
//! reconciliation paths spawn the send as a detached task, and a sink failure
//! is logged, never propagated into the billing transaction.

use reqwest::Client;

use crate::error::{BillingError, BillingResult};
use crate::store::SubscriptionStatus;

const KLAVIYO_API_URL: &str = "https://a.klaviyo.com";
const KLAVIYO_REVISION: &str = "2024-10-15";
const RESEND_API_URL: &str = "https://api.resend.com";

/// Klaviyo `subscription_type` profile tag for a subscription status.
pub fn subscription_type_tag(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Trialing => "stripe_trialing",
        SubscriptionStatus::Canceled => "canceled",
        _ => "stripe_active",
    }
}

// =============================================================================
// Klaviyo
// =============================================================================

#[derive(Clone)]
pub struct KlaviyoClient {
    http: Client,
    api_key: String,
    base_url: String,
}

impl KlaviyoClient {
    pub fn new(api_key: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            base_url: KLAVIYO_API_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            base_url,
        }
    }

    /// Upsert the profile with its current `subscription_type` tag.
    pub async fn sync_profile(
        &self,
        email: &str,
        first_name: Option<&str>,
        subscription_type: &str,
    ) -> BillingResult<()> {
        let body = serde_json::json!({
            "data": {
                "type": "profile",
                "attributes": {
                    "email": email,
                    "first_name": first_name,
                    "properties": {
                        "subscription_type": subscription_type,
                    },
                },
            },
        });

        let response = self
            .http
            .post(format!("{}/api/profile-import/", self.base_url))
            .header("Authorization", format!("Klaviyo-API-Key {}", self.api_key))
            .header("revision", KLAVIYO_REVISION)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Klaviyo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "Klaviyo profile import returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    /// Record a conversion-tracking event against the profile.
    pub async fn track_event(&self, email: &str, metric_name: &str) -> BillingResult<()> {
        let body = serde_json::json!({
            "data": {
                "type": "event",
                "attributes": {
                    "metric": {
                        "data": {
                            "type": "metric",
                            "attributes": { "name": metric_name },
                        },
                    },
                    "profile": {
                        "data": {
                            "type": "profile",
                            "attributes": { "email": email },
                        },
                    },
                    "properties": {},
                },
            },
        });

        let response = self
            .http
            .post(format!("{}/api/events/", self.base_url))
            .header("Authorization", format!("Klaviyo-API-Key {}", self.api_key))
            .header("revision", KLAVIYO_REVISION)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Klaviyo request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "Klaviyo event track returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Resend admin alerts
// =============================================================================

#[derive(Clone)]
pub struct AdminAlerts {
    http: Client,
    api_key: String,
    from: String,
    to: String,
    base_url: String,
}

impl AdminAlerts {
    pub fn new(api_key: String, from: String, to: String) -> Self {
        Self {
            http: Client::new(),
            api_key,
            from,
            to,
            base_url: RESEND_API_URL.to_string(),
        }
    }

    pub async fn send(&self, subject: &str, html: &str) -> BillingResult<()> {
        let body = serde_json::json!({
            "from": self.from,
            "to": [self.to],
            "subject": subject,
            "html": html,
        });

        let response = self
            .http
            .post(format!("{}/emails", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Resend request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "Resend returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Fire-and-forget dispatcher over the configured sinks. Unconfigured sinks
/// reduce every dispatch to a debug log line, which keeps local development
/// and tests quiet without stubbing HTTP.
#[derive(Clone)]
pub struct NotificationService {
    klaviyo: Option<KlaviyoClient>,
    alerts: Option<AdminAlerts>,
}

impl NotificationService {
    pub fn new(klaviyo: Option<KlaviyoClient>, alerts: Option<AdminAlerts>) -> Self {
        Self { klaviyo, alerts }
    }

    pub fn from_env() -> Self {
        let klaviyo = match std::env::var("KLAVIYO_PRIVATE_API_KEY") {
            Ok(key) if !key.is_empty() => Some(KlaviyoClient::new(key)),
            _ => {
                tracing::warn!("KLAVIYO_PRIVATE_API_KEY not set - profile sync disabled");
                None
            }
        };

        let alerts = match (
            std::env::var("RESEND_API_KEY"),
            std::env::var("ADMIN_ALERT_EMAIL"),
        ) {
            (Ok(key), Ok(to)) if !key.is_empty() && !to.is_empty() => {
                let from = std::env::var("ALERT_FROM_EMAIL")
                    .unwrap_or_else(|_| "SampleVault <alerts@samplevault.app>".to_string());
                Some(AdminAlerts::new(key, from, to))
            }
            _ => {
                tracing::warn!(
                    "RESEND_API_KEY / ADMIN_ALERT_EMAIL not set - admin alerts disabled"
                );
                None
            }
        };

        Self::new(klaviyo, alerts)
    }

    /// Sync the member's Klaviyo profile with its subscription_type tag.
    pub fn profile_sync(&self, email: &str, first_name: Option<&str>, subscription_type: &'static str) {
        let Some(klaviyo) = self.klaviyo.clone() else {
            tracing::debug!(email = %email, "Klaviyo not configured - skipping profile sync");
            return;
        };
        let email = email.to_string();
        let first_name = first_name.map(|s| s.to_string());

        tokio::spawn(async move {
            if let Err(e) = klaviyo
                .sync_profile(&email, first_name.as_deref(), subscription_type)
                .await
            {
                tracing::warn!(
                    email = %email,
                    subscription_type = %subscription_type,
                    error = %e,
                    "Klaviyo profile sync failed"
                );
            }
        });
    }

    /// Conversion-tracking event fired when a trial (or direct paid signup)
    /// begins at checkout.
    pub fn trial_started_event(&self, email: &str) {
        let Some(klaviyo) = self.klaviyo.clone() else {
            return;
        };
        let email = email.to_string();

        tokio::spawn(async move {
            if let Err(e) = klaviyo.track_event(&email, "Started Trial").await {
                tracing::warn!(email = %email, error = %e, "Klaviyo trial event failed");
            }
        });
    }

    pub fn admin_trial_started(&self, email: &str) {
        self.spawn_alert(
            "New trial started",
            format!("<p>A new trial subscription started for <b>{email}</b>.</p>"),
        );
    }

    pub fn admin_trial_converted(&self, email: &str) {
        self.spawn_alert(
            "Trial converted to paid",
            format!("<p>The trial for <b>{email}</b> converted to a paid subscription.</p>"),
        );
    }

    fn spawn_alert(&self, subject: &'static str, html: String) {
        let Some(alerts) = self.alerts.clone() else {
            tracing::debug!(subject = %subject, "Resend not configured - skipping admin alert");
            return;
        };

        tokio::spawn(async move {
            if let Err(e) = alerts.send(subject, &html).await {
                tracing::warn!(subject = %subject, error = %e, "Admin alert email failed");
            }
        });
    }
}
