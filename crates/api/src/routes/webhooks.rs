//! Stripe webhook endpoint.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use samplevault_billing::WebhookOutcome;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Acknowledgement body returned to Stripe.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplicated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<&'static str>,
}

impl From<WebhookOutcome> for WebhookAck {
    fn from(outcome: WebhookOutcome) -> Self {
        match outcome {
            WebhookOutcome::Processed | WebhookOutcome::Ignored => WebhookAck {
                received: true,
                deduplicated: None,
                rejected: None,
            },
            WebhookOutcome::Deduplicated => WebhookAck {
                received: true,
                deduplicated: Some(true),
                rejected: None,
            },
            WebhookOutcome::StaleRejected => WebhookAck {
                received: true,
                deduplicated: None,
                rejected: Some("stale_event"),
            },
        }
    }
}

/// Handle Stripe webhook events
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook signature verification failed");
            ApiError::BadRequest("Invalid webhook signature".to_string())
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    let outcome = state.billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook handling error");
        ApiError::Internal
    })?;

    Ok(Json(WebhookAck::from(outcome)))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_ack_serialization() {
        let ack = serde_json::to_value(WebhookAck::from(WebhookOutcome::Processed)).unwrap();
        assert_eq!(ack, serde_json::json!({"received": true}));

        let ack = serde_json::to_value(WebhookAck::from(WebhookOutcome::Ignored)).unwrap();
        assert_eq!(ack, serde_json::json!({"received": true}));

        let ack = serde_json::to_value(WebhookAck::from(WebhookOutcome::Deduplicated)).unwrap();
        assert_eq!(
            ack,
            serde_json::json!({"received": true, "deduplicated": true})
        );

        let ack = serde_json::to_value(WebhookAck::from(WebhookOutcome::StaleRejected)).unwrap();
        assert_eq!(
            ack,
            serde_json::json!({"received": true, "rejected": "stale_event"})
        );
    }
}
