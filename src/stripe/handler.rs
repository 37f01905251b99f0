//! Stripe webhook HTTP endpoint
//!
//! ```text
//! POST /webhook
//!       |
//!       v
//! [Stripe-Signature present?] --no--> 400
//!       |
//!       v
//! [Verify raw body] --fail--> 400
//!       |
//!       v
//! [Decode envelope] --fail--> 400
//!       |
//!       v
//! [Reconcile] (errors logged) --> 200 {"status":"success"}
//! ```
//!
//! After authentication every delivery is acknowledged. Reconciliation
//! failures are logged and counted, never surfaced to Stripe, so a bad event
//! cannot put the endpoint into a redelivery loop.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::stripe::error::{WebhookError, WebhookResult};
use crate::stripe::events::EventEnvelope;
use crate::stripe::processor::ReconciliationEngine;
use crate::stripe::signature::{SignatureError, SignatureVerifier};

/// Header carrying the webhook signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Acknowledgement body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    /// Always "success"
    pub status: String,
}

impl Default for AckResponse {
    fn default() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

/// Shared state for the webhook endpoint
pub struct WebhookState {
    verifier: SignatureVerifier,
    engine: Arc<ReconciliationEngine>,
}

impl WebhookState {
    /// Create webhook state
    pub fn new(verifier: SignatureVerifier, engine: Arc<ReconciliationEngine>) -> Self {
        Self { verifier, engine }
    }

    /// Verify the raw body against the signature header and decode it
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError`] when the header is missing, the signature does
    /// not verify, or the verified body is not an event envelope.
    pub fn authenticate(&self, headers: &HeaderMap, body: &[u8]) -> WebhookResult<EventEnvelope> {
        let header = headers
            .get(SIGNATURE_HEADER)
            .ok_or(WebhookError::MissingSignature)?
            .to_str()
            .map_err(|_| WebhookError::InvalidSignature(SignatureError::MalformedHeader))?;

        self.verifier
            .verify(body, header)
            .map_err(WebhookError::InvalidSignature)?;

        EventEnvelope::from_bytes(body)
    }
}

/// Webhook endpoint handler
#[instrument(skip_all)]
pub async fn stripe_webhook_handler(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> WebhookResult<Json<AckResponse>> {
    let event = match state.authenticate(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            metrics::counter!(
                "billing_webhook_events_total",
                "kind" => "unauthenticated",
                "outcome" => "rejected"
            )
            .increment(1);
            tracing::warn!(error = %e, "Rejected webhook delivery");
            return Err(e);
        }
    };

    tracing::debug!(
        event_id = %event.id,
        event_type = %event.event_type,
        livemode = event.livemode,
        "Webhook verified"
    );

    // Outcome and failure are logged by the engine
    let _ = state.engine.process(&event).await;

    Ok(Json(AckResponse::default()))
}

/// Router exposing `POST /webhook`
pub fn stripe_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(stripe_webhook_handler))
        .with_state(state)
}
