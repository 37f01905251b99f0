//! Outbound calls to the Stripe API.
//!
//! Only the administrative endpoints use the gateway; webhook ingestion never
//! calls back into Stripe. The client carries its own credentials and base
//! URL so several gateways (or a test double) can coexist in one process.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::models::SubscriptionStatus;

/// Default Stripe API base URL
pub const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Default request timeout
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway failures
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport-level failure (connect, timeout, TLS)
    #[error("request to payment processor failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Stripe answered with an error status
    #[error("payment processor returned {status}: {message}")]
    Api {
        /// HTTP status
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// Stripe answered 2xx with an unexpected body
    #[error("unexpected payment processor response: {0}")]
    Decode(String),

    /// The base URL cannot address API resources
    #[error("invalid payment processor base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Subscription state returned by the processor after an update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySubscription {
    /// Subscription ID
    pub id: String,
    /// Status after the update
    pub status: SubscriptionStatus,
    /// Whether cancellation is scheduled
    pub cancel_at_period_end: bool,
    /// Customer email, from the expanded customer
    pub customer_email: Option<String>,
}

/// Processor operations used by administrative actions
#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    /// Set or clear the scheduled cancellation of a subscription
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<GatewaySubscription, GatewayError>;

    /// Schedule cancellation at the end of the current period
    async fn cancel_at_period_end(
        &self,
        subscription_id: &str,
    ) -> Result<GatewaySubscription, GatewayError> {
        self.set_cancel_at_period_end(subscription_id, true).await
    }

    /// Remove a scheduled cancellation
    async fn reactivate(&self, subscription_id: &str) -> Result<GatewaySubscription, GatewayError> {
        self.set_cancel_at_period_end(subscription_id, false).await
    }
}

/// Stripe REST client
#[derive(Clone)]
pub struct StripeGateway {
    client: reqwest::Client,
    base_url: Url,
    secret_key: String,
}

impl std::fmt::Debug for StripeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeGateway")
            .field("base_url", &self.base_url.as_str())
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: SubscriptionStatus,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    customer: Option<CustomerRef>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CustomerRef {
    Id(#[allow(dead_code)] String),
    Expanded {
        #[serde(default)]
        email: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl From<SubscriptionResponse> for GatewaySubscription {
    fn from(response: SubscriptionResponse) -> Self {
        let customer_email = match response.customer {
            Some(CustomerRef::Expanded { email }) => email.filter(|e| !e.is_empty()),
            _ => None,
        };
        Self {
            id: response.id,
            status: response.status,
            cancel_at_period_end: response.cancel_at_period_end,
            customer_email,
        }
    }
}

impl StripeGateway {
    /// Create a gateway for `base_url` authenticated with `secret_key`
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Http`] if the HTTP client cannot be built.
    pub fn new(
        secret_key: impl Into<String>,
        base_url: Url,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            secret_key: secret_key.into(),
        })
    }

    /// URL of a subscription resource
    fn subscription_url(&self, subscription_id: &str) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["v1", "subscriptions", subscription_id]);
        Ok(url)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> Result<GatewaySubscription, GatewayError> {
        let url = self.subscription_url(subscription_id)?;
        let flag = if cancel { "true" } else { "false" };

        tracing::debug!(subscription_id, cancel, "Updating subscription at processor");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.secret_key)
            .form(&[("cancel_at_period_end", flag), ("expand[]", "customer")])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error.message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown error").to_string());
            return Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_slice::<SubscriptionResponse>(&body)
            .map(GatewaySubscription::from)
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}
