//! Backend change notifications.
//!
//! After a subscription changes, the backend that owns the user account gets
//! a normalized snapshot at `POST {base}/webhooks/subscription`. Delivery is
//! best effort: one attempt, bounded by a timeout, and the result comes back
//! as a [`NotifyOutcome`] value for the caller to log. A failed notification
//! never undoes or blocks the store write that preceded it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::models::{Plan, Subscription, SubscriptionStatus};

/// Path appended to the backend base URL
pub const NOTIFY_PATH: &str = "webhooks/subscription";

/// Default request timeout
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalized subscription snapshot sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionChange {
    /// Backend user id
    pub user_id: String,
    /// Current status
    pub status: SubscriptionStatus,
    /// Current plan
    pub plan: Plan,
    /// Processor subscription id
    pub subscription_id: String,
    /// Billing period start, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    /// Billing period end, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    /// Whether cancellation is scheduled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_at_period_end: Option<bool>,
    /// Customer email, only known on administrative paths
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl SubscriptionChange {
    /// Snapshot a persisted subscription
    pub fn from_subscription(subscription: &Subscription) -> Self {
        Self {
            user_id: subscription.user_id.clone(),
            status: subscription.status,
            plan: subscription.plan,
            subscription_id: subscription.stripe_subscription_id.clone(),
            current_period_start: subscription.current_period_start,
            current_period_end: subscription.current_period_end,
            cancel_at_period_end: Some(subscription.cancel_at_period_end),
            email: None,
        }
    }

    /// Attach the customer email when it is known
    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }
}

/// What happened to a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// Backend answered 2xx
    Delivered {
        /// HTTP status returned
        status: u16,
    },
    /// Backend answered with a non-success status
    Rejected {
        /// HTTP status returned
        status: u16,
    },
    /// The request never completed (connect error, timeout, ...)
    Failed {
        /// Transport error description
        reason: String,
    },
}

impl NotifyOutcome {
    /// Short label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Rejected { .. } => "rejected",
            Self::Failed { .. } => "failed",
        }
    }

    /// Log the outcome and count it; never fails
    pub fn record(&self, change: &SubscriptionChange) {
        metrics::counter!("billing_notifications_total", "outcome" => self.label()).increment(1);

        match self {
            Self::Delivered { status } => tracing::info!(
                user_id = %change.user_id,
                subscription_id = %change.subscription_id,
                status = *status,
                "Backend notified of subscription change"
            ),
            Self::Rejected { status } => tracing::warn!(
                user_id = %change.user_id,
                subscription_id = %change.subscription_id,
                status = *status,
                "Backend rejected subscription notification"
            ),
            Self::Failed { reason } => tracing::warn!(
                user_id = %change.user_id,
                subscription_id = %change.subscription_id,
                error = %reason,
                "Failed to notify backend of subscription change"
            ),
        }
    }
}

/// Sink for subscription change notifications
#[async_trait]
pub trait SubscriptionNotifier: Send + Sync + 'static {
    /// Deliver one notification; the outcome is a value, not an error
    async fn notify(&self, change: &SubscriptionChange) -> NotifyOutcome;
}

/// Notifier construction failures
#[derive(Error, Debug)]
pub enum NotifyError {
    /// The endpoint URL cannot be derived from the base URL
    #[error("invalid notification endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// The HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// HTTP notifier posting JSON to the backend
#[derive(Debug, Clone)]
pub struct NotificationForwarder {
    client: reqwest::Client,
    endpoint: Url,
}

impl NotificationForwarder {
    /// Create a forwarder for `base_url` with a per-request `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError`] if the endpoint URL or HTTP client cannot be built.
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, NotifyError> {
        let endpoint = Url::parse(&format!(
            "{}/{NOTIFY_PATH}",
            base_url.as_str().trim_end_matches('/')
        ))?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, endpoint })
    }

    /// Full notification URL
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SubscriptionNotifier for NotificationForwarder {
    async fn notify(&self, change: &SubscriptionChange) -> NotifyOutcome {
        tracing::debug!(
            endpoint = %self.endpoint,
            user_id = %change.user_id,
            status = %change.status,
            "Sending subscription notification"
        );

        match self
            .client
            .post(self.endpoint.clone())
            .json(change)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => NotifyOutcome::Delivered {
                status: response.status().as_u16(),
            },
            Ok(response) => NotifyOutcome::Rejected {
                status: response.status().as_u16(),
            },
            Err(e) => NotifyOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }
}
