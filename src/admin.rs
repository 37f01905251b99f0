//! Administrative subscription actions
//!
//! Lookups plus the two user-initiated transitions that go through Stripe
//! first and the local store second:
//!
//! - cancel: schedule cancellation at period end (status stays `active`)
//! - reactivate: clear a scheduled cancellation
//!
//! A gateway failure aborts the action before the store is touched. The
//! backend is notified after the store write, best effort, with the customer
//! email Stripe returned.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::error::ErrorResponse;
use crate::models::{Invoice, Subscription, SubscriptionStatus};
use crate::notify::{SubscriptionChange, SubscriptionNotifier};
use crate::store::{modify_subscription, InvoiceStore, StoreError, SubscriptionStore};
use crate::stripe::gateway::{GatewayError, PaymentGateway};

/// Administrative action failures
#[derive(Error, Debug)]
pub enum AdminError {
    /// No subscription for (user, tenant)
    #[error("Subscription not found")]
    NotFound,

    /// Cancel requested on a canceled subscription
    #[error("Subscription is already canceled")]
    AlreadyCanceled,

    /// Cancel requested while cancellation is already scheduled
    #[error("Subscription is already scheduled for cancellation")]
    AlreadyScheduled,

    /// Reactivate requested on a non-active subscription
    #[error("Subscription is not active")]
    NotActive,

    /// Reactivate requested with nothing scheduled
    #[error("Subscription is not scheduled for cancellation")]
    NotScheduled,

    /// Stripe rejected or could not be reached
    #[error("Error {action} subscription")]
    Gateway {
        /// "canceling" or "reactivating"
        action: &'static str,
        /// Underlying gateway error
        #[source]
        source: GatewayError,
    },

    /// The store failed
    #[error("Error {action} subscription")]
    Store {
        /// "fetching" or "updating"
        action: &'static str,
        /// Underlying store error
        #[source]
        source: StoreError,
    },
}

impl AdminError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyCanceled | Self::AlreadyScheduled | Self::NotActive | Self::NotScheduled => {
                StatusCode::BAD_REQUEST
            }
            Self::Gateway { .. } | Self::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn fetching(source: StoreError) -> Self {
        Self::Store {
            action: "fetching",
            source,
        }
    }

    fn updating(source: StoreError) -> Self {
        Self::Store {
            action: "updating",
            source,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        match &self {
            Self::Gateway { source, .. } => {
                tracing::error!(error = %source, "Payment gateway call failed")
            }
            Self::Store { source, .. } => tracing::error!(error = %source, "Store call failed"),
            _ => {}
        }
        (self.status_code(), Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

/// Result type for administrative actions
pub type AdminResult<T> = std::result::Result<T, AdminError>;

/// Subscription administration service
pub struct SubscriptionAdmin {
    subscriptions: Arc<dyn SubscriptionStore>,
    invoices: Arc<dyn InvoiceStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn SubscriptionNotifier>,
}

impl SubscriptionAdmin {
    /// Create the service over its collaborators
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        invoices: Arc<dyn InvoiceStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn SubscriptionNotifier>,
    ) -> Self {
        Self {
            subscriptions,
            invoices,
            gateway,
            notifier,
        }
    }

    /// Subscription for a user within a tenant
    ///
    /// # Errors
    ///
    /// [`AdminError::NotFound`] when there is none, [`AdminError::Store`] on
    /// store failure.
    pub async fn subscription(&self, user_id: &str, tenant: &str) -> AdminResult<Subscription> {
        self.subscriptions
            .get_by_user_tenant(user_id, tenant)
            .await
            .map_err(AdminError::fetching)?
            .ok_or(AdminError::NotFound)
    }

    /// Invoices for a user within a tenant, newest first
    ///
    /// # Errors
    ///
    /// [`AdminError::Store`] on store failure.
    pub async fn invoices(&self, user_id: &str, tenant: &str) -> AdminResult<Vec<Invoice>> {
        self.invoices
            .list_for_user(user_id, tenant)
            .await
            .map_err(AdminError::fetching)
    }

    /// Schedule cancellation at the end of the current period
    ///
    /// # Errors
    ///
    /// See [`AdminError`]; the store is untouched unless Stripe accepted the
    /// change.
    pub async fn cancel(&self, user_id: &str, tenant: &str) -> AdminResult<Subscription> {
        let current = self.subscription(user_id, tenant).await?;

        if current.status == SubscriptionStatus::Canceled {
            return Err(AdminError::AlreadyCanceled);
        }
        if current.cancel_at_period_end {
            return Err(AdminError::AlreadyScheduled);
        }

        let remote = self
            .gateway
            .cancel_at_period_end(&current.stripe_subscription_id)
            .await
            .map_err(|source| AdminError::Gateway {
                action: "canceling",
                source,
            })?;

        let saved = modify_subscription(self.subscriptions.as_ref(), current, |row| {
            row.cancel_at_period_end = true;
        })
        .await
        .map_err(AdminError::updating)?;

        tracing::info!(
            user_id,
            tenant,
            subscription_id = %saved.stripe_subscription_id,
            "Subscription scheduled for cancellation"
        );
        self.notify(&saved, remote.customer_email).await;
        Ok(saved)
    }

    /// Clear a scheduled cancellation
    ///
    /// # Errors
    ///
    /// See [`AdminError`]; the store is untouched unless Stripe accepted the
    /// change.
    pub async fn reactivate(&self, user_id: &str, tenant: &str) -> AdminResult<Subscription> {
        let current = self.subscription(user_id, tenant).await?;

        if current.status != SubscriptionStatus::Active {
            return Err(AdminError::NotActive);
        }
        if !current.is_pending_cancellation() {
            return Err(AdminError::NotScheduled);
        }

        let remote = self
            .gateway
            .reactivate(&current.stripe_subscription_id)
            .await
            .map_err(|source| AdminError::Gateway {
                action: "reactivating",
                source,
            })?;

        let saved = modify_subscription(self.subscriptions.as_ref(), current, |row| {
            row.cancel_at_period_end = false;
        })
        .await
        .map_err(AdminError::updating)?;

        tracing::info!(
            user_id,
            tenant,
            subscription_id = %saved.stripe_subscription_id,
            "Subscription reactivated"
        );
        self.notify(&saved, remote.customer_email).await;
        Ok(saved)
    }

    async fn notify(&self, subscription: &Subscription, email: Option<String>) {
        let change = SubscriptionChange::from_subscription(subscription).with_email(email);
        self.notifier.notify(&change).await.record(&change);
    }
}
