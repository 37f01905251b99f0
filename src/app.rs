//! Service assembly
//!
//! Builds every collaborator from a [`ServiceConfig`] and returns the
//! router. Store selection: PostgreSQL when `DATABASE_URL` is set (migrations
//! run on startup), otherwise the in-memory store.

use std::sync::Arc;

use axum::Router;

use crate::admin::SubscriptionAdmin;
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::handlers::app_router;
use crate::notify::NotificationForwarder;
use crate::store::{InvoiceStore, MemoryStore, PostgresStore, SubscriptionStore};
use crate::stripe::gateway::StripeGateway;
use crate::stripe::handler::WebhookState;
use crate::stripe::processor::ReconciliationEngine;
use crate::stripe::signature::SignatureVerifier;

/// Both store traits behind one backend
pub struct Stores {
    /// Subscription persistence
    pub subscriptions: Arc<dyn SubscriptionStore>,
    /// Invoice persistence
    pub invoices: Arc<dyn InvoiceStore>,
}

impl Stores {
    /// Share one backend value for both traits
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: SubscriptionStore + InvoiceStore,
    {
        Self {
            subscriptions: store.clone(),
            invoices: store,
        }
    }

    /// Open the store the configuration asks for
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or migrations fail.
    pub async fn open(config: &ServiceConfig) -> Result<Self> {
        match &config.database_url {
            Some(url) => {
                let store = PostgresStore::connect(url).await?;
                store.migrate().await?;
                tracing::info!("Using PostgreSQL store");
                Ok(Self::shared(Arc::new(store)))
            }
            None => Ok(Self::shared(Arc::new(MemoryStore::new()))),
        }
    }
}

/// Build the full router from configuration and opened stores
///
/// # Errors
///
/// Returns an error if an HTTP client cannot be constructed.
pub fn build_router(config: &ServiceConfig, stores: Stores) -> Result<Router> {
    let notifier = Arc::new(NotificationForwarder::new(
        &config.backend_webhook_url,
        config.notify_timeout,
    )?);
    let gateway = Arc::new(StripeGateway::new(
        config.stripe_secret_key.clone(),
        config.stripe_api_base.clone(),
        config.gateway_timeout,
    )?);

    let engine = ReconciliationEngine::new(
        stores.subscriptions.clone(),
        stores.invoices.clone(),
        notifier.clone(),
    )
    .with_processing_timeout(config.processing_timeout)
    .with_detached_notifications(true);

    let verifier =
        SignatureVerifier::new(&config.stripe_webhook_secret).with_tolerance(config.webhook_tolerance);
    let webhook = Arc::new(WebhookState::new(verifier, Arc::new(engine)));

    let admin = Arc::new(SubscriptionAdmin::new(
        stores.subscriptions,
        stores.invoices,
        gateway,
        notifier,
    ));

    Ok(app_router(webhook, admin))
}
