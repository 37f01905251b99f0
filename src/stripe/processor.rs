//! Event reconciliation
//!
//! Applies one authenticated event to the local store and tells the backend
//! about the resulting subscription state.
//!
//! ```text
//! EventEnvelope
//!       |
//!       v
//! [Dispatch on kind] --(timeout)--> ReconcileError::Timeout
//!       |
//!       v
//! [Decode object view] --> ReconcileError::Decode
//!       |
//!       v
//! [Insert / conditional update] --> duplicate? --> Outcome::Duplicate
//!       |
//!       v
//! [Notify backend] (best effort, after the write)
//! ```
//!
//! Idempotency is per handler: duplicates surface from the store's unique
//! keys, never from an event-id cache, so a redelivered event cannot create a
//! second row.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::models::{
    InvoiceStatus, NewInvoice, NewSubscription, Plan, Subscription, SubscriptionStatus,
};
use crate::notify::{SubscriptionChange, SubscriptionNotifier};
use crate::store::{modify_subscription, InvoiceStore, SubscriptionStore};
use crate::stripe::error::ReconcileError;
use crate::stripe::events::{
    timestamp, CheckoutSessionObject, EventEnvelope, EventKind, InvoiceObject,
    SubscriptionObject,
};

/// Default bound on processing a single event
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(30);

/// What reconciling an event did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A subscription row was inserted
    SubscriptionCreated {
        /// Processor subscription id
        subscription_id: String,
    },
    /// A subscription row was overwritten from the event
    SubscriptionUpdated {
        /// Processor subscription id
        subscription_id: String,
    },
    /// A subscription row was marked canceled
    SubscriptionCanceled {
        /// Processor subscription id
        subscription_id: String,
    },
    /// An invoice row was inserted
    InvoiceRecorded {
        /// Processor invoice id
        invoice_id: String,
    },
    /// The row already existed; nothing was written
    Duplicate {
        /// The key that already exists
        key: String,
    },
    /// The event referenced a subscription this service does not know
    UnknownSubscription {
        /// Processor subscription id
        subscription_id: String,
    },
    /// The invoice is not tied to a subscription
    NotSubscriptionInvoice {
        /// Processor invoice id
        invoice_id: String,
    },
    /// Observed and logged only
    Logged,
    /// Event type this service does not handle
    Ignored,
}

impl Outcome {
    /// Short label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated { .. } => "created",
            Self::SubscriptionUpdated { .. } => "updated",
            Self::SubscriptionCanceled { .. } => "canceled",
            Self::InvoiceRecorded { .. } => "recorded",
            Self::Duplicate { .. } => "duplicate",
            Self::UnknownSubscription { .. } => "unknown_subscription",
            Self::NotSubscriptionInvoice { .. } => "no_subscription",
            Self::Logged => "logged",
            Self::Ignored => "ignored",
        }
    }
}

/// Result of a handler: the outcome plus the row the backend should hear about
struct Applied {
    outcome: Outcome,
    changed: Option<Subscription>,
}

impl Applied {
    fn quiet(outcome: Outcome) -> Self {
        Self {
            outcome,
            changed: None,
        }
    }

    fn notify(outcome: Outcome, changed: Subscription) -> Self {
        Self {
            outcome,
            changed: Some(changed),
        }
    }
}

/// Bounded-cardinality label for an event kind
fn kind_label(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::CheckoutSessionCompleted => "checkout.session.completed",
        EventKind::SubscriptionCreated => "customer.subscription.created",
        EventKind::SubscriptionUpdated => "customer.subscription.updated",
        EventKind::SubscriptionDeleted => "customer.subscription.deleted",
        EventKind::InvoicePaid => "invoice.paid",
        EventKind::InvoicePaymentFailed => "invoice.payment_failed",
        EventKind::Unhandled(_) => "unhandled",
    }
}

/// Applies webhook events to the store
pub struct ReconciliationEngine {
    subscriptions: Arc<dyn SubscriptionStore>,
    invoices: Arc<dyn InvoiceStore>,
    notifier: Arc<dyn SubscriptionNotifier>,
    processing_timeout: Duration,
    detach_notifications: bool,
}

impl ReconciliationEngine {
    /// Create an engine over the given collaborators
    pub fn new(
        subscriptions: Arc<dyn SubscriptionStore>,
        invoices: Arc<dyn InvoiceStore>,
        notifier: Arc<dyn SubscriptionNotifier>,
    ) -> Self {
        Self {
            subscriptions,
            invoices,
            notifier,
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            detach_notifications: false,
        }
    }

    /// Override the per-event processing bound
    pub fn with_processing_timeout(mut self, processing_timeout: Duration) -> Self {
        self.processing_timeout = processing_timeout;
        self
    }

    /// Send backend notifications from a spawned task instead of awaiting them
    pub fn with_detached_notifications(mut self, detach: bool) -> Self {
        self.detach_notifications = detach;
        self
    }

    /// Reconcile one event.
    ///
    /// The result is logged and counted here; callers only need it for
    /// tests or their own bookkeeping.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the object cannot be decoded, fails
    /// validation, the store fails, or processing exceeds the timeout.
    pub async fn process(&self, event: &EventEnvelope) -> Result<Outcome, ReconcileError> {
        let kind = event.kind();

        let result = match timeout(self.processing_timeout, self.dispatch(&kind, event)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Timeout(self.processing_timeout)),
        };

        match result {
            Ok(applied) => {
                metrics::counter!(
                    "billing_webhook_events_total",
                    "kind" => kind_label(&kind),
                    "outcome" => applied.outcome.label()
                )
                .increment(1);
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = applied.outcome.label(),
                    "Event reconciled"
                );

                if let Some(subscription) = applied.changed {
                    self.notify(SubscriptionChange::from_subscription(&subscription))
                        .await;
                }
                Ok(applied.outcome)
            }
            Err(e) => {
                metrics::counter!(
                    "billing_webhook_events_total",
                    "kind" => kind_label(&kind),
                    "outcome" => e.label()
                )
                .increment(1);
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event reconciliation failed"
                );
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        kind: &EventKind,
        event: &EventEnvelope,
    ) -> Result<Applied, ReconcileError> {
        match kind {
            EventKind::SubscriptionCreated => {
                self.on_subscription_created(&decode(kind, event)?).await
            }
            EventKind::SubscriptionUpdated => {
                self.on_subscription_updated(&decode(kind, event)?).await
            }
            EventKind::SubscriptionDeleted => {
                self.on_subscription_deleted(&decode(kind, event)?).await
            }
            EventKind::InvoicePaid => self.on_invoice_paid(&decode(kind, event)?).await,
            EventKind::InvoicePaymentFailed => {
                let invoice: InvoiceObject = decode(kind, event)?;
                tracing::warn!(
                    event_id = %event.id,
                    invoice_id = %invoice.id,
                    subscription_id = invoice.subscription_id().unwrap_or_default(),
                    "Invoice payment failed"
                );
                Ok(Applied::quiet(Outcome::Logged))
            }
            EventKind::CheckoutSessionCompleted => {
                let session: CheckoutSessionObject = decode(kind, event)?;
                tracing::info!(
                    event_id = %event.id,
                    session_id = %session.id,
                    customer_id = session.customer.as_deref().unwrap_or_default(),
                    subscription_id = session.subscription.as_deref().unwrap_or_default(),
                    "Checkout session completed"
                );
                Ok(Applied::quiet(Outcome::Logged))
            }
            EventKind::Unhandled(event_type) => {
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event_type,
                    "Ignoring unhandled event type"
                );
                Ok(Applied::quiet(Outcome::Ignored))
            }
        }
    }

    async fn on_subscription_created(
        &self,
        object: &SubscriptionObject,
    ) -> Result<Applied, ReconcileError> {
        let user_id = required_metadata(object, "user_id")?;
        let tenant = required_metadata(object, "tenant")?;
        let plan_value = required_metadata(object, "plan")?;
        let plan: Plan = plan_value
            .parse()
            .map_err(|_| ReconcileError::Validation(format!("unknown plan: {plan_value}")))?;
        let (current_period_start, current_period_end) = object.current_period();

        let new = NewSubscription {
            user_id: user_id.to_string(),
            tenant: tenant.to_string(),
            stripe_customer_id: object.customer.clone(),
            stripe_subscription_id: object.id.clone(),
            status: object.status,
            plan,
            current_period_start,
            current_period_end,
            cancel_at_period_end: object.cancel_at_period_end,
        };

        match self.subscriptions.create(new).await {
            Ok(row) => {
                tracing::info!(
                    subscription_id = %row.stripe_subscription_id,
                    user_id = %row.user_id,
                    tenant = %row.tenant,
                    plan = %row.plan,
                    "Subscription created"
                );
                Ok(Applied::notify(
                    Outcome::SubscriptionCreated {
                        subscription_id: object.id.clone(),
                    },
                    row,
                ))
            }
            Err(e) if e.is_duplicate() => {
                tracing::info!(
                    subscription_id = %object.id,
                    user_id,
                    tenant,
                    "Subscription already exists, skipping duplicate"
                );
                Ok(Applied::quiet(Outcome::Duplicate {
                    key: object.id.clone(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_subscription_updated(
        &self,
        object: &SubscriptionObject,
    ) -> Result<Applied, ReconcileError> {
        let Some(current) = self.subscriptions.get_by_processor_id(&object.id).await? else {
            return Ok(Applied::quiet(unknown_subscription(&object.id)));
        };

        let (start, end) = object.current_period();
        let status = object.status;
        let cancel_at_period_end = object.cancel_at_period_end;

        let saved = modify_subscription(self.subscriptions.as_ref(), current, |row| {
            row.status = status;
            row.cancel_at_period_end = cancel_at_period_end;
            if start.is_some() {
                row.current_period_start = start;
            }
            if end.is_some() {
                row.current_period_end = end;
            }
        })
        .await?;

        tracing::info!(
            subscription_id = %saved.stripe_subscription_id,
            status = %saved.status,
            cancel_at_period_end = saved.cancel_at_period_end,
            "Subscription updated"
        );
        Ok(Applied::notify(
            Outcome::SubscriptionUpdated {
                subscription_id: object.id.clone(),
            },
            saved,
        ))
    }

    async fn on_subscription_deleted(
        &self,
        object: &SubscriptionObject,
    ) -> Result<Applied, ReconcileError> {
        let Some(current) = self.subscriptions.get_by_processor_id(&object.id).await? else {
            return Ok(Applied::quiet(unknown_subscription(&object.id)));
        };

        let saved = modify_subscription(self.subscriptions.as_ref(), current, |row| {
            row.status = SubscriptionStatus::Canceled;
        })
        .await?;

        tracing::info!(
            subscription_id = %saved.stripe_subscription_id,
            user_id = %saved.user_id,
            "Subscription canceled"
        );
        Ok(Applied::notify(
            Outcome::SubscriptionCanceled {
                subscription_id: object.id.clone(),
            },
            saved,
        ))
    }

    async fn on_invoice_paid(&self, object: &InvoiceObject) -> Result<Applied, ReconcileError> {
        let Some(subscription_id) = object.subscription_id() else {
            tracing::info!(invoice_id = %object.id, "Invoice has no subscription, skipping");
            return Ok(Applied::quiet(Outcome::NotSubscriptionInvoice {
                invoice_id: object.id.clone(),
            }));
        };

        let Some(subscription) = self.subscriptions.get_by_processor_id(subscription_id).await?
        else {
            return Ok(Applied::quiet(unknown_subscription(subscription_id)));
        };

        if self
            .invoices
            .get_by_processor_invoice_id(&object.id)
            .await?
            .is_some()
        {
            tracing::info!(invoice_id = %object.id, "Invoice already recorded");
            return Ok(Applied::quiet(Outcome::Duplicate {
                key: object.id.clone(),
            }));
        }

        let new = NewInvoice {
            subscription_id: subscription.id,
            stripe_invoice_id: object.id.clone(),
            user_id: subscription.user_id.clone(),
            tenant: subscription.tenant.clone(),
            amount_paid: object.amount_paid,
            currency: object.currency.clone(),
            status: object.status.unwrap_or(InvoiceStatus::Paid),
            invoice_pdf: non_empty(object.invoice_pdf.as_deref()),
            hosted_invoice_url: non_empty(object.hosted_invoice_url.as_deref()),
            period_start: timestamp(object.period_start),
            period_end: timestamp(object.period_end),
        };

        match self.invoices.create(new).await {
            Ok(invoice) => {
                tracing::info!(
                    invoice_id = %invoice.stripe_invoice_id,
                    subscription_id,
                    amount_paid = invoice.amount_paid,
                    currency = %invoice.currency,
                    "Invoice recorded"
                );
                Ok(Applied::quiet(Outcome::InvoiceRecorded {
                    invoice_id: object.id.clone(),
                }))
            }
            Err(e) if e.is_duplicate() => {
                tracing::info!(invoice_id = %object.id, "Invoice already recorded");
                Ok(Applied::quiet(Outcome::Duplicate {
                    key: object.id.clone(),
                }))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn notify(&self, change: SubscriptionChange) {
        if self.detach_notifications {
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                notifier.notify(&change).await.record(&change);
            });
        } else {
            self.notifier.notify(&change).await.record(&change);
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: &EventKind,
    event: &EventEnvelope,
) -> Result<T, ReconcileError> {
    event.decode_object().map_err(|source| ReconcileError::Decode {
        kind: kind.to_string(),
        source,
    })
}

fn required_metadata<'a>(
    object: &'a SubscriptionObject,
    key: &str,
) -> Result<&'a str, ReconcileError> {
    object
        .metadata_value(key)
        .ok_or_else(|| ReconcileError::Validation(format!("missing {key} in subscription metadata")))
}

fn unknown_subscription(subscription_id: &str) -> Outcome {
    tracing::warn!(subscription_id, "Subscription not found in local store");
    Outcome::UnknownSubscription {
        subscription_id: subscription_id.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
