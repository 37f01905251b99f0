#![allow(missing_docs)]

//! Domain records owned by the reconciliation engine.
//!
//! These mirror the processor's vocabulary verbatim: statuses are the exact
//! snake_case strings Stripe sends, plans come from a closed catalog.

pub mod invoice;
pub mod subscription;

pub use invoice::{Invoice, InvoiceStatus, NewInvoice};
pub use subscription::{NewSubscription, Plan, Subscription, SubscriptionStatus};

use thiserror::Error;

/// A string that is not part of a closed vocabulary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    /// What was being parsed (plan, status, ...)
    pub kind: &'static str,
    /// The rejected input
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
