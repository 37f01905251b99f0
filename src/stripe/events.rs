//! Stripe Event Types
//!
//! The envelope is decoded eagerly, the event object lazily: each handler
//! asks for the typed view it needs through [`EventEnvelope::decode_object`],
//! and every view declares only the fields that handler reads. Unknown fields
//! are ignored so newer processor API versions keep decoding.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{InvoiceStatus, SubscriptionStatus};
use crate::stripe::error::{WebhookError, WebhookResult};

/// Stripe event types we handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `checkout.session.completed`
    CheckoutSessionCompleted,
    /// `customer.subscription.created`
    SubscriptionCreated,
    /// `customer.subscription.updated`
    SubscriptionUpdated,
    /// `customer.subscription.deleted`
    SubscriptionDeleted,
    /// `invoice.paid`
    InvoicePaid,
    /// `invoice.payment_failed`
    InvoicePaymentFailed,
    /// Any other type; logged and acknowledged
    Unhandled(String),
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            other => Self::Unhandled(other.to_string()),
        })
    }
}

impl EventKind {
    /// Classify a raw `type` string
    pub fn parse(s: &str) -> Self {
        match s.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }

    /// Get the string representation
    pub fn as_str(&self) -> &str {
        match self {
            Self::CheckoutSessionCompleted => "checkout.session.completed",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::Unhandled(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic Stripe event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for the event
    pub id: String,

    /// Type of event
    #[serde(rename = "type")]
    pub event_type: String,

    /// Time of event creation (Unix timestamp)
    #[serde(default)]
    pub created: i64,

    /// API version used to render data
    #[serde(default)]
    pub api_version: Option<String>,

    /// Whether this is a live mode event
    #[serde(default)]
    pub livemode: bool,

    /// Object containing event data
    pub data: EventData,
}

/// Event data container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// The event object, kept opaque until a handler decodes it
    pub object: serde_json::Value,
}

impl EventEnvelope {
    /// Parse from raw JSON bytes
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::InvalidPayload`] if the bytes are not an event envelope.
    pub fn from_bytes(bytes: &[u8]) -> WebhookResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| WebhookError::InvalidPayload(e.to_string()))
    }

    /// Get the typed event kind
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }

    /// Decode the event object into the view a handler needs
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if a required field is missing or mistyped.
    pub fn decode_object<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data.object)
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// An id that Stripe may send bare or expanded into its object
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

fn expandable_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Expandable::deserialize(deserializer).map(Expandable::into_id)
}

fn optional_expandable_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<Expandable>::deserialize(deserializer)?.map(Expandable::into_id))
}

/// Convert a processor unix timestamp; zero and negative mean "not set"
pub fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.filter(|s| *s > 0)
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
}

// =============================================================================
// Subscription view
// =============================================================================

/// The subscription fields reconciliation reads
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    /// Subscription ID (sub_...)
    pub id: String,
    /// Customer ID (cus_...)
    #[serde(deserialize_with = "expandable_id")]
    pub customer: String,
    /// Subscription status
    pub status: SubscriptionStatus,
    /// Whether subscription will cancel at period end
    #[serde(default)]
    pub cancel_at_period_end: bool,
    /// Metadata attached at checkout (`user_id`, `tenant`, `plan`)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Subscription items
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
    /// Period start on API versions that report it per subscription
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Period end on API versions that report it per subscription
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

/// Subscription items container
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    /// List of subscription items
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

/// Individual subscription item
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    /// Period start on API versions that report it per item
    #[serde(default)]
    pub current_period_start: Option<i64>,
    /// Period end on API versions that report it per item
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

impl SubscriptionObject {
    /// Metadata value, treating empty strings as absent
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Current billing period.
    ///
    /// Newer API versions put the period on the first item; older ones on the
    /// subscription itself. Either bound may be absent.
    pub fn current_period(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let first_item = self.items.as_ref().and_then(|items| items.data.first());
        let start = first_item
            .and_then(|item| item.current_period_start)
            .or(self.current_period_start);
        let end = first_item
            .and_then(|item| item.current_period_end)
            .or(self.current_period_end);
        (timestamp(start), timestamp(end))
    }
}

// =============================================================================
// Invoice view
// =============================================================================

/// The invoice fields reconciliation reads
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    /// Invoice ID (in_...)
    pub id: String,
    /// Legacy subscription link
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub subscription: Option<String>,
    /// Subscription link on newer API versions
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    /// Amount paid in minor units
    pub amount_paid: i64,
    /// Currency
    pub currency: String,
    /// Invoice status
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    /// Invoice PDF URL
    #[serde(default)]
    pub invoice_pdf: Option<String>,
    /// Hosted invoice URL
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    /// Period start
    #[serde(default)]
    pub period_start: Option<i64>,
    /// Period end
    #[serde(default)]
    pub period_end: Option<i64>,
}

/// What an invoice was issued for
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    /// Present when the invoice belongs to a subscription
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

/// Subscription reference inside an invoice parent
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    /// Subscription ID
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub subscription: Option<String>,
}

impl InvoiceObject {
    /// The subscription this invoice belongs to, if any
    pub fn subscription_id(&self) -> Option<&str> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
            .and_then(|d| d.subscription.as_deref())
            .or(self.subscription.as_deref())
            .filter(|id| !id.is_empty())
    }
}

// =============================================================================
// Checkout session view
// =============================================================================

/// The checkout session fields we log
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    /// Session ID (cs_...)
    pub id: String,
    /// Customer ID, once one exists
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub customer: Option<String>,
    /// Subscription created by the session, if any
    #[serde(default, deserialize_with = "optional_expandable_id")]
    pub subscription: Option<String>,
}
