//! Invoice record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UnknownVariant;

/// Invoice status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

impl InvoiceStatus {
    /// Get the wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Open => "open",
            Self::Paid => "paid",
            Self::Uncollectible => "uncollectible",
            Self::Void => "void",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "draft" => Self::Draft,
            "open" => Self::Open,
            "paid" => Self::Paid,
            "uncollectible" => Self::Uncollectible,
            "void" => Self::Void,
            other => return Err(UnknownVariant::new("invoice status", other)),
        })
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted invoice, at most one per `stripe_invoice_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    /// Surrogate id of the owning subscription
    pub subscription_id: i64,
    pub stripe_invoice_id: String,
    pub user_id: String,
    pub tenant: String,
    /// Minor currency units
    pub amount_paid: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_pdf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosted_invoice_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields required to insert an invoice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub subscription_id: i64,
    pub stripe_invoice_id: String,
    pub user_id: String,
    pub tenant: String,
    pub amount_paid: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub invoice_pdf: Option<String>,
    pub hosted_invoice_url: Option<String>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

impl NewInvoice {
    pub(crate) fn into_invoice(self, id: i64, now: DateTime<Utc>) -> Invoice {
        Invoice {
            id,
            subscription_id: self.subscription_id,
            stripe_invoice_id: self.stripe_invoice_id,
            user_id: self.user_id,
            tenant: self.tenant,
            amount_paid: self.amount_paid,
            currency: self.currency,
            status: self.status,
            invoice_pdf: self.invoice_pdf,
            hosted_invoice_url: self.hosted_invoice_url,
            period_start: self.period_start,
            period_end: self.period_end,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoice_status_parsing() {
        assert_eq!("paid".parse::<InvoiceStatus>(), Ok(InvoiceStatus::Paid));
        assert_eq!("void".parse::<InvoiceStatus>(), Ok(InvoiceStatus::Void));
        assert!("refunded".parse::<InvoiceStatus>().is_err());
    }
}
