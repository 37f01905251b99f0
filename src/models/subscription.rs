//! Subscription record and its closed vocabularies.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::UnknownVariant;

/// Subscription status, mirroring the processor's vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Trialing,
    Unpaid,
}

impl SubscriptionStatus {
    /// Get the wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::PastDue => "past_due",
            Self::Trialing => "trialing",
            Self::Unpaid => "unpaid",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => Self::Active,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "past_due" => Self::PastDue,
            "trialing" => Self::Trialing,
            "unpaid" => Self::Unpaid,
            other => return Err(UnknownVariant::new("subscription status", other)),
        })
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    PremiumMonthly,
    PremiumYearly,
}

impl Plan {
    /// Every plan that can be sold
    pub const ALL: [Plan; 2] = [Plan::PremiumMonthly, Plan::PremiumYearly];

    /// Get the wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PremiumMonthly => "premium_monthly",
            Self::PremiumYearly => "premium_yearly",
        }
    }
}

impl FromStr for Plan {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Plan::ALL
            .into_iter()
            .find(|plan| plan.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("plan", s))
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted subscription.
///
/// Unique per `(user_id, tenant)` and per `stripe_subscription_id`.
/// `version` is bumped by the store on every successful update and is the
/// token for conditional writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: String,
    pub tenant: String,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub plan: Plan,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    #[serde(skip)]
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether a cancellation has been scheduled but has not taken effect
    pub fn is_pending_cancellation(&self) -> bool {
        self.status == SubscriptionStatus::Active && self.cancel_at_period_end
    }
}

/// Fields required to insert a subscription; the store assigns the rest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: String,
    pub tenant: String,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: String,
    pub status: SubscriptionStatus,
    pub plan: Plan,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

impl NewSubscription {
    /// Materialize the row a store would hold for this insert
    pub(crate) fn into_subscription(self, id: i64, now: DateTime<Utc>) -> Subscription {
        Subscription {
            id,
            user_id: self.user_id,
            tenant: self.tenant,
            stripe_customer_id: self.stripe_customer_id,
            stripe_subscription_id: self.stripe_subscription_id,
            status: self.status,
            plan: self.plan,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_wire_names() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Unpaid,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_unknown_status_rejected() {
        let err = "paused".parse::<SubscriptionStatus>().unwrap_err();
        assert_eq!(err.to_string(), "unknown subscription status: paused");
    }

    #[test]
    fn test_plan_catalog() {
        assert_eq!("premium_monthly".parse::<Plan>(), Ok(Plan::PremiumMonthly));
        assert_eq!("premium_yearly".parse::<Plan>(), Ok(Plan::PremiumYearly));
        assert!("premium_weekly".parse::<Plan>().is_err());
        assert!("".parse::<Plan>().is_err());
    }

    #[test]
    fn test_pending_cancellation_requires_active() {
        let mut sub = NewSubscription {
            user_id: "u1".to_string(),
            tenant: "t1".to_string(),
            stripe_customer_id: "cus_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Active,
            plan: Plan::PremiumMonthly,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: true,
        }
        .into_subscription(1, Utc::now());

        assert!(sub.is_pending_cancellation());
        sub.status = SubscriptionStatus::Canceled;
        assert!(!sub.is_pending_cancellation());
    }

    #[test]
    fn test_subscription_json_omits_absent_periods() {
        let sub = NewSubscription {
            user_id: "u1".to_string(),
            tenant: "t1".to_string(),
            stripe_customer_id: "cus_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Trialing,
            plan: Plan::PremiumYearly,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
        .into_subscription(7, Utc::now());

        let json = serde_json::to_value(&sub).unwrap();
        assert_eq!(json["status"], "trialing");
        assert_eq!(json["plan"], "premium_yearly");
        assert!(json.get("current_period_start").is_none());
        assert!(json.get("version").is_none());
    }
}
