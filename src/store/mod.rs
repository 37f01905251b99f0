//! Persistence collaborators for subscriptions and invoices.
//!
//! The reconciliation engine never coordinates concurrent deliveries in
//! memory; every single-insert and single-writer guarantee is delegated to
//! the store:
//!
//! - `(user_id, tenant)`, `stripe_subscription_id` and `stripe_invoice_id`
//!   are unique keys. A second insert fails with [`StoreError::DuplicateKey`].
//! - [`SubscriptionStore::update`] is a conditional write on
//!   [`Subscription::version`]. A stale caller gets [`StoreError::Conflict`]
//!   and must re-read before trying again.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! database-less runs, and [`PostgresStore`] backed by `sqlx`.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Invoice, NewInvoice, NewSubscription, Subscription};

/// Store failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique key is already taken
    #[error("duplicate {entity}: {key}")]
    DuplicateKey {
        /// Record type
        entity: &'static str,
        /// The conflicting key
        key: String,
    },

    /// The addressed row does not exist
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Record type
        entity: &'static str,
        /// The key that was looked up
        key: String,
    },

    /// The row changed since it was read
    #[error("{entity} {key} was modified concurrently (expected version {expected})")]
    Conflict {
        /// Record type
        entity: &'static str,
        /// The row key
        key: String,
        /// Version the caller based its write on
        expected: i64,
    },

    /// Anything the backend reports that is not one of the above
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether this is a unique-key collision
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Subscription persistence
#[async_trait]
pub trait SubscriptionStore: Send + Sync + 'static {
    /// Insert a new subscription and return the stored row
    async fn create(&self, subscription: NewSubscription) -> StoreResult<Subscription>;

    /// Look up by natural key
    async fn get_by_user_tenant(
        &self,
        user_id: &str,
        tenant: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// Look up by the processor's subscription id
    async fn get_by_processor_id(
        &self,
        stripe_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>>;

    /// Overwrite the mutable fields of `subscription` if its `version` still
    /// matches the stored row; returns the row with its new version
    async fn update(&self, subscription: &Subscription) -> StoreResult<Subscription>;
}

/// Invoice persistence
#[async_trait]
pub trait InvoiceStore: Send + Sync + 'static {
    /// Insert a new invoice and return the stored row
    async fn create(&self, invoice: NewInvoice) -> StoreResult<Invoice>;

    /// Look up by the processor's invoice id
    async fn get_by_processor_invoice_id(
        &self,
        stripe_invoice_id: &str,
    ) -> StoreResult<Option<Invoice>>;

    /// All invoices for a user within a tenant, newest first
    async fn list_for_user(&self, user_id: &str, tenant: &str) -> StoreResult<Vec<Invoice>>;
}

/// Attempts made by [`modify_subscription`] before giving up on a conflict
pub const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Apply `change` to `current` and write it back, re-reading and re-applying
/// when another writer got there first.
///
/// `change` must be idempotent: it runs once per attempt against the freshest
/// row. After [`MAX_UPDATE_ATTEMPTS`] conflicts the last
/// [`StoreError::Conflict`] is returned.
pub async fn modify_subscription<F>(
    store: &dyn SubscriptionStore,
    mut current: Subscription,
    change: F,
) -> StoreResult<Subscription>
where
    F: Fn(&mut Subscription) + Send + Sync,
{
    let mut attempt = 1;
    loop {
        change(&mut current);
        match store.update(&current).await {
            Ok(saved) => return Ok(saved),
            Err(StoreError::Conflict { .. }) if attempt < MAX_UPDATE_ATTEMPTS => {
                attempt += 1;
                tracing::debug!(
                    subscription_id = %current.stripe_subscription_id,
                    attempt,
                    "Subscription changed concurrently, retrying update"
                );
                let key = current.stripe_subscription_id.clone();
                current = store
                    .get_by_processor_id(&key)
                    .await?
                    .ok_or(StoreError::NotFound {
                        entity: "subscription",
                        key,
                    })?;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Plan, SubscriptionStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_store_error_display() {
        let err = StoreError::DuplicateKey {
            entity: "invoice",
            key: "in_1".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate invoice: in_1");
        assert!(err.is_duplicate());

        let err = StoreError::Conflict {
            entity: "subscription",
            key: "sub_1".to_string(),
            expected: 3,
        };
        assert!(err.to_string().contains("expected version 3"));
        assert!(!err.is_duplicate());
    }

    fn new_subscription() -> NewSubscription {
        NewSubscription {
            user_id: "u1".to_string(),
            tenant: "t1".to_string(),
            stripe_customer_id: "cus_1".to_string(),
            stripe_subscription_id: "sub_1".to_string(),
            status: SubscriptionStatus::Active,
            plan: Plan::PremiumMonthly,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    #[tokio::test]
    async fn test_modify_reapplies_after_conflict() {
        let store = MemoryStore::new();
        let stale = SubscriptionStore::create(&store, new_subscription())
            .await
            .unwrap();

        // Another writer bumps the version first
        let mut concurrent = stale.clone();
        concurrent.status = SubscriptionStatus::PastDue;
        store.update(&concurrent).await.unwrap();

        let saved = modify_subscription(&store, stale, |s| s.cancel_at_period_end = true)
            .await
            .unwrap();

        assert!(saved.cancel_at_period_end);
        assert_eq!(saved.status, SubscriptionStatus::PastDue);
        assert_eq!(saved.version, 3);
    }

    /// Store whose every update loses the race
    struct ContendedStore {
        row: Subscription,
        updates: AtomicU32,
    }

    #[async_trait]
    impl SubscriptionStore for ContendedStore {
        async fn create(&self, _subscription: NewSubscription) -> StoreResult<Subscription> {
            Ok(self.row.clone())
        }

        async fn get_by_user_tenant(
            &self,
            _user_id: &str,
            _tenant: &str,
        ) -> StoreResult<Option<Subscription>> {
            Ok(Some(self.row.clone()))
        }

        async fn get_by_processor_id(&self, _id: &str) -> StoreResult<Option<Subscription>> {
            Ok(Some(self.row.clone()))
        }

        async fn update(&self, subscription: &Subscription) -> StoreResult<Subscription> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Conflict {
                entity: "subscription",
                key: subscription.stripe_subscription_id.clone(),
                expected: subscription.version,
            })
        }
    }

    #[tokio::test]
    async fn test_modify_gives_up_after_max_attempts() {
        let row = new_subscription().into_subscription(1, chrono::Utc::now());
        let store = ContendedStore {
            row: row.clone(),
            updates: AtomicU32::new(0),
        };

        let err = modify_subscription(&store, row, |s| s.cancel_at_period_end = true)
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.updates.load(Ordering::SeqCst), MAX_UPDATE_ATTEMPTS);
    }
}
