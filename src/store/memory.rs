//! In-process store enforcing the same unique keys as the database schema.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{InvoiceStore, StoreError, StoreResult, SubscriptionStore};
use crate::models::{Invoice, NewInvoice, NewSubscription, Subscription};

/// Thread-safe in-memory implementation of both store traits.
///
/// Locks are never held across an `.await`, so `parking_lot` is enough.
#[derive(Debug, Default)]
pub struct MemoryStore {
    subscriptions: RwLock<Table<Subscription>>,
    invoices: RwLock<Table<Invoice>>,
}

#[derive(Debug)]
struct Table<T> {
    rows: BTreeMap<i64, T>,
    next_id: i64,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl<T> Table<T> {
    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscription rows
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().rows.len()
    }

    /// Number of invoice rows
    pub fn invoice_count(&self) -> usize {
        self.invoices.read().rows.len()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn create(&self, subscription: NewSubscription) -> StoreResult<Subscription> {
        let mut table = self.subscriptions.write();

        for existing in table.rows.values() {
            if existing.user_id == subscription.user_id && existing.tenant == subscription.tenant {
                return Err(StoreError::DuplicateKey {
                    entity: "subscription",
                    key: format!("{}/{}", subscription.user_id, subscription.tenant),
                });
            }
            if existing.stripe_subscription_id == subscription.stripe_subscription_id {
                return Err(StoreError::DuplicateKey {
                    entity: "subscription",
                    key: subscription.stripe_subscription_id.clone(),
                });
            }
        }

        let id = table.allocate_id();
        let row = subscription.into_subscription(id, Utc::now());
        table.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn get_by_user_tenant(
        &self,
        user_id: &str,
        tenant: &str,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .rows
            .values()
            .find(|s| s.user_id == user_id && s.tenant == tenant)
            .cloned())
    }

    async fn get_by_processor_id(
        &self,
        stripe_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        Ok(self
            .subscriptions
            .read()
            .rows
            .values()
            .find(|s| s.stripe_subscription_id == stripe_subscription_id)
            .cloned())
    }

    async fn update(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        let mut table = self.subscriptions.write();
        let stored = table
            .rows
            .get_mut(&subscription.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "subscription",
                key: subscription.stripe_subscription_id.clone(),
            })?;

        if stored.version != subscription.version {
            return Err(StoreError::Conflict {
                entity: "subscription",
                key: subscription.stripe_subscription_id.clone(),
                expected: subscription.version,
            });
        }

        stored.status = subscription.status;
        stored.plan = subscription.plan;
        stored.current_period_start = subscription.current_period_start;
        stored.current_period_end = subscription.current_period_end;
        stored.cancel_at_period_end = subscription.cancel_at_period_end;
        stored.version += 1;
        stored.updated_at = Utc::now();

        Ok(stored.clone())
    }
}

#[async_trait]
impl InvoiceStore for MemoryStore {
    async fn create(&self, invoice: NewInvoice) -> StoreResult<Invoice> {
        let mut table = self.invoices.write();

        if table
            .rows
            .values()
            .any(|i| i.stripe_invoice_id == invoice.stripe_invoice_id)
        {
            return Err(StoreError::DuplicateKey {
                entity: "invoice",
                key: invoice.stripe_invoice_id,
            });
        }

        let id = table.allocate_id();
        let row = invoice.into_invoice(id, Utc::now());
        table.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn get_by_processor_invoice_id(
        &self,
        stripe_invoice_id: &str,
    ) -> StoreResult<Option<Invoice>> {
        Ok(self
            .invoices
            .read()
            .rows
            .values()
            .find(|i| i.stripe_invoice_id == stripe_invoice_id)
            .cloned())
    }

    async fn list_for_user(&self, user_id: &str, tenant: &str) -> StoreResult<Vec<Invoice>> {
        // Ids are allocated monotonically, so reverse id order is newest first.
        Ok(self
            .invoices
            .read()
            .rows
            .values()
            .rev()
            .filter(|i| i.user_id == user_id && i.tenant == tenant)
            .cloned()
            .collect())
    }
}
