//! PostgreSQL store.
//!
//! Unique keys live in the schema (`migrations/`), so concurrent duplicate
//! deliveries are settled by the database rather than by the caller.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use super::{InvoiceStore, StoreError, StoreResult, SubscriptionStore};
use crate::models::{Invoice, NewInvoice, NewSubscription, Subscription};

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, tenant, stripe_customer_id, \
    stripe_subscription_id, status, plan, current_period_start, current_period_end, \
    cancel_at_period_end, version, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, subscription_id, stripe_invoice_id, user_id, tenant, \
    amount_paid, currency, status, invoice_pdf, hosted_invoice_url, period_start, \
    period_end, created_at";

/// Store backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection cannot be established.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(backend)?;

        tracing::info!("Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
        Ok(())
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn insert_error(err: sqlx::Error, entity: &'static str, key: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::DuplicateKey {
                entity,
                key: key.to_string(),
            };
        }
    }
    backend(err)
}

fn parse_column<T: std::str::FromStr>(row: &PgRow, column: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column).map_err(backend)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Backend(format!("column {column}: {e}")))
}

fn row_to_subscription(row: &PgRow) -> StoreResult<Subscription> {
    Ok(Subscription {
        id: row.try_get("id").map_err(backend)?,
        user_id: row.try_get("user_id").map_err(backend)?,
        tenant: row.try_get("tenant").map_err(backend)?,
        stripe_customer_id: row.try_get("stripe_customer_id").map_err(backend)?,
        stripe_subscription_id: row.try_get("stripe_subscription_id").map_err(backend)?,
        status: parse_column(row, "status")?,
        plan: parse_column(row, "plan")?,
        current_period_start: row.try_get("current_period_start").map_err(backend)?,
        current_period_end: row.try_get("current_period_end").map_err(backend)?,
        cancel_at_period_end: row.try_get("cancel_at_period_end").map_err(backend)?,
        version: row.try_get("version").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
    })
}

fn row_to_invoice(row: &PgRow) -> StoreResult<Invoice> {
    Ok(Invoice {
        id: row.try_get("id").map_err(backend)?,
        subscription_id: row.try_get("subscription_id").map_err(backend)?,
        stripe_invoice_id: row.try_get("stripe_invoice_id").map_err(backend)?,
        user_id: row.try_get("user_id").map_err(backend)?,
        tenant: row.try_get("tenant").map_err(backend)?,
        amount_paid: row.try_get("amount_paid").map_err(backend)?,
        currency: row.try_get("currency").map_err(backend)?,
        status: parse_column(row, "status")?,
        invoice_pdf: row.try_get("invoice_pdf").map_err(backend)?,
        hosted_invoice_url: row.try_get("hosted_invoice_url").map_err(backend)?,
        period_start: row.try_get("period_start").map_err(backend)?,
        period_end: row.try_get("period_end").map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

#[async_trait]
impl SubscriptionStore for PostgresStore {
    async fn create(&self, subscription: NewSubscription) -> StoreResult<Subscription> {
        let query = format!(
            "INSERT INTO subscriptions (
                user_id, tenant, stripe_customer_id, stripe_subscription_id,
                status, plan, current_period_start, current_period_end, cancel_at_period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {SUBSCRIPTION_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(&subscription.user_id)
            .bind(&subscription.tenant)
            .bind(&subscription.stripe_customer_id)
            .bind(&subscription.stripe_subscription_id)
            .bind(subscription.status.as_str())
            .bind(subscription.plan.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.cancel_at_period_end)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| insert_error(e, "subscription", &subscription.stripe_subscription_id))?;

        row_to_subscription(&row)
    }

    async fn get_by_user_tenant(
        &self,
        user_id: &str,
        tenant: &str,
    ) -> StoreResult<Option<Subscription>> {
        let query =
            format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE user_id = $1 AND tenant = $2");

        sqlx::query(&query)
            .bind(user_id)
            .bind(tenant)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .as_ref()
            .map(row_to_subscription)
            .transpose()
    }

    async fn get_by_processor_id(
        &self,
        stripe_subscription_id: &str,
    ) -> StoreResult<Option<Subscription>> {
        let query = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        );

        sqlx::query(&query)
            .bind(stripe_subscription_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .as_ref()
            .map(row_to_subscription)
            .transpose()
    }

    async fn update(&self, subscription: &Subscription) -> StoreResult<Subscription> {
        let query = format!(
            "UPDATE subscriptions
            SET status = $1, plan = $2, current_period_start = $3, current_period_end = $4,
                cancel_at_period_end = $5, version = version + 1, updated_at = NOW()
            WHERE id = $6 AND version = $7
            RETURNING {SUBSCRIPTION_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(subscription.status.as_str())
            .bind(subscription.plan.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.cancel_at_period_end)
            .bind(subscription.id)
            .bind(subscription.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        if let Some(row) = row {
            return row_to_subscription(&row);
        }

        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM subscriptions WHERE id = $1)")
                .bind(subscription.id)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)?;

        if exists {
            Err(StoreError::Conflict {
                entity: "subscription",
                key: subscription.stripe_subscription_id.clone(),
                expected: subscription.version,
            })
        } else {
            Err(StoreError::NotFound {
                entity: "subscription",
                key: subscription.stripe_subscription_id.clone(),
            })
        }
    }
}

#[async_trait]
impl InvoiceStore for PostgresStore {
    async fn create(&self, invoice: NewInvoice) -> StoreResult<Invoice> {
        let query = format!(
            "INSERT INTO invoices (
                subscription_id, stripe_invoice_id, user_id, tenant, amount_paid, currency,
                status, invoice_pdf, hosted_invoice_url, period_start, period_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING {INVOICE_COLUMNS}"
        );

        let row = sqlx::query(&query)
            .bind(invoice.subscription_id)
            .bind(&invoice.stripe_invoice_id)
            .bind(&invoice.user_id)
            .bind(&invoice.tenant)
            .bind(invoice.amount_paid)
            .bind(&invoice.currency)
            .bind(invoice.status.as_str())
            .bind(&invoice.invoice_pdf)
            .bind(&invoice.hosted_invoice_url)
            .bind(invoice.period_start)
            .bind(invoice.period_end)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| insert_error(e, "invoice", &invoice.stripe_invoice_id))?;

        row_to_invoice(&row)
    }

    async fn get_by_processor_invoice_id(
        &self,
        stripe_invoice_id: &str,
    ) -> StoreResult<Option<Invoice>> {
        let query = format!("SELECT {INVOICE_COLUMNS} FROM invoices WHERE stripe_invoice_id = $1");

        sqlx::query(&query)
            .bind(stripe_invoice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .as_ref()
            .map(row_to_invoice)
            .transpose()
    }

    async fn list_for_user(&self, user_id: &str, tenant: &str) -> StoreResult<Vec<Invoice>> {
        let query = format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices
            WHERE user_id = $1 AND tenant = $2
            ORDER BY created_at DESC, id DESC"
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .bind(tenant)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter().map(row_to_invoice).collect()
    }
}
