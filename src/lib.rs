//! Billing Sync - Stripe Webhook Reconciliation Service
//!
//! This crate keeps a local subscription and invoice store in step with
//! Stripe and tells the backend that owns user accounts whenever a
//! subscription changes.
//!
//! # Features
//!
//! - **Webhook Ingestion**: signature-verified, lazily-decoded Stripe events
//! - **Reconciliation**: idempotent create / update / cancel / invoice transitions
//! - **Backend Notifications**: best-effort change notifications with a bounded timeout
//! - **Administration**: cancel and reactivate through Stripe, then the store
//!
//! # Architecture
//!
//! ```text
//! Stripe ──▶ POST /payments/webhook ──▶ SignatureVerifier ──▶ EventEnvelope
//!                                                                  │
//!                                                                  ▼
//!                  ┌──────────────────────────────── ReconciliationEngine
//!                  │                                        │
//!                  ▼                                        ▼
//!          SubscriptionStore / InvoiceStore        NotificationForwarder ──▶ Backend
//!                  ▲
//!                  │
//! Admin ──▶ /payments/{cancel,reactivate} ──▶ SubscriptionAdmin ──▶ StripeGateway
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use billing_sync::app::{build_router, Stores};
//! use billing_sync::config::ServiceConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServiceConfig::from_env()?;
//!     let stores = Stores::open(&config).await?;
//!     let app = build_router(&config, stores)?;
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_addr()).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod admin;
pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notify;
pub mod store;
pub mod stripe;

// Re-exports for convenience
pub use admin::{AdminError, SubscriptionAdmin};
pub use config::{ConfigError, ServiceConfig};
pub use error::{Error, ErrorResponse, Result};
pub use notify::{NotificationForwarder, NotifyOutcome, SubscriptionChange, SubscriptionNotifier};
pub use store::{InvoiceStore, MemoryStore, PostgresStore, StoreError, SubscriptionStore};
pub use stripe::{EventEnvelope, EventKind, ReconciliationEngine, SignatureVerifier};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
