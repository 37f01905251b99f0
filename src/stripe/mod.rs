//! Stripe integration
//!
//! Inbound webhook ingestion and the outbound calls administrative actions
//! need:
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw body, checked against
//!   the `Stripe-Signature` header before anything is parsed
//! - **Event Decoding**: a thin envelope plus per-handler views of `data.object`
//! - **Reconciliation**: applies subscription and invoice events to the store
//! - **Gateway**: schedules or clears cancellation at Stripe
//!
//! # Architecture
//!
//! ```text
//! Request -> Signature Verify -> Decode Envelope -> Reconcile -> Ack (200)
//!                   |                  |                |
//!                   v                  v                v
//!                  400                400        Store + Notify
//! ```

pub mod error;
pub mod events;
pub mod gateway;
pub mod handler;
pub mod processor;
pub mod signature;

pub use error::{ReconcileError, WebhookError, WebhookResult};
pub use events::{EventEnvelope, EventKind};
pub use gateway::{GatewayError, GatewaySubscription, PaymentGateway, StripeGateway};
pub use handler::{stripe_webhook_handler, stripe_webhook_router, WebhookState};
pub use processor::{Outcome, ReconciliationEngine};
pub use signature::{SignatureError, SignatureVerifier};
