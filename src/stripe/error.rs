//! Errors for webhook ingestion and reconciliation.
//!
//! Only [`WebhookError`] ever reaches the processor as an HTTP error. Once a
//! delivery is authenticated, a [`ReconcileError`] is logged and the delivery
//! is still acknowledged.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::error::ErrorResponse;
use crate::store::StoreError;
use crate::stripe::signature::SignatureError;

/// Failures that reject an inbound delivery
#[derive(Error, Debug)]
pub enum WebhookError {
    /// No `Stripe-Signature` header
    #[error("Missing Stripe-Signature header")]
    MissingSignature,

    /// Signature did not verify
    #[error("Invalid signature")]
    InvalidSignature(#[source] SignatureError),

    /// Body verified but is not an event envelope
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl WebhookError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

/// Result type for webhook ingestion
pub type WebhookResult<T> = std::result::Result<T, WebhookError>;

/// Failures while reconciling one authenticated event
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// The event object did not decode into the view its handler needs
    #[error("failed to decode {kind} object: {source}")]
    Decode {
        /// Event type being handled
        kind: String,
        /// Underlying decode error
        #[source]
        source: serde_json::Error,
    },

    /// A required field is missing or outside its vocabulary
    #[error("validation failed: {0}")]
    Validation(String),

    /// The store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Processing exceeded the configured bound
    #[error("processing timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ReconcileError {
    /// Short label used for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Self::Decode { .. } => "decode",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
            Self::Timeout(_) => "timeout",
        }
    }
}
