//! Error types for the billing sync service
//!
//! Each layer owns a `thiserror` enum (`ConfigError`, `StoreError`,
//! `SignatureError`, `WebhookError`, `ReconcileError`, `GatewayError`,
//! `AdminError`). [`Error`] gathers the ones that can stop the service from
//! starting; request-time errors render as [`ErrorResponse`] bodies instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::notify::NotifyError;
use crate::store::StoreError;
use crate::stripe::gateway::GatewayError;

/// Startup and wiring errors
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Store could not be opened or migrated
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Notification forwarder could not be built
    #[error("Notifier error: {0}")]
    Notify(#[from] NotifyError),

    /// Payment gateway client could not be built
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// I/O errors (binding the listener, serving)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for service startup
pub type Result<T> = std::result::Result<T, Error>;

/// JSON body of every HTTP error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable message
    pub error: String,
}

impl ErrorResponse {
    /// Create an error body
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
