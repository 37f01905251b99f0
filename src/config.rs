//! Service configuration
//!
//! All settings come from environment variables:
//!
//! - `STRIPE_SECRET_KEY` (required): API key for outbound Stripe calls
//! - `STRIPE_WEBHOOK_SECRET` (required): webhook signing secret
//! - `BACKEND_WEBHOOK_URL` (required): base URL notifications are posted under
//! - `DATABASE_URL` (optional): PostgreSQL URL; in-memory store when unset
//! - `PORT` (default 8081), `BIND_ADDR` (default 0.0.0.0)
//! - `STRIPE_API_BASE` (default `https://api.stripe.com`)
//! - `WEBHOOK_TOLERANCE_SECS` (300), `NOTIFY_TIMEOUT_SECS` (10),
//!   `GATEWAY_TIMEOUT_SECS` (30), `PROCESSING_TIMEOUT_SECS` (30)
//!
//! Secrets are never printed; `Debug` redacts them.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::notify::DEFAULT_NOTIFY_TIMEOUT;
use crate::stripe::gateway::{DEFAULT_API_BASE, DEFAULT_GATEWAY_TIMEOUT};
use crate::stripe::processor::DEFAULT_PROCESSING_TIMEOUT;
use crate::stripe::signature::DEFAULT_TOLERANCE;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8081;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    /// A variable is set but empty
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A numeric variable did not parse
    #[error("invalid {var}: {value:?} is not a valid {expected}")]
    InvalidNumber {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// What was expected
        expected: &'static str,
    },

    /// A timeout was configured as zero
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// A URL variable did not parse or is not http(s)
    #[error("invalid {var}: {reason}")]
    InvalidUrl {
        /// Variable name
        var: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The bind address did not parse
    #[error("invalid BIND_ADDR: {0:?}")]
    InvalidBindAddr(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Service configuration
#[derive(Clone)]
pub struct ServiceConfig {
    /// Listen address
    pub bind_addr: IpAddr,
    /// Listen port
    pub port: u16,
    /// PostgreSQL URL, if any
    pub database_url: Option<String>,
    /// Stripe API key
    pub stripe_secret_key: String,
    /// Stripe webhook signing secret
    pub stripe_webhook_secret: String,
    /// Notification base URL
    pub backend_webhook_url: Url,
    /// Stripe API base URL
    pub stripe_api_base: Url,
    /// Signature timestamp tolerance
    pub webhook_tolerance: Duration,
    /// Notification request timeout
    pub notify_timeout: Duration,
    /// Gateway request timeout
    pub gateway_timeout: Duration,
    /// Bound on reconciling one event
    pub processing_timeout: Duration,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("bind_addr", &self.bind_addr)
            .field("port", &self.port)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "<redacted>"),
            )
            .field("stripe_secret_key", &"<redacted>")
            .field("stripe_webhook_secret", &"<redacted>")
            .field("backend_webhook_url", &self.backend_webhook_url.as_str())
            .field("stripe_api_base", &self.stripe_api_base.as_str())
            .field("webhook_tolerance", &self.webhook_tolerance)
            .field("notify_timeout", &self.notify_timeout)
            .field("gateway_timeout", &self.gateway_timeout)
            .field("processing_timeout", &self.processing_timeout)
            .finish()
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing required variables or invalid values.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing required variables or invalid values.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let stripe_secret_key = vars.required("STRIPE_SECRET_KEY")?;
        let stripe_webhook_secret = vars.required("STRIPE_WEBHOOK_SECRET")?;
        let backend_webhook_url =
            parse_url("BACKEND_WEBHOOK_URL", &vars.required("BACKEND_WEBHOOK_URL")?)?;

        let stripe_api_base = match vars.optional("STRIPE_API_BASE") {
            Some(raw) => parse_url("STRIPE_API_BASE", &raw)?,
            None => parse_url("STRIPE_API_BASE", DEFAULT_API_BASE)?,
        };

        let database_url = vars.optional("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set, using in-memory store; data will not survive a restart");
        }

        let port = match vars.optional("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidNumber {
                var: "PORT",
                value: raw,
                expected: "port number",
            })?,
            None => DEFAULT_PORT,
        };

        let bind_addr = match vars.optional("BIND_ADDR") {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(raw))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let config = Self {
            bind_addr,
            port,
            database_url,
            stripe_secret_key,
            stripe_webhook_secret,
            backend_webhook_url,
            stripe_api_base,
            webhook_tolerance: vars.seconds("WEBHOOK_TOLERANCE_SECS", DEFAULT_TOLERANCE)?,
            notify_timeout: vars.seconds("NOTIFY_TIMEOUT_SECS", DEFAULT_NOTIFY_TIMEOUT)?,
            gateway_timeout: vars.seconds("GATEWAY_TIMEOUT_SECS", DEFAULT_GATEWAY_TIMEOUT)?,
            processing_timeout: vars.seconds("PROCESSING_TIMEOUT_SECS", DEFAULT_PROCESSING_TIMEOUT)?,
        };

        info!(
            bind_addr = %config.bind_addr,
            port = config.port,
            backend = %config.backend_webhook_url,
            persistent = config.database_url.is_some(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Socket address to listen on
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> ConfigResult<String> {
        match (self.0)(key) {
            None => Err(ConfigError::Missing(key)),
            Some(v) if v.trim().is_empty() => Err(ConfigError::Empty(key)),
            Some(v) => Ok(v.trim().to_string()),
        }
    }

    fn seconds(&self, key: &'static str, default: Duration) -> ConfigResult<Duration> {
        let Some(raw) = self.optional(key) else {
            return Ok(default);
        };
        let secs = raw.parse::<u64>().map_err(|_| ConfigError::InvalidNumber {
            var: key,
            value: raw,
            expected: "number of seconds",
        })?;
        if secs == 0 {
            return Err(ConfigError::ZeroTimeout(key));
        }
        Ok(Duration::from_secs(secs))
    }
}

fn parse_url(var: &'static str, raw: &str) -> ConfigResult<Url> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        var,
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::InvalidUrl {
            var,
            reason: format!("unsupported scheme {other:?}"),
        }),
    }
}
