//! Webhook signature verification.
//!
//! Stripe signs `"{timestamp}.{raw body}"` with HMAC-SHA256 keyed by the
//! endpoint secret and sends the result in the `Stripe-Signature` header:
//!
//! ```text
//! t=1614556800,v1=5257a869e7ecebeda32affa62cdca3fa51cad7e77a0e56ff536d0ce8e108d8bd,v0=...
//! ```
//!
//! Several `v1` entries may be present while a secret is being rolled; any
//! one matching is enough. Verification runs on the exact bytes received,
//! before anything is parsed.

use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Default tolerance between the signed timestamp and now
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

/// Signature scheme we accept
const SCHEME: &str = "v1";

/// Why a signature was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Header is missing `t=` or has no `v1=` entry
    #[error("malformed signature header")]
    MalformedHeader,

    /// `t=` is not an integer
    #[error("invalid signature timestamp")]
    InvalidTimestamp,

    /// Timestamp is older than the tolerance window
    #[error("signature timestamp outside tolerance ({age_secs}s old)")]
    Expired {
        /// Age of the signature in seconds
        age_secs: i64,
    },

    /// No `v1` entry matched the expected signature
    #[error("no signature matches the payload")]
    Mismatch,
}

/// Verifies webhook payloads against a shared endpoint secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

struct ParsedHeader<'a> {
    timestamp: i64,
    signatures: Vec<&'a str>,
}

fn parse_header(header: &str) -> Result<ParsedHeader<'_>, SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::InvalidTimestamp)?,
                )
            }
            SCHEME => signatures.push(value),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !signatures.is_empty() => Ok(ParsedHeader {
            timestamp,
            signatures,
        }),
        _ => Err(SignatureError::MalformedHeader),
    }
}

impl SignatureVerifier {
    /// Create a verifier for `secret` with the default 5 minute tolerance
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Override the timestamp tolerance
    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Configured tolerance
    pub fn tolerance(&self) -> Duration {
        self.tolerance
    }

    /// Verify `payload` against `header` using the current time
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] describing why the payload is not trusted.
    pub fn verify(&self, payload: &[u8], header: &str) -> Result<(), SignatureError> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    /// Verify as if the current unix time were `now`
    ///
    /// # Errors
    ///
    /// Returns a [`SignatureError`] describing why the payload is not trusted.
    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), SignatureError> {
        let parsed = parse_header(header)?;

        let expected = hex::encode(self.compute(parsed.timestamp, payload));
        let matched = parsed
            .signatures
            .iter()
            .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));
        if !matched {
            return Err(SignatureError::Mismatch);
        }

        let age_secs = now.saturating_sub(parsed.timestamp);
        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if age_secs > tolerance {
            return Err(SignatureError::Expired { age_secs });
        }

        Ok(())
    }

    /// Produce a header value for `payload` signed at `timestamp`.
    ///
    /// Used by tests and local tooling that replay events.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        format!(
            "t={timestamp},{SCHEME}={}",
            hex::encode(self.compute(timestamp, payload))
        )
    }

    fn compute(&self, timestamp: i64, payload: &[u8]) -> Vec<u8> {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &[u8] = br#"{"id":"evt_1","type":"invoice.paid"}"#;
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_valid_signature_accepted() {
        let verifier = SignatureVerifier::new(SECRET);
        let header = verifier.sign(BODY, NOW);
        assert_eq!(verifier.verify_at(BODY, &header, NOW + 10), Ok(()));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let verifier = SignatureVerifier::new(SECRET);
        let header = verifier.sign(BODY, NOW);
        let tampered = br#"{"id":"evt_1","type":"invoice.paid "}"#;
        assert_eq!(
            verifier.verify_at(tampered, &header, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = SignatureVerifier::new("whsec_other").sign(BODY, NOW);
        let verifier = SignatureVerifier::new(SECRET);
        assert_eq!(
            verifier.verify_at(BODY, &header, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_expired_timestamp_rejected() {
        let verifier = SignatureVerifier::new(SECRET).with_tolerance(Duration::from_secs(60));
        let header = verifier.sign(BODY, NOW);
        assert_eq!(
            verifier.verify_at(BODY, &header, NOW + 61),
            Err(SignatureError::Expired { age_secs: 61 })
        );
        assert_eq!(verifier.verify_at(BODY, &header, NOW + 60), Ok(()));
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let verifier = SignatureVerifier::new(SECRET);
        let good = verifier.sign(BODY, NOW);
        let good_sig = good.split_once("v1=").unwrap().1;
        let header = format!("t={NOW},v1=deadbeef,v0=ignored,v1={good_sig}");
        assert_eq!(verifier.verify_at(BODY, &header, NOW), Ok(()));
    }

    #[test]
    fn test_malformed_headers() {
        let verifier = SignatureVerifier::new(SECRET);
        assert_eq!(
            verifier.verify_at(BODY, "garbage", NOW),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verifier.verify_at(BODY, "t=123", NOW),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verifier.verify_at(BODY, "v1=abc", NOW),
            Err(SignatureError::MalformedHeader)
        );
        assert_eq!(
            verifier.verify_at(BODY, "t=soon,v1=abc", NOW),
            Err(SignatureError::InvalidTimestamp)
        );
    }

    #[test]
    fn test_huge_tolerance_does_not_wrap() {
        let verifier =
            SignatureVerifier::new(SECRET).with_tolerance(Duration::from_secs(1 << 63));
        let header = verifier.sign(BODY, NOW);
        assert_eq!(verifier.verify_at(BODY, &header, NOW), Ok(()));
        assert_eq!(verifier.verify_at(BODY, &header, NOW + 86_400 * 365), Ok(()));
    }

    #[test]
    fn test_extreme_timestamp_does_not_overflow() {
        let verifier = SignatureVerifier::new(SECRET);
        let header = verifier.sign(BODY, i64::MIN);
        assert_eq!(
            verifier.verify_at(BODY, &header, NOW),
            Err(SignatureError::Expired { age_secs: i64::MAX })
        );
    }

    #[test]
    fn test_debug_redacts_secret() {
        let verifier = SignatureVerifier::new(SECRET);
        let debug = format!("{verifier:?}");
        assert!(!debug.contains(SECRET));
        assert!(debug.contains("redacted"));
    }
}
