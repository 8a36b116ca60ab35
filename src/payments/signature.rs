//! Webhook signature verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac-sha256(secret, "<t>.<raw body>")>`.
//! Several `v1` entries may be present while a secret is being rotated.

use crate::payments::error::GatewayError;
use crate::payments::utils::{hmac_sha256_hex, secure_eq};
use chrono::Utc;
use std::time::Duration;

pub const SIGNATURE_HEADER: &str = "gateway-signature";
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(300);

#[derive(Clone)]
enum Mode {
    Enforcing { secret: String },
    #[cfg(any(test, feature = "unverified-webhooks"))]
    Disabled,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    mode: Mode,
    tolerance: Duration,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("enforcing", &self.is_enforcing())
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Result<Self, GatewayError> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(GatewayError::Validation {
                message: "webhook secret must not be empty".to_string(),
                field: Some("GATEWAY_WEBHOOK_SECRET".to_string()),
            });
        }
        Ok(Self {
            mode: Mode::Enforcing { secret },
            tolerance,
        })
    }

    /// Accepts every payload. Only compiled for tests or with the
    /// `unverified-webhooks` feature, and refused by the binary in production.
    #[cfg(any(test, feature = "unverified-webhooks"))]
    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn is_enforcing(&self) -> bool {
        matches!(self.mode, Mode::Enforcing { .. })
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> Result<(), GatewayError> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), GatewayError> {
        let secret = match &self.mode {
            Mode::Enforcing { secret } => secret,
            #[cfg(any(test, feature = "unverified-webhooks"))]
            Mode::Disabled => return Ok(()),
        };

        let parsed = ParsedHeader::parse(header)?;
        let age = (now - parsed.timestamp).unsigned_abs();
        if age > self.tolerance.as_secs() {
            return Err(GatewayError::WebhookVerification {
                message: format!("timestamp outside tolerance ({}s)", age),
            });
        }

        let expected = signature_for(secret, parsed.timestamp, payload)?;
        if parsed
            .signatures
            .iter()
            .any(|candidate| secure_eq(expected.as_bytes(), candidate.as_bytes()))
        {
            Ok(())
        } else {
            Err(GatewayError::WebhookVerification {
                message: "signature mismatch".to_string(),
            })
        }
    }
}

/// Hex signature for `payload` signed at `timestamp`.
pub fn signature_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, GatewayError> {
    let mut signed = Vec::with_capacity(payload.len() + 12);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(payload);
    hmac_sha256_hex(secret, &signed).ok_or_else(|| GatewayError::WebhookVerification {
        message: "invalid signing key".to_string(),
    })
}

/// Full header value for `payload`, as the gateway would send it.
pub fn sign_header(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, GatewayError> {
    Ok(format!("t={},v1={}", timestamp, signature_for(secret, timestamp, payload)?))
}

struct ParsedHeader {
    timestamp: i64,
    signatures: Vec<String>,
}

impl ParsedHeader {
    fn parse(header: &str) -> Result<Self, GatewayError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| GatewayError::WebhookVerification {
            message: "missing or invalid timestamp".to_string(),
        })?;
        if signatures.is_empty() {
            return Err(GatewayError::WebhookVerification {
                message: "missing v1 signature".to_string(),
            });
        }
        Ok(Self {
            timestamp,
            signatures,
        })
    }
}
