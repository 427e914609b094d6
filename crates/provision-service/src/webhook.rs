//! Signed checkout webhooks.
//!
//! The gateway signs `"{t}.{raw_body}"` with HMAC-SHA256 and sends
//! `t=<unix seconds>,v1=<hex digest>` in [`SIGNATURE_HEADER`].

use hmac::{Hmac, Mac};
use provision_core::{CheckoutEvent, PaymentStatus};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-checkout-signature";
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header")]
    MalformedSignature,
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("signature mismatch")]
    SignatureMismatch,
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn with_tolerance(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    fn mac(&self, timestamp: i64, body: &[u8]) -> Result<HmacSha256, WebhookError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| WebhookError::SignatureMismatch)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        Ok(mac)
    }

    /// Header value a sender would attach for `body` at `timestamp`.
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> String {
        match self.mac(timestamp, body) {
            Ok(mac) => format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes())),
            Err(_) => format!("t={timestamp},v1="),
        }
    }

    pub fn verify(&self, header: Option<&str>, body: &[u8], now: i64) -> Result<(), WebhookError> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or(WebhookError::MissingSignature)?;

        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| WebhookError::MalformedSignature)?,
                    );
                }
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(WebhookError::MalformedSignature)?;
        if signatures.is_empty() {
            return Err(WebhookError::MalformedSignature);
        }
        // Extreme timestamps overflow the subtraction; treat them as stale.
        let skew = now
            .checked_sub(timestamp)
            .map(i64::unsigned_abs)
            .ok_or(WebhookError::StaleTimestamp)?;
        if skew > self.tolerance_secs.max(0) as u64 {
            return Err(WebhookError::StaleTimestamp);
        }

        // Any one matching v1 entry is accepted during secret rotation.
        for candidate in signatures {
            let Ok(expected) = hex::decode(candidate) else {
                continue;
            };
            if self.mac(timestamp, body)?.verify_slice(&expected).is_ok() {
                return Ok(());
            }
        }
        Err(WebhookError::SignatureMismatch)
    }
}

/// Gateway event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub data: Option<CheckoutSession>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    #[serde(default)]
    pub plan_id: String,
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub payment_status: PaymentStatus,
}

impl WebhookEnvelope {
    pub fn is_checkout_completed(&self) -> bool {
        self.event_type == CHECKOUT_COMPLETED
    }

    /// Checkout event carried by a completed-session envelope.
    pub fn into_checkout_event(self) -> Option<CheckoutEvent> {
        let session = self.data?;
        Some(
            CheckoutEvent::new(
                self.id,
                session.plan_id,
                session.customer_id,
                session.payment_status,
            )
            .with_customer(session.customer_name, session.customer_email),
        )
    }
}
