//! Stripe webhook signature verification
//!
//! Stripe signs `"{timestamp}.{raw_body}"` with HMAC-SHA256 keyed by the
//! endpoint secret and sends `t=<timestamp>,v1=<hex>[,v1=<hex>...]` in the
//! `stripe-signature` header. Verification must run on the exact bytes that
//! arrived; re-serializing parsed JSON changes them.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::EventEnvelope;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age (either direction) of a signed timestamp.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<String>,
    tolerance_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("configured", &self.secret.is_some())
            .field("tolerance_secs", &self.tolerance_secs)
            .finish()
    }
}

impl SignatureVerifier {
    /// A blank secret counts as not configured.
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.trim().is_empty()),
            tolerance_secs: SIGNATURE_TOLERANCE_SECS,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Verify a delivery against the current time and parse its envelope.
    pub fn verify(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<EventEnvelope> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_at(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: i64,
    ) -> BillingResult<EventEnvelope> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            tracing::error!("STRIPE_WEBHOOK_SECRET is not configured; rejecting webhook");
            BillingError::Misconfigured("webhook secret not configured".to_string())
        })?;

        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                tracing::warn!(payload_len = payload.len(), "Webhook missing signature header");
                BillingError::MissingSignature
            })?;

        let header = parse_signature_header(signature).ok_or_else(|| {
            tracing::warn!(
                payload_len = payload.len(),
                "Webhook signature header is malformed"
            );
            BillingError::InvalidSignature
        })?;

        let age = now.abs_diff(header.timestamp);
        if age > self.tolerance_secs.unsigned_abs() {
            tracing::warn!(
                timestamp = header.timestamp,
                now = now,
                diff = age,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::InvalidSignature);
        }

        let expected = compute_signature(secret, header.timestamp, payload)?;
        let matched = header.v1.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|provided| bool::from(provided.ct_eq(&expected)))
                .unwrap_or(false)
        });

        if !matched {
            tracing::warn!(
                payload_len = payload.len(),
                candidates = header.v1.len(),
                "Webhook signature mismatch"
            );
            return Err(BillingError::InvalidSignature);
        }

        EventEnvelope::from_slice(payload).inspect_err(|e| {
            tracing::warn!(error = %e, "Signed webhook payload is not a Stripe event");
        })
    }
}

struct SignatureHeader {
    timestamp: i64,
    v1: Vec<String>,
}

fn parse_signature_header(header: &str) -> Option<SignatureHeader> {
    let mut timestamp = None;
    let mut v1 = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => v1.push(value.to_string()),
            _ => {}
        }
    }

    match timestamp {
        Some(timestamp) if !v1.is_empty() => Some(SignatureHeader { timestamp, v1 }),
        _ => None,
    }
}

/// Raw HMAC over `"{timestamp}.{payload}"`.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Misconfigured("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a `stripe-signature` header value the way Stripe does.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let signature = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(signature)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    fn body() -> Vec<u8> {
        br#"{"id":"evt_1","type":"invoice.paid","created":1700000000,"livemode":false,"data":{"object":{"id":"in_1"}}}"#.to_vec()
    }

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(Some(SECRET.to_string()))
    }

    #[test]
    fn accepts_valid_signature() {
        let payload = body();
        let header = sign_payload(SECRET, NOW, &payload).unwrap();
        let envelope = verifier().verify_at(&payload, Some(&header), NOW).unwrap();
        assert_eq!(envelope.id, "evt_1");
        assert_eq!(envelope.event_type, "invoice.paid");
    }

    #[test]
    fn missing_secret_fails_closed() {
        let payload = body();
        let header = sign_payload(SECRET, NOW, &payload).unwrap();
        let err = SignatureVerifier::new(Some("  ".to_string()))
            .verify_at(&payload, Some(&header), NOW)
            .unwrap_err();
        assert!(matches!(err, BillingError::Misconfigured(_)));
    }

    #[test]
    fn missing_header_is_reported() {
        let err = verifier().verify_at(&body(), None, NOW).unwrap_err();
        assert!(matches!(err, BillingError::MissingSignature));

        let err = verifier().verify_at(&body(), Some(""), NOW).unwrap_err();
        assert!(matches!(err, BillingError::MissingSignature));
    }

    #[test]
    fn rejects_tampered_body() {
        let payload = body();
        let header = sign_payload(SECRET, NOW, &payload).unwrap();
        let mut tampered = payload.clone();
        tampered.push(b' ');
        let err = verifier().verify_at(&tampered, Some(&header), NOW).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    #[test]
    fn rejects_wrong_secret() {
        let payload = body();
        let header = sign_payload("whsec_other", NOW, &payload).unwrap();
        let err = verifier().verify_at(&payload, Some(&header), NOW).unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    #[test]
    fn timestamp_tolerance_boundary() {
        let payload = body();
        let header = sign_payload(SECRET, NOW, &payload).unwrap();

        assert!(verifier()
            .verify_at(&payload, Some(&header), NOW + SIGNATURE_TOLERANCE_SECS)
            .is_ok());
        let err = verifier()
            .verify_at(&payload, Some(&header), NOW + SIGNATURE_TOLERANCE_SECS + 1)
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidSignature));
    }

    #[test]
    fn malformed_headers_are_invalid() {
        for header in [
            "garbage",
            "t=abc,v1=00",
            "v1=deadbeef",
            "t=1700000000",
            "t=-9223372036854775808,v1=00",
            "t=9223372036854775807,v1=00",
        ] {
            let err = verifier().verify_at(&body(), Some(header), NOW).unwrap_err();
            assert!(
                matches!(err, BillingError::InvalidSignature),
                "header {header:?} should be invalid"
            );
        }
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let payload = body();
        let good = hex::encode(compute_signature(SECRET, NOW, &payload).unwrap());
        let header = format!("t={NOW},v1=nothex,v1={good},v0=ignored");
        assert!(verifier().verify_at(&payload, Some(&header), NOW).is_ok());
    }

    #[test]
    fn signed_non_event_is_malformed() {
        let payload = br#"{"hello":"world"}"#;
        let header = sign_payload(SECRET, NOW, payload).unwrap();
        let err = verifier().verify_at(payload, Some(&header), NOW).unwrap_err();
        assert!(matches!(err, BillingError::MalformedPayload(_)));
    }

    #[test]
    fn debug_output_hides_secret() {
        let rendered = format!("{:?}", verifier());
        assert!(!rendered.contains(SECRET));
    }
}
