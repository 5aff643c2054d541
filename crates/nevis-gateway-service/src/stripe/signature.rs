//! `Stripe-Signature` header verification.
//!
//! Header format: `t=<unix seconds>,v1=<hex hmac>[,v1=<hex hmac>...]`. The
//! signed payload is `"{t}.{body}"`.

use crate::crypto::{constant_time_eq, hmac_sha256_hex};

/// Webhook verification errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StripeError {
    /// The header has no `t=` element.
    #[error("missing timestamp in signature header")]
    MissingTimestamp,

    /// No `v1=` signature matched the payload.
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// The signed timestamp is outside the tolerance window.
    #[error("webhook timestamp outside tolerance ({age_seconds}s)")]
    StaleTimestamp {
        /// Distance between now and the signed timestamp.
        age_seconds: i64,
    },
}

/// Verify a webhook payload against its `Stripe-Signature` header.
///
/// `now` is the current unix time in seconds. A `tolerance_seconds` of zero
/// disables the timestamp check.
///
/// # Errors
///
/// Returns a [`StripeError`] describing why the signature was rejected.
pub fn verify_webhook_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance_seconds: i64,
    now: i64,
) -> Result<(), StripeError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(ts)) => timestamp = Some(ts),
            (Some("v1"), Some(sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(StripeError::MissingTimestamp)?;

    if signatures.is_empty() {
        return Err(StripeError::InvalidSignature);
    }

    let signed_payload = format!("{timestamp}.{payload}");
    let expected =
        hmac_sha256_hex(secret, &signed_payload).ok_or(StripeError::InvalidSignature)?;

    if !signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        return Err(StripeError::InvalidSignature);
    }

    if tolerance_seconds > 0 {
        let signed_at: i64 = timestamp
            .parse()
            .map_err(|_| StripeError::MissingTimestamp)?;
        let age_seconds = (now - signed_at).abs();
        if age_seconds > tolerance_seconds {
            return Err(StripeError::StaleTimestamp { age_seconds });
        }
    }

    Ok(())
}

/// Build a `Stripe-Signature` header value for a payload.
///
/// Used by tests and local tooling to produce deliveries the verifier accepts.
#[must_use]
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> String {
    let signature = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}")).unwrap_or_default();
    format!("t={timestamp},v1={signature}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn accepts_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, NOW);
        assert_eq!(verify_webhook_signature(payload, &header, SECRET, 300, NOW), Ok(()));
    }

    #[test]
    fn accepts_any_matching_v1() {
        let payload = "{}";
        let good = sign_payload(payload, SECRET, NOW);
        let sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v1={sig}");
        assert_eq!(verify_webhook_signature(payload, &header, SECRET, 300, NOW), Ok(()));
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = sign_payload(r#"{"amount":1}"#, SECRET, NOW);
        assert_eq!(
            verify_webhook_signature(r#"{"amount":9}"#, &header, SECRET, 300, NOW),
            Err(StripeError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_wrong_secret_and_missing_parts() {
        let header = sign_payload("{}", "other", NOW);
        assert_eq!(
            verify_webhook_signature("{}", &header, SECRET, 300, NOW),
            Err(StripeError::InvalidSignature)
        );
        assert_eq!(
            verify_webhook_signature("{}", "v1=abc", SECRET, 300, NOW),
            Err(StripeError::MissingTimestamp)
        );
        assert_eq!(
            verify_webhook_signature("{}", &format!("t={NOW}"), SECRET, 300, NOW),
            Err(StripeError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let header = sign_payload("{}", SECRET, NOW - 301);
        assert_eq!(
            verify_webhook_signature("{}", &header, SECRET, 300, NOW),
            Err(StripeError::StaleTimestamp { age_seconds: 301 })
        );
        // Tolerance of zero disables the check.
        assert_eq!(verify_webhook_signature("{}", &header, SECRET, 0, NOW), Ok(()));
    }
}
