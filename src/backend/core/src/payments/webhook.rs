//! Webhook verification and decryption.
//!
//! The provider delivers settlement notifications as a signed envelope with
//! an encrypted resource. Verification happens before anything is parsed or
//! any state is touched:
//!
//! 1. timestamp freshness — a stale timestamp is a suspected replay
//! 2. key serial identity — the notification must reference our platform key
//! 3. HMAC-SHA256 over `"{timestamp}\n{nonce}\n{body}\n"`, compared in
//!    constant time
//!
//! Only then is the resource decrypted (AES-256-GCM with the notification
//! key) and parsed into a [`SettlementNotice`]. Failures carry internal
//! detail for the log; the API layer never echoes it to the caller.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

use crate::config::PaymentConfig;
use crate::error::{AtelierError, ErrorCode, Result};

type HmacSha256 = Hmac<Sha256>;

const B64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

// ═══════════════════════════════════════════════════════════════════════════════
// Inbound Shapes
// ═══════════════════════════════════════════════════════════════════════════════

/// Signature headers the provider sends with every notification.
#[derive(Debug, Clone)]
pub struct WebhookHeaders {
    /// Unix timestamp (seconds) the provider signed at
    pub timestamp: String,
    /// Random nonce included in the signed message
    pub nonce: String,
    /// Serial of the platform key that produced the signature
    pub serial: String,
    /// Hex-encoded HMAC-SHA256 signature
    pub signature: String,
}

/// Signed notification envelope.
#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    resource: EncryptedResource,
}

/// The encrypted part of the envelope.
#[derive(Debug, Deserialize)]
struct EncryptedResource {
    /// Base64 AES-256-GCM ciphertext (tag appended)
    ciphertext: String,
    /// Base64 12-byte nonce
    nonce: String,
    /// Associated data bound into the AEAD
    #[serde(default)]
    associated_data: String,
}

/// A decrypted, verified settlement notification.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementNotice {
    /// Our order id, echoed back by the provider
    pub merchant_order_id: String,
    /// The provider's transaction id
    pub external_transaction_id: String,
    /// Settled amount in minor units
    pub amount: i64,
    /// When the provider recorded the payment
    pub paid_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Verifier
// ═══════════════════════════════════════════════════════════════════════════════

/// Verifies and decrypts inbound settlement notifications.
pub struct WebhookVerifier {
    secret: Vec<u8>,
    key_serial: String,
    notification_key: [u8; 32],
    replay_window: Duration,
}

impl WebhookVerifier {
    pub fn new(cfg: &PaymentConfig) -> Result<Self> {
        let secret = hex::decode(&cfg.webhook_secret).map_err(|e| {
            AtelierError::configuration(format!("webhook_secret is not valid hex: {}", e))
        })?;
        if secret.is_empty() {
            return Err(AtelierError::configuration("webhook_secret is empty"));
        }

        let key = hex::decode(&cfg.notification_key).map_err(|e| {
            AtelierError::configuration(format!("notification_key is not valid hex: {}", e))
        })?;
        let notification_key: [u8; 32] = key.try_into().map_err(|_| {
            AtelierError::configuration("notification_key must be 32 bytes of hex")
        })?;

        Ok(Self {
            secret,
            key_serial: cfg.webhook_key_serial.clone(),
            notification_key,
            replay_window: cfg.replay_window,
        })
    }

    /// Verify the signed envelope and decrypt the settlement notice.
    pub fn verify_and_decrypt(
        &self,
        headers: &WebhookHeaders,
        body: &str,
    ) -> Result<SettlementNotice> {
        self.check_freshness(headers)?;
        self.check_signature(headers, body)?;
        self.decrypt(body)
    }

    fn check_freshness(&self, headers: &WebhookHeaders) -> Result<()> {
        let timestamp: i64 = headers.timestamp.parse().map_err(|_| {
            AtelierError::signature_verification_failed(format!(
                "non-numeric timestamp {:?}",
                headers.timestamp
            ))
        })?;

        let skew = (Utc::now().timestamp() - timestamp).abs();
        if skew > self.replay_window.as_secs() as i64 {
            return Err(AtelierError::replay_suspected(skew));
        }
        Ok(())
    }

    fn check_signature(&self, headers: &WebhookHeaders, body: &str) -> Result<()> {
        if headers.serial != self.key_serial {
            return Err(AtelierError::signature_verification_failed(format!(
                "unknown key serial {:?}",
                headers.serial
            )));
        }

        let signature = hex::decode(&headers.signature).map_err(|_| {
            AtelierError::signature_verification_failed("signature is not valid hex")
        })?;

        let message = format!("{}\n{}\n{}\n", headers.timestamp, headers.nonce, body);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.secret)
            .map_err(|e| AtelierError::internal(format!("invalid webhook secret: {}", e)))?;
        mac.update(message.as_bytes());

        // Constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| AtelierError::signature_verification_failed("signature mismatch"))
    }

    fn decrypt(&self, body: &str) -> Result<SettlementNotice> {
        let envelope: NotificationEnvelope = serde_json::from_str(body).map_err(|e| {
            AtelierError::with_internal(
                ErrorCode::PayloadDecryptionFailed,
                "Malformed notification payload",
                e.to_string(),
            )
        })?;

        let ciphertext = B64.decode(&envelope.resource.ciphertext).map_err(|e| {
            AtelierError::with_internal(
                ErrorCode::PayloadDecryptionFailed,
                "Malformed notification payload",
                format!("ciphertext base64: {}", e),
            )
        })?;
        let nonce = B64.decode(&envelope.resource.nonce).map_err(|e| {
            AtelierError::with_internal(
                ErrorCode::PayloadDecryptionFailed,
                "Malformed notification payload",
                format!("nonce base64: {}", e),
            )
        })?;
        if nonce.len() != 12 {
            return Err(AtelierError::with_internal(
                ErrorCode::PayloadDecryptionFailed,
                "Malformed notification payload",
                format!("nonce length {}", nonce.len()),
            ));
        }

        let cipher = Aes256Gcm::new((&self.notification_key).into());
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: envelope.resource.associated_data.as_bytes(),
                },
            )
            .map_err(|_| {
                AtelierError::with_internal(
                    ErrorCode::PayloadDecryptionFailed,
                    "Malformed notification payload",
                    "AEAD decryption failed",
                )
            })?;

        let notice: SettlementNotice = serde_json::from_slice(&plaintext)?;
        Ok(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::AeadCore;
    use aes_gcm::aead::OsRng;

    const SECRET_HEX: &str = "aabbccddeeff00112233445566778899";
    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const SERIAL: &str = "PLAT-2026-01";

    fn verifier() -> WebhookVerifier {
        let cfg = PaymentConfig {
            webhook_secret: SECRET_HEX.to_string(),
            webhook_key_serial: SERIAL.to_string(),
            notification_key: KEY_HEX.to_string(),
            replay_window: Duration::from_secs(300),
            ..Default::default()
        };
        WebhookVerifier::new(&cfg).unwrap()
    }

    /// Build a signed envelope the way the provider would.
    fn seal(notice_json: &str, timestamp: i64, nonce: &str) -> (WebhookHeaders, String) {
        let key: [u8; 32] = hex::decode(KEY_HEX).unwrap().try_into().unwrap();
        let cipher = Aes256Gcm::new((&key).into());
        let aead_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(
                &aead_nonce,
                Payload {
                    msg: notice_json.as_bytes(),
                    aad: b"settlement",
                },
            )
            .unwrap();

        let body = serde_json::json!({
            "resource": {
                "ciphertext": B64.encode(ciphertext),
                "nonce": B64.encode(aead_nonce),
                "associated_data": "settlement",
            }
        })
        .to_string();

        let message = format!("{}\n{}\n{}\n", timestamp, nonce, body);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&hex::decode(SECRET_HEX).unwrap()).unwrap();
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        (
            WebhookHeaders {
                timestamp: timestamp.to_string(),
                nonce: nonce.to_string(),
                serial: SERIAL.to_string(),
                signature,
            },
            body,
        )
    }

    fn notice_json() -> String {
        serde_json::json!({
            "merchant_order_id": "MO0af3",
            "external_transaction_id": "TXN-889900",
            "amount": 10000,
            "paid_at": "2026-08-06T10:00:00Z",
        })
        .to_string()
    }

    #[test]
    fn test_roundtrip_verify_and_decrypt() {
        let (headers, body) = seal(&notice_json(), Utc::now().timestamp(), "n-123");

        let notice = verifier().verify_and_decrypt(&headers, &body).unwrap();
        assert_eq!(notice.merchant_order_id, "MO0af3");
        assert_eq!(notice.external_transaction_id, "TXN-889900");
        assert_eq!(notice.amount, 10000);
    }

    #[test]
    fn test_stale_timestamp_rejected_as_replay() {
        let stale = Utc::now().timestamp() - 3600;
        let (headers, body) = seal(&notice_json(), stale, "n-123");

        let err = verifier().verify_and_decrypt(&headers, &body).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplaySuspected);
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let future = Utc::now().timestamp() + 3600;
        let (headers, body) = seal(&notice_json(), future, "n-123");

        let err = verifier().verify_and_decrypt(&headers, &body).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplaySuspected);
    }

    #[test]
    fn test_wrong_serial_rejected() {
        let (mut headers, body) = seal(&notice_json(), Utc::now().timestamp(), "n-123");
        headers.serial = "PLAT-OLD".to_string();

        let err = verifier().verify_and_decrypt(&headers, &body).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SignatureVerificationFailed);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (headers, body) = seal(&notice_json(), Utc::now().timestamp(), "n-123");
        let tampered = body.replace("settlement", "settlemenT");

        let err = verifier().verify_and_decrypt(&headers, &tampered).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SignatureVerificationFailed);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let (mut headers, body) = seal(&notice_json(), Utc::now().timestamp(), "n-123");
        headers.signature = headers.signature.replace(
            headers.signature.chars().next().unwrap(),
            if headers.signature.starts_with('0') { "1" } else { "0" },
        );

        let err = verifier().verify_and_decrypt(&headers, &body).unwrap_err();
        assert_eq!(err.code(), ErrorCode::SignatureVerificationFailed);
    }

    #[test]
    fn test_wrong_notification_key_fails_decryption() {
        let (headers, body) = seal(&notice_json(), Utc::now().timestamp(), "n-123");

        let cfg = PaymentConfig {
            webhook_secret: SECRET_HEX.to_string(),
            webhook_key_serial: SERIAL.to_string(),
            // Different AES key than the one that sealed the resource.
            notification_key:
                "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff".to_string(),
            replay_window: Duration::from_secs(300),
            ..Default::default()
        };
        let wrong_key_verifier = WebhookVerifier::new(&cfg).unwrap();

        let err = wrong_key_verifier
            .verify_and_decrypt(&headers, &body)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PayloadDecryptionFailed);
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let cfg = PaymentConfig {
            webhook_secret: "not-hex".to_string(),
            ..Default::default()
        };
        assert!(WebhookVerifier::new(&cfg).is_err());

        let cfg = PaymentConfig {
            webhook_secret: SECRET_HEX.to_string(),
            notification_key: "abcd".to_string(), // too short
            ..Default::default()
        };
        assert!(WebhookVerifier::new(&cfg).is_err());
    }
}
