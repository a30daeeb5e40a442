//! Security module for the AI-CORE Webhook Delivery Service
//!
//! Payload signing for outbound deliveries, the matching verification routine that
//! receivers (and our tests) use, endpoint secret generation and idempotency keys.

use crate::error::{WebhookDeliveryError, WebhookDeliveryResult};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Prefix carried by every signature header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Prefix of generated endpoint secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Number of random bytes in an endpoint secret (256 bits)
const SECRET_BYTES: usize = 32;

/// Outbound header names
pub mod headers {
    pub const SIGNATURE: &str = "X-Webhook-Signature-256";
    pub const EVENT: &str = "X-Webhook-Event";
    pub const DELIVERY: &str = "X-Webhook-Delivery";
    pub const TIMESTAMP: &str = "X-Webhook-Timestamp";
}

/// Signing and verification helpers for webhook payloads
pub struct SecurityUtils;

impl SecurityUtils {
    /// Compute the `sha256=<hex>` signature of `payload` under `secret`
    pub fn sign_payload(payload: &[u8], secret: &str) -> WebhookDeliveryResult<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| WebhookDeliveryError::internal(format!("HMAC error: {}", e)))?;
        mac.update(payload);
        Ok(format!(
            "{}{}",
            SIGNATURE_PREFIX,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    /// Verify a signature header against `payload`.
    ///
    /// The `sha256=` prefix is optional. Comparison is constant-time; a malformed
    /// signature is reported as invalid rather than as an error.
    pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
        let signature = signature
            .strip_prefix(SIGNATURE_PREFIX)
            .unwrap_or(signature);

        let provided = match hex::decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!("Webhook signature is not valid hex");
                return false;
            }
        };

        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return false,
        };
        mac.update(payload);
        let computed = mac.finalize().into_bytes();

        let is_valid: bool = computed.as_slice().ct_eq(&provided).into();
        if !is_valid {
            warn!("Webhook signature verification failed");
        }
        is_valid
    }

    /// Generate a new 256-bit endpoint secret from the OS RNG
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_BYTES];
        OsRng.fill_bytes(&mut bytes);
        format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
    }

    /// Idempotency key for an (endpoint, event) pairing: hex(SHA-256(endpointId ":" eventId))
    pub fn idempotency_key(endpoint_id: &Uuid, event_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(endpoint_id.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(event_id.as_bytes());
        hex::encode(hasher.finalize())
    }
}
