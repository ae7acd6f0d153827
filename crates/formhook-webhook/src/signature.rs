//! Webhook signature handling
//!
//! Provides HMAC-SHA256 signature generation and verification. The MAC is
//! computed over the exact request body and sent as
//! `X-Webhook-Signature: sha256=<hex>`.

use crate::{Result, WebhookError};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature header name
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Prefix naming the MAC algorithm inside the header value
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Webhook signer for generating signatures
#[derive(Clone)]
pub struct WebhookSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for WebhookSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSigner").finish_non_exhaustive()
    }
}

impl WebhookSigner {
    /// Create a new signer with a secret
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(WebhookError::Signing("secret is empty".to_string()));
        }
        Ok(Self {
            secret: secret.as_bytes().to_vec(),
        })
    }

    /// Generate the hex signature for a payload
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Value for the signature header, `sha256=<hex>`
    pub fn header_value(&self, payload: &[u8]) -> Result<String> {
        Ok(format!("{}{}", SIGNATURE_PREFIX, self.sign(payload)?))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret).map_err(|e| WebhookError::Signing(e.to_string()))
    }
}

/// Sign a serialized payload with a webhook secret
pub fn sign(payload: &[u8], secret: &str) -> Result<String> {
    WebhookSigner::new(secret)?.sign(payload)
}

/// Webhook verifier for validating signatures on the receiving side
pub struct WebhookVerifier {
    signer: WebhookSigner,
}

impl WebhookVerifier {
    /// Create a new verifier with a secret
    pub fn new(secret: &str) -> Result<Self> {
        Ok(Self {
            signer: WebhookSigner::new(secret)?,
        })
    }

    /// Verify a `sha256=<hex>` header against the received body
    pub fn verify(&self, payload: &[u8], signature_header: &str) -> Result<()> {
        let hex_signature = signature_header
            .trim()
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or_else(|| {
                WebhookError::SignatureVerificationFailed(
                    "Unsupported signature scheme".to_string(),
                )
            })?;

        let expected = hex::decode(hex_signature).map_err(|_| {
            WebhookError::SignatureVerificationFailed("Signature is not valid hex".to_string())
        })?;

        let mut mac = self.signer.mac()?;
        mac.update(payload);
        // Constant-time comparison
        mac.verify_slice(&expected).map_err(|_| {
            WebhookError::SignatureVerificationFailed("Signature mismatch".to_string())
        })
    }
}

/// Generate a secure random webhook secret
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let secret: [u8; 32] = rand::thread_rng().gen();
    format!("whsec_{}", hex::encode(secret))
}
