//! Webhook signature verification.
//!
//! The provider signs the raw request body with HMAC-SHA256 over a shared
//! secret and sends the hex digest in the `X-Signature` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{CheckoutError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded body signature.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Verifies provider signatures against a shared secret.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier").finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| CheckoutError::Validation(format!("unusable webhook secret: {e}")))
    }

    /// Computes the hex signature of a body.
    pub fn sign(&self, body: &[u8]) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Checks `signature` against the body in constant time.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<()> {
        let expected = hex::decode(signature.trim()).map_err(|_| CheckoutError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| CheckoutError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_body_verifies() {
        let verifier = WebhookVerifier::new("whsec_test");
        let body = br#"{"type":"checkout.session.completed"}"#;
        let signature = verifier.sign(body).unwrap();

        assert!(verifier.verify(body, &signature).is_ok());
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let verifier = WebhookVerifier::new("whsec_test");
        let signature = verifier.sign(b"original").unwrap();

        assert!(matches!(
            verifier.verify(b"tampered", &signature),
            Err(CheckoutError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_and_garbage_are_rejected() {
        let signature = WebhookVerifier::new("a").sign(b"body").unwrap();
        let other = WebhookVerifier::new("b");

        assert!(other.verify(b"body", &signature).is_err());
        assert!(other.verify(b"body", "not-hex").is_err());
    }
}
