//! Field-level encryption seam for customer PII.

use thiserror::Error;

/// Errors raised by a [`PiiCipher`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CipherError(pub String);

/// Opaque encrypt/decrypt capability applied to PII before it is stored.
pub trait PiiCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

impl<T: PiiCipher + ?Sized> PiiCipher for std::sync::Arc<T> {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        (**self).encrypt(plaintext)
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        (**self).decrypt(ciphertext)
    }
}

/// Pass-through cipher for local runs and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCipher;

impl PiiCipher for PlaintextCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        Ok(ciphertext.to_string())
    }
}
