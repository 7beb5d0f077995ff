//! Cryptographic primitives for Cryptomator vaults.

pub mod cryptor;
pub mod key_wrap;
pub mod keys;
mod thread_safety; // Send + Sync impls for MasterKey

use thiserror::Error;

/// Errors raised while deriving, wrapping or unwrapping key material.
///
/// Variants marked `[INTEGRITY VIOLATION]` indicate possible tampering and
/// should be logged as security events.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The vault configuration's signature or the master key file's version
    /// MAC did not verify.
    ///
    /// **[INTEGRITY VIOLATION]**
    #[error("[INTEGRITY VIOLATION] HMAC verification failed - vault metadata tampered")]
    HmacVerificationFailed,

    /// RFC 3394 integrity check failed while unwrapping the master keys.
    ///
    /// Almost always a wrong password. Tampering with the master key file is
    /// cryptographically indistinguishable from it.
    #[error("Key unwrap failed - incorrect passphrase or corrupted/tampered vault")]
    KeyUnwrapIntegrityFailed,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid scrypt parameters: {0}")]
    InvalidScryptParams(String),

    #[error("Invalid ciphertext length for key unwrap")]
    InvalidCiphertextLength,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl From<key_wrap::UnwrapError> for CryptoError {
    fn from(err: key_wrap::UnwrapError) -> Self {
        match err {
            key_wrap::UnwrapError::InvalidCiphertextLength
            | key_wrap::UnwrapError::CiphertextTooShort => CryptoError::InvalidCiphertextLength,
            key_wrap::UnwrapError::InvalidIntegrityCheck => CryptoError::KeyUnwrapIntegrityFailed,
        }
    }
}

pub use cryptor::{Cryptor, VaultCryptor};
pub use keys::{KeyAccessError, MasterKey};
