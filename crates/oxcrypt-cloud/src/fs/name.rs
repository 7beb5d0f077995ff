//! Filename encryption, directory ID hashing and name shortening.
//!
//! Names are encrypted with AES-SIV using the parent folder's directory ID as
//! associated data, so a ciphertext name only decrypts inside the folder it was
//! created in. Format 7+ vaults encode the result as padded Base64url, older
//! vaults as padded Base32.

use aes_siv::{KeyInit, siv::Aes256Siv};
use base64::{Engine as _, engine::general_purpose};
use data_encoding::BASE32;
use ring::digest;
use std::fmt;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::crypto::keys::{KeyAccessError, MasterKey};

/// Text encoding applied to encrypted names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameEncoding {
    /// Padded Base64url, used from vault format 7 on.
    Base64Url,
    /// Padded RFC 4648 Base32, used by vault formats 5 and 6.
    Base32,
}

impl NameEncoding {
    fn encode(self, bytes: &[u8]) -> String {
        match self {
            NameEncoding::Base64Url => general_purpose::URL_SAFE.encode(bytes),
            NameEncoding::Base32 => BASE32.encode(bytes),
        }
    }

    fn decode(self, text: &str) -> Result<Vec<u8>, String> {
        match self {
            NameEncoding::Base64Url => general_purpose::URL_SAFE
                .decode(text.as_bytes())
                .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(text.as_bytes()))
                .map_err(|e| e.to_string()),
            NameEncoding::Base32 => BASE32.decode(text.as_bytes()).map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Display for NameEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameEncoding::Base64Url => write!(f, "base64url"),
            NameEncoding::Base32 => write!(f, "base32"),
        }
    }
}

/// Context for filename operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct NameContext {
    pub encrypted_name: Option<String>,
    pub cleartext_name: Option<String>,
    pub dir_id: Option<String>,
}

impl NameContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_encrypted_name(mut self, name: impl Into<String>) -> Self {
        self.encrypted_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_cleartext_name(mut self, name: impl Into<String>) -> Self {
        self.cleartext_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_dir_id(mut self, dir_id: impl Into<String>) -> Self {
        self.dir_id = Some(dir_id.into());
        self
    }
}

impl fmt::Display for NameContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref name) = self.cleartext_name {
            parts.push(format!("filename '{name}'"));
        } else if let Some(ref enc_name) = self.encrypted_name {
            let display_name = match enc_name.get(..37) {
                Some(prefix) if enc_name.len() > 40 => format!("{prefix}..."),
                _ => enc_name.clone(),
            };
            parts.push(format!("encrypted name '{display_name}'"));
        }

        if let Some(ref dir_id) = self.dir_id {
            let display_id = if dir_id.is_empty() {
                "<root>".to_string()
            } else {
                match dir_id.get(..12) {
                    Some(prefix) if dir_id.len() > 12 => format!("{prefix}..."),
                    _ => dir_id.clone(),
                }
            };
            parts.push(format!("in directory {display_id}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(" "))
        }
    }
}

#[derive(Error, Debug)]
pub enum NameError {
    /// AES-SIV authentication failed.
    ///
    /// **[INTEGRITY VIOLATION]** The name was tampered with, belongs to another
    /// directory, or was encrypted under another key.
    #[error(
        "[INTEGRITY VIOLATION] Failed to decrypt {context}: authentication failed - possible tampering, wrong key, or name moved between directories"
    )]
    DecryptionFailed { context: NameContext },

    #[error("Invalid {encoding} encoding for {context}: {reason}")]
    Decode {
        encoding: NameEncoding,
        reason: String,
        context: NameContext,
    },

    #[error("Invalid UTF-8 after decryption for {context}: {reason}")]
    Utf8Decode { reason: String, context: NameContext },

    #[error("Unexpected encryption failure for {context}")]
    EncryptionFailed { context: NameContext },

    #[error("Failed to hash directory ID '{dir_id}': encryption error")]
    DirIdHashFailed { dir_id: String },

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Hash a directory ID to its physical folder name.
///
/// AES-SIV encrypt the ID without associated data, SHA-1 the ciphertext and
/// Base32 encode the digest. The 32-character result is split 2/30 into
/// `d/<2>/<30>`.
pub fn hash_dir_id(dir_id: &str, master_key: &MasterKey) -> Result<String, NameError> {
    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[];
        let encrypted = cipher
            .encrypt(associated_data, dir_id.as_bytes())
            .map_err(|_| NameError::DirIdHashFailed {
                dir_id: dir_id.to_string(),
            })?;

        let hashed = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &encrypted);
        Ok(BASE32.encode(hashed.as_ref()))
    })?
}

/// Encrypt a cleartext name for storage inside the folder `parent_dir_id`.
///
/// The name is NFC-normalized first. No suffix or prefix is added.
pub fn encrypt_filename(
    name: &str,
    parent_dir_id: &str,
    encoding: NameEncoding,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let normalized_name: String = name.nfc().collect();

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let encrypted = cipher
            .encrypt(associated_data, normalized_name.as_bytes())
            .map_err(|_| NameError::EncryptionFailed {
                context: NameContext::new()
                    .with_cleartext_name(name)
                    .with_dir_id(parent_dir_id),
            })?;
        Ok(encoding.encode(&encrypted))
    })?
}

/// Decrypt an encoded ciphertext name found inside the folder `parent_dir_id`.
///
/// The caller strips suffixes (`.c9r`) and type prefixes (`0`, `1S`) first.
pub fn decrypt_filename(
    encrypted_name: &str,
    parent_dir_id: &str,
    encoding: NameEncoding,
    master_key: &MasterKey,
) -> Result<String, NameError> {
    let context = || {
        NameContext::new()
            .with_encrypted_name(encrypted_name)
            .with_dir_id(parent_dir_id)
    };

    let decoded = encoding.decode(encrypted_name).map_err(|reason| NameError::Decode {
        encoding,
        reason,
        context: context(),
    })?;

    master_key.with_siv_key(|key| {
        let mut cipher = Aes256Siv::new(key);
        let associated_data: &[&[u8]] = &[parent_dir_id.as_bytes()];
        let decrypted = cipher
            .decrypt(associated_data, &decoded)
            .map_err(|_| NameError::DecryptionFailed { context: context() })?;

        String::from_utf8(decrypted).map_err(|e| NameError::Utf8Decode {
            reason: e.to_string(),
            context: context(),
        })
    })?
}

/// Base name of a format 7+ `.c9s` container for an over-long name.
///
/// `long_name` is the full ciphertext name including its `.c9r` suffix. The
/// returned string has no suffix.
pub fn shortened_c9s_name(long_name: &str) -> String {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, long_name.as_bytes());
    general_purpose::URL_SAFE.encode(hash.as_ref())
}

/// Base name of a legacy `.lng` surrogate for an over-long name.
///
/// `long_name` is the full ciphertext name including its type prefix.
pub fn shortened_lng_name(long_name: &str) -> String {
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, long_name.as_bytes());
    BASE32.encode(hash.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_key() -> MasterKey {
        MasterKey::new([0x11; 32], [0x22; 32]).unwrap()
    }

    #[test]
    fn test_hash_dir_id_shape() {
        let key = test_key();
        let root = hash_dir_id("", &key).unwrap();
        assert_eq!(root.len(), 32);
        assert!(root.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));

        let other = hash_dir_id("e9250eb8-078d-4fc0-8835-be92a313360c", &key).unwrap();
        assert_ne!(root, other);
        assert_eq!(other, hash_dir_id("e9250eb8-078d-4fc0-8835-be92a313360c", &key).unwrap());
    }

    #[test]
    fn test_encryption_is_deterministic_per_directory() {
        let key = test_key();
        for encoding in [NameEncoding::Base64Url, NameEncoding::Base32] {
            let a = encrypt_filename("report.pdf", "dir-a", encoding, &key).unwrap();
            let b = encrypt_filename("report.pdf", "dir-a", encoding, &key).unwrap();
            let c = encrypt_filename("report.pdf", "dir-b", encoding, &key).unwrap();
            assert_eq!(a, b);
            assert_ne!(a, c);
        }
    }

    #[test]
    fn test_nfc_normalization() {
        let key = test_key();
        let composed = "caf\u{e9}";
        let decomposed = "cafe\u{301}";
        let a = encrypt_filename(composed, "", NameEncoding::Base64Url, &key).unwrap();
        let b = encrypt_filename(decomposed, "", NameEncoding::Base64Url, &key).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            decrypt_filename(&b, "", NameEncoding::Base64Url, &key).unwrap(),
            composed
        );
    }

    #[test]
    fn test_decrypt_rejects_garbage() {
        let key = test_key();
        assert!(matches!(
            decrypt_filename("not base64 at all!", "", NameEncoding::Base64Url, &key),
            Err(NameError::Decode { .. })
        ));
        assert!(matches!(
            decrypt_filename("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", "", NameEncoding::Base64Url, &key),
            Err(NameError::DecryptionFailed { .. })
        ));
        assert!(matches!(
            decrypt_filename("lowercase", "", NameEncoding::Base32, &key),
            Err(NameError::Decode { .. })
        ));
    }

    #[test]
    fn test_shortened_names() {
        let long = format!("{}.c9r", "A".repeat(300));
        let c9s = shortened_c9s_name(&long);
        assert_eq!(c9s.len(), 28);
        assert!(c9s.ends_with('='));

        let lng = shortened_lng_name(&format!("0{}", "B".repeat(300)));
        assert_eq!(lng.len(), 32);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_name_roundtrip(name in "[a-zA-Z0-9 ._()-]{1,80}", dir_id in "[a-f0-9-]{0,36}") {
            let key = test_key();
            for encoding in [NameEncoding::Base64Url, NameEncoding::Base32] {
                let encrypted = encrypt_filename(&name, &dir_id, encoding, &key).unwrap();
                let decrypted = decrypt_filename(&encrypted, &dir_id, encoding, &key).unwrap();
                prop_assert_eq!(&decrypted, &name);
            }
        }

        #[test]
        fn prop_name_bound_to_directory(name in "[a-z]{1,20}", d1 in "[a-f0-9]{8}", d2 in "[a-f0-9]{8}") {
            prop_assume!(d1 != d2);
            let key = test_key();
            let encrypted = encrypt_filename(&name, &d1, NameEncoding::Base64Url, &key).unwrap();
            let result = decrypt_filename(&encrypted, &d2, NameEncoding::Base64Url, &key);
            prop_assert!(result.is_err());
        }
    }
}
