//! File header and content chunk encryption for the `SIV_GCM` cipher combo.
//!
//! # File Header Format (68 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 12   | Header nonce |
//! | 12     | 40   | AES-GCM encrypted payload (8 reserved `0xFF` bytes + 32-byte content key) |
//! | 52     | 16   | GCM tag |
//!
//! # Content Chunk Format (up to 32796 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 12   | Chunk nonce |
//! | 12     | n    | AES-GCM ciphertext (up to 32768 bytes) |
//! | 12+n   | 16   | GCM tag |
//!
//! Each chunk authenticates `chunk_number (8 bytes BE) || header nonce` as
//! associated data, so chunks cannot be reordered or moved between files.

use std::{fmt, io};

use aead::Payload;
use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::crypto::keys::{KeyAccessError, MasterKey};

/// Cleartext bytes per content chunk, shared by both cipher combos.
pub const CLEARTEXT_CHUNK_SIZE: usize = 32 * 1024;

pub const GCM_NONCE_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
pub const GCM_HEADER_SIZE: usize = GCM_NONCE_SIZE + HEADER_PAYLOAD_SIZE + GCM_TAG_SIZE;
pub const GCM_CHUNK_SIZE: usize = GCM_NONCE_SIZE + CLEARTEXT_CHUNK_SIZE + GCM_TAG_SIZE;

/// 8 reserved bytes + 32-byte content key.
pub(crate) const HEADER_PAYLOAD_SIZE: usize = 40;

/// Context for file operations, providing debugging information.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    /// The cleartext path (if known)
    pub path: Option<String>,
    /// The ciphertext location in the cloud store
    pub cloud_path: Option<String>,
    /// The chunk number (for content errors)
    pub chunk_number: Option<u64>,
}

impl FileContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_cloud_path(mut self, path: impl Into<String>) -> Self {
        self.cloud_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_chunk(mut self, chunk_number: u64) -> Self {
        self.chunk_number = Some(chunk_number);
        self
    }
}

impl fmt::Display for FileContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref path) = self.path {
            parts.push(format!("file '{path}'"));
        }
        if let Some(chunk) = self.chunk_number {
            parts.push(format!("chunk {chunk}"));
        }
        if let Some(ref cloud_path) = self.cloud_path {
            parts.push(format!("at {cloud_path}"));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum FileDecryptionError {
    /// Header authentication failed.
    ///
    /// **[INTEGRITY VIOLATION]** The header was tampered with or belongs to another vault.
    #[error(
        "Failed to decrypt header for {context}: authentication failed - possible tampering or wrong key"
    )]
    HeaderDecryption { context: FileContext },

    /// Chunk authentication failed.
    ///
    /// **[INTEGRITY VIOLATION]** A chunk was tampered with, reordered or truncated.
    #[error(
        "Failed to decrypt content for {context}: authentication failed - possible tampering or wrong key"
    )]
    ContentDecryption { context: FileContext },

    #[error("Invalid file header for {context}: {reason}")]
    InvalidHeader { reason: String, context: FileContext },

    #[error("Incomplete chunk for {context}: expected at least {expected} bytes, got {actual_size}")]
    IncompleteChunk {
        context: FileContext,
        expected: usize,
        actual_size: usize,
    },

    #[error("IO error reading {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: FileContext,
    },

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl FileDecryptionError {
    #[must_use]
    pub fn io_with_context(source: io::Error, context: FileContext) -> Self {
        FileDecryptionError::Io { source, context }
    }
}

#[derive(Error, Debug)]
pub enum FileEncryptionError {
    #[error("Failed to encrypt header for {context}: {reason}")]
    HeaderEncryption { reason: String, context: FileContext },

    #[error("Failed to encrypt content for {context}: {reason}")]
    ContentEncryption { reason: String, context: FileContext },

    #[error("IO error writing {context}: {source}")]
    Io {
        #[source]
        source: io::Error,
        context: FileContext,
    },

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

impl FileEncryptionError {
    #[must_use]
    pub fn io_with_context(source: io::Error, context: FileContext) -> Self {
        FileEncryptionError::Io { source, context }
    }
}

/// Cleartext file header: the per-file nonce and content key.
///
/// The nonce is 12 bytes for `SIV_GCM` and 16 bytes for `SIV_CTRMAC`. The
/// content key is zeroized on drop and redacted from `Debug` output.
pub struct FileHeader {
    pub nonce: Vec<u8>,
    pub content_key: Zeroizing<[u8; 32]>,
}

impl FileHeader {
    /// Fresh header with a random nonce of `nonce_len` bytes and a random content key.
    pub fn random(nonce_len: usize) -> Self {
        let mut nonce = vec![0u8; nonce_len];
        rand::rng().fill_bytes(&mut nonce);
        let mut content_key = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(&mut content_key[..]);
        FileHeader { nonce, content_key }
    }
}

impl fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("nonce", &hex::encode(&self.nonce))
            .field("content_key", &"[REDACTED]")
            .finish()
    }
}

fn chunk_aad(chunk_number: u64, header_nonce: &[u8]) -> [u8; 8 + GCM_NONCE_SIZE] {
    let mut aad = [0u8; 8 + GCM_NONCE_SIZE];
    aad[..8].copy_from_slice(&chunk_number.to_be_bytes());
    aad[8..].copy_from_slice(header_nonce);
    aad
}

fn check_header_nonce(header: &FileHeader, context: &FileContext) -> Result<(), String> {
    if header.nonce.len() == GCM_NONCE_SIZE {
        Ok(())
    } else {
        warn!(nonce_len = header.nonce.len(), %context, "Header nonce has wrong size for AES-GCM");
        Err(format!(
            "expected {GCM_NONCE_SIZE}-byte header nonce, got {}",
            header.nonce.len()
        ))
    }
}

/// Encrypt a file header under the vault's AES key.
pub fn encrypt_header(
    header: &FileHeader,
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<Vec<u8>, FileEncryptionError> {
    check_header_nonce(header, context).map_err(|reason| FileEncryptionError::HeaderEncryption {
        reason,
        context: context.clone(),
    })?;

    let mut plaintext = Zeroizing::new(Vec::with_capacity(HEADER_PAYLOAD_SIZE));
    plaintext.extend_from_slice(&[0xFF; 8]);
    plaintext.extend_from_slice(&header.content_key[..]);

    master_key.with_aes_key(|aes_key| {
        let key: &Key<Aes256Gcm> = aes_key.into();
        let cipher = Aes256Gcm::new(key);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&header.nonce), plaintext.as_slice())
            .map_err(|e| FileEncryptionError::HeaderEncryption {
                reason: e.to_string(),
                context: context.clone(),
            })?;

        let mut encrypted_header = Vec::with_capacity(GCM_HEADER_SIZE);
        encrypted_header.extend_from_slice(&header.nonce);
        encrypted_header.extend_from_slice(&ciphertext);
        Ok(encrypted_header)
    })?
}

/// Decrypt a 68-byte file header.
pub fn decrypt_header(
    encrypted_header: &[u8],
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<FileHeader, FileDecryptionError> {
    trace!("Decrypting file header");

    if encrypted_header.len() != GCM_HEADER_SIZE {
        warn!(actual_size = encrypted_header.len(), "Invalid header size");
        return Err(FileDecryptionError::InvalidHeader {
            reason: format!(
                "expected {GCM_HEADER_SIZE} bytes, got {} bytes",
                encrypted_header.len()
            ),
            context: context.clone(),
        });
    }

    let nonce = &encrypted_header[..GCM_NONCE_SIZE];
    let ciphertext_with_tag = &encrypted_header[GCM_NONCE_SIZE..];

    master_key.with_aes_key(|aes_key| {
        let key: &Key<Aes256Gcm> = aes_key.into();
        let cipher = Aes256Gcm::new(key);
        let decrypted = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext_with_tag)
                .map_err(|_| {
                    warn!("Header decryption failed - authentication tag mismatch");
                    FileDecryptionError::HeaderDecryption {
                        context: context.clone(),
                    }
                })?,
        );

        // Reserved bytes are not validated, only logged.
        if decrypted[..8] != [0xFF; 8] {
            debug!(
                reserved_bytes = ?hex::encode(&decrypted[..8]),
                "Header has non-standard reserved bytes"
            );
        }

        let mut content_key = Zeroizing::new([0u8; 32]);
        content_key.copy_from_slice(&decrypted[8..HEADER_PAYLOAD_SIZE]);
        Ok(FileHeader {
            nonce: nonce.to_vec(),
            content_key,
        })
    })?
}

/// Encrypt one cleartext chunk of at most [`CLEARTEXT_CHUNK_SIZE`] bytes.
pub fn encrypt_chunk(
    cleartext: &[u8],
    chunk_number: u64,
    header: &FileHeader,
    context: &FileContext,
) -> Result<Vec<u8>, FileEncryptionError> {
    let content_error = |reason: String| FileEncryptionError::ContentEncryption {
        reason,
        context: context.clone().with_chunk(chunk_number),
    };
    check_header_nonce(header, context).map_err(content_error)?;

    let key = Key::<Aes256Gcm>::from_slice(&header.content_key[..]);
    let cipher = Aes256Gcm::new(key);

    let mut chunk_nonce = [0u8; GCM_NONCE_SIZE];
    rand::rng().fill_bytes(&mut chunk_nonce);
    let aad = chunk_aad(chunk_number, &header.nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&chunk_nonce),
            Payload {
                msg: cleartext,
                aad: &aad,
            },
        )
        .map_err(|e| content_error(e.to_string()))?;

    let mut chunk = Vec::with_capacity(GCM_NONCE_SIZE + ciphertext.len());
    chunk.extend_from_slice(&chunk_nonce);
    chunk.extend_from_slice(&ciphertext);
    Ok(chunk)
}

/// Decrypt one ciphertext chunk.
pub fn decrypt_chunk(
    chunk: &[u8],
    chunk_number: u64,
    header: &FileHeader,
    context: &FileContext,
) -> Result<Vec<u8>, FileDecryptionError> {
    let chunk_context = || context.clone().with_chunk(chunk_number);

    if chunk.len() < GCM_NONCE_SIZE + GCM_TAG_SIZE {
        warn!(chunk = chunk_number, actual_size = chunk.len(), "Incomplete chunk");
        return Err(FileDecryptionError::IncompleteChunk {
            context: chunk_context(),
            expected: GCM_NONCE_SIZE + GCM_TAG_SIZE,
            actual_size: chunk.len(),
        });
    }
    check_header_nonce(header, context).map_err(|reason| FileDecryptionError::InvalidHeader {
        reason,
        context: chunk_context(),
    })?;

    let key = Key::<Aes256Gcm>::from_slice(&header.content_key[..]);
    let cipher = Aes256Gcm::new(key);
    let aad = chunk_aad(chunk_number, &header.nonce);

    cipher
        .decrypt(
            Nonce::from_slice(&chunk[..GCM_NONCE_SIZE]),
            Payload {
                msg: &chunk[GCM_NONCE_SIZE..],
                aad: &aad,
            },
        )
        .map_err(|_| {
            warn!(chunk = chunk_number, "Chunk decryption failed - authentication tag mismatch");
            FileDecryptionError::ContentDecryption {
                context: chunk_context(),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::new([0x42; 32], [0x24; 32]).unwrap()
    }

    #[test]
    fn test_header_roundtrip() {
        let key = test_key();
        let header = FileHeader::random(GCM_NONCE_SIZE);
        let encrypted = encrypt_header(&header, &key, &FileContext::new()).unwrap();
        assert_eq!(encrypted.len(), GCM_HEADER_SIZE);
        assert_eq!(&encrypted[..GCM_NONCE_SIZE], header.nonce.as_slice());

        let decrypted = decrypt_header(&encrypted, &key, &FileContext::new()).unwrap();
        assert_eq!(decrypted.nonce, header.nonce);
        assert_eq!(*decrypted.content_key, *header.content_key);
    }

    #[test]
    fn test_header_tamper_detected() {
        let key = test_key();
        let header = FileHeader::random(GCM_NONCE_SIZE);
        let mut encrypted = encrypt_header(&header, &key, &FileContext::new()).unwrap();
        encrypted[20] ^= 0x01;
        assert!(matches!(
            decrypt_header(&encrypted, &key, &FileContext::new()),
            Err(FileDecryptionError::HeaderDecryption { .. })
        ));
        assert!(matches!(
            decrypt_header(&encrypted[..60], &key, &FileContext::new()),
            Err(FileDecryptionError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_chunk_bound_to_position_and_header() {
        let header = FileHeader::random(GCM_NONCE_SIZE);
        let other = FileHeader::random(GCM_NONCE_SIZE);
        let ctx = FileContext::new().with_path("/a.txt");

        let chunk = encrypt_chunk(b"hello chunk", 3, &header, &ctx).unwrap();
        assert_eq!(chunk.len(), 11 + GCM_NONCE_SIZE + GCM_TAG_SIZE);
        assert_eq!(decrypt_chunk(&chunk, 3, &header, &ctx).unwrap(), b"hello chunk");

        assert!(matches!(
            decrypt_chunk(&chunk, 4, &header, &ctx),
            Err(FileDecryptionError::ContentDecryption { .. })
        ));
        assert!(decrypt_chunk(&chunk, 3, &other, &ctx).is_err());
        assert!(matches!(
            decrypt_chunk(&chunk[..10], 3, &header, &ctx),
            Err(FileDecryptionError::IncompleteChunk { .. })
        ));
    }

    #[test]
    fn test_context_display() {
        let ctx = FileContext::new()
            .with_path("/docs/a.txt")
            .with_chunk(2)
            .with_cloud_path("/vault/d/AB/CDE/x.c9r");
        assert_eq!(
            ctx.to_string(),
            "file '/docs/a.txt', chunk 2, at /vault/d/AB/CDE/x.c9r"
        );
        assert_eq!(FileContext::new().to_string(), "(no context)");
    }
}
