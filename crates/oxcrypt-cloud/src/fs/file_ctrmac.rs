//! AES-CTR + HMAC-SHA256 file encryption for the `SIV_CTRMAC` cipher combo.
//!
//! Used by vault formats 5 to 7, and by format 8 vaults whose configuration
//! declares `SIV_CTRMAC`.
//!
//! # File Header Format (88 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Nonce (IV for AES-CTR) |
//! | 16     | 40   | Encrypted payload (8 reserved bytes + 32-byte content key) |
//! | 56     | 32   | HMAC-SHA256 over nonce + encrypted payload |
//!
//! # Content Chunk Format (up to 32816 bytes)
//!
//! | Offset | Size | Description |
//! |--------|------|-------------|
//! | 0      | 16   | Chunk nonce |
//! | 16     | n    | AES-CTR encrypted payload (up to 32768 bytes) |
//! | 16+n   | 32   | HMAC-SHA256 over (header nonce + chunk number + chunk nonce + ciphertext) |

use aes::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use ring::hmac;
use subtle::ConstantTimeEq;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use super::file::{
    CLEARTEXT_CHUNK_SIZE, FileContext, FileDecryptionError, FileEncryptionError, FileHeader,
    HEADER_PAYLOAD_SIZE,
};
use crate::crypto::keys::MasterKey;

pub const CTRMAC_NONCE_SIZE: usize = 16;
pub const MAC_SIZE: usize = 32;
pub const CTRMAC_HEADER_SIZE: usize = CTRMAC_NONCE_SIZE + HEADER_PAYLOAD_SIZE + MAC_SIZE;
pub const CTRMAC_CHUNK_SIZE: usize = CTRMAC_NONCE_SIZE + CLEARTEXT_CHUNK_SIZE + MAC_SIZE;

/// AES-256-CTR with a big-endian 128-bit counter.
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

fn nonce_array(nonce: &[u8]) -> Option<[u8; CTRMAC_NONCE_SIZE]> {
    nonce.try_into().ok()
}

fn chunk_mac(
    mac_key: &[u8; 32],
    header_nonce: &[u8],
    chunk_number: u64,
    chunk_nonce: &[u8],
    ciphertext: &[u8],
) -> hmac::Tag {
    let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
    let mut ctx = hmac::Context::with_key(&key);
    ctx.update(header_nonce);
    ctx.update(&chunk_number.to_be_bytes());
    ctx.update(chunk_nonce);
    ctx.update(ciphertext);
    ctx.sign()
}

/// Encrypt a file header: AES-CTR under the vault AES key, then HMAC.
pub fn encrypt_header(
    header: &FileHeader,
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<Vec<u8>, FileEncryptionError> {
    let nonce = nonce_array(&header.nonce).ok_or_else(|| FileEncryptionError::HeaderEncryption {
        reason: format!(
            "expected {CTRMAC_NONCE_SIZE}-byte header nonce, got {}",
            header.nonce.len()
        ),
        context: context.clone(),
    })?;

    let mut payload = Zeroizing::new(Vec::with_capacity(HEADER_PAYLOAD_SIZE));
    payload.extend_from_slice(&[0xFF; 8]);
    payload.extend_from_slice(&header.content_key[..]);

    master_key.with_aes_key(|aes_key| {
        let mut cipher = Aes256Ctr::new(aes_key.into(), (&nonce).into());
        cipher.apply_keystream(&mut payload);
    })?;

    let mut encrypted = Vec::with_capacity(CTRMAC_HEADER_SIZE);
    encrypted.extend_from_slice(&nonce);
    encrypted.extend_from_slice(&payload);

    let mac = master_key.with_mac_key(|mac_key| {
        hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, mac_key), &encrypted)
    })?;
    encrypted.extend_from_slice(mac.as_ref());
    Ok(encrypted)
}

/// Decrypt an 88-byte header, verifying its MAC before decrypting.
pub fn decrypt_header(
    encrypted_header: &[u8],
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<FileHeader, FileDecryptionError> {
    trace!("Decrypting CTRMAC file header");

    if encrypted_header.len() != CTRMAC_HEADER_SIZE {
        warn!(
            actual_size = encrypted_header.len(),
            expected_size = CTRMAC_HEADER_SIZE,
            "Invalid header size"
        );
        return Err(FileDecryptionError::InvalidHeader {
            reason: format!(
                "expected {CTRMAC_HEADER_SIZE} bytes, got {} bytes",
                encrypted_header.len()
            ),
            context: context.clone(),
        });
    }

    let (authenticated, expected_mac) =
        encrypted_header.split_at(CTRMAC_NONCE_SIZE + HEADER_PAYLOAD_SIZE);
    let mac_ok = master_key.with_mac_key(|mac_key| {
        let computed = hmac::sign(&hmac::Key::new(hmac::HMAC_SHA256, mac_key), authenticated);
        bool::from(computed.as_ref().ct_eq(expected_mac))
    })?;
    if !mac_ok {
        warn!("Header HMAC verification failed");
        return Err(FileDecryptionError::HeaderDecryption {
            context: context.clone(),
        });
    }

    let (nonce, ciphertext) = authenticated.split_at(CTRMAC_NONCE_SIZE);
    let mut plaintext = Zeroizing::new(ciphertext.to_vec());
    master_key.with_aes_key(|aes_key| {
        let mut cipher = Aes256Ctr::new(aes_key.into(), nonce.into());
        cipher.apply_keystream(&mut plaintext);
    })?;

    if plaintext[..8] != [0xFF; 8] {
        debug!(
            reserved_bytes = ?hex::encode(&plaintext[..8]),
            "Header has non-standard reserved bytes"
        );
    }

    let mut content_key = Zeroizing::new([0u8; 32]);
    content_key.copy_from_slice(&plaintext[8..HEADER_PAYLOAD_SIZE]);
    Ok(FileHeader {
        nonce: nonce.to_vec(),
        content_key,
    })
}

/// Encrypt one cleartext chunk. The MAC is keyed with the vault MAC key.
pub fn encrypt_chunk(
    cleartext: &[u8],
    chunk_number: u64,
    header: &FileHeader,
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<Vec<u8>, FileEncryptionError> {
    if header.nonce.len() != CTRMAC_NONCE_SIZE {
        return Err(FileEncryptionError::ContentEncryption {
            reason: format!(
                "expected {CTRMAC_NONCE_SIZE}-byte header nonce, got {}",
                header.nonce.len()
            ),
            context: context.clone().with_chunk(chunk_number),
        });
    }

    let mut chunk_nonce = [0u8; CTRMAC_NONCE_SIZE];
    rand::rng().fill_bytes(&mut chunk_nonce);

    let mut ciphertext = cleartext.to_vec();
    let mut cipher = Aes256Ctr::new((&*header.content_key).into(), (&chunk_nonce).into());
    cipher.apply_keystream(&mut ciphertext);

    let mac = master_key.with_mac_key(|mac_key| {
        chunk_mac(mac_key, &header.nonce, chunk_number, &chunk_nonce, &ciphertext)
    })?;

    let mut chunk = Vec::with_capacity(CTRMAC_NONCE_SIZE + ciphertext.len() + MAC_SIZE);
    chunk.extend_from_slice(&chunk_nonce);
    chunk.extend_from_slice(&ciphertext);
    chunk.extend_from_slice(mac.as_ref());
    Ok(chunk)
}

/// Decrypt one ciphertext chunk, verifying its MAC first.
pub fn decrypt_chunk(
    chunk: &[u8],
    chunk_number: u64,
    header: &FileHeader,
    master_key: &MasterKey,
    context: &FileContext,
) -> Result<Vec<u8>, FileDecryptionError> {
    let min_chunk_size = CTRMAC_NONCE_SIZE + MAC_SIZE;
    if chunk.len() < min_chunk_size {
        warn!(chunk = chunk_number, actual_size = chunk.len(), "Incomplete chunk");
        return Err(FileDecryptionError::IncompleteChunk {
            context: context.clone().with_chunk(chunk_number),
            expected: min_chunk_size,
            actual_size: chunk.len(),
        });
    }

    let (chunk_nonce, rest) = chunk.split_at(CTRMAC_NONCE_SIZE);
    let (ciphertext, expected_mac) = rest.split_at(rest.len() - MAC_SIZE);

    let mac_ok = master_key.with_mac_key(|mac_key| {
        let computed = chunk_mac(mac_key, &header.nonce, chunk_number, chunk_nonce, ciphertext);
        bool::from(computed.as_ref().ct_eq(expected_mac))
    })?;
    if !mac_ok {
        warn!(chunk = chunk_number, "Chunk HMAC verification failed");
        return Err(FileDecryptionError::ContentDecryption {
            context: context.clone().with_chunk(chunk_number),
        });
    }

    let mut plaintext = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new((&*header.content_key).into(), chunk_nonce.into());
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}
