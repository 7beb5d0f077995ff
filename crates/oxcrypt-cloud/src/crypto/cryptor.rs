//! The `Cryptor` capability handed to the filesystem layer.
//!
//! A cryptor bundles everything the decorators need from an unlocked vault:
//! name encryption, directory ID hashing and chunked content encryption. The
//! filesystem layer never touches key material directly, it only holds an
//! `Arc<dyn Cryptor>` looked up from the registry.

use std::fmt;
use std::sync::Arc;

use super::keys::MasterKey;
use crate::fs::file::{
    self, CLEARTEXT_CHUNK_SIZE, FileContext, FileDecryptionError, FileEncryptionError, FileHeader,
    GCM_CHUNK_SIZE, GCM_HEADER_SIZE, GCM_NONCE_SIZE,
};
use crate::fs::file_ctrmac::{self, CTRMAC_CHUNK_SIZE, CTRMAC_HEADER_SIZE, CTRMAC_NONCE_SIZE};
use crate::fs::name::{self, NameEncoding, NameError};
use crate::vault::config::CipherCombo;

/// Cryptographic operations of an unlocked vault.
pub trait Cryptor: Send + Sync + fmt::Debug {
    /// Hash a directory ID to its 32-character physical folder name.
    fn hash_directory_id(&self, dir_id: &str) -> Result<String, NameError>;

    /// Encrypt `name` bound to the folder `dir_id`.
    fn encrypt_filename(
        &self,
        encoding: NameEncoding,
        name: &str,
        dir_id: &str,
    ) -> Result<String, NameError>;

    /// Decrypt a ciphertext name found inside the folder `dir_id`.
    fn decrypt_filename(
        &self,
        encoding: NameEncoding,
        ciphertext_name: &str,
        dir_id: &str,
    ) -> Result<String, NameError>;

    fn create_header(&self) -> FileHeader;
    fn header_size(&self) -> usize;
    fn encrypt_header(
        &self,
        header: &FileHeader,
        context: &FileContext,
    ) -> Result<Vec<u8>, FileEncryptionError>;
    fn decrypt_header(
        &self,
        ciphertext: &[u8],
        context: &FileContext,
    ) -> Result<FileHeader, FileDecryptionError>;

    fn cleartext_chunk_size(&self) -> usize;
    fn ciphertext_chunk_size(&self) -> usize;
    fn encrypt_chunk(
        &self,
        cleartext: &[u8],
        chunk_number: u64,
        header: &FileHeader,
        context: &FileContext,
    ) -> Result<Vec<u8>, FileEncryptionError>;
    fn decrypt_chunk(
        &self,
        ciphertext: &[u8],
        chunk_number: u64,
        header: &FileHeader,
        context: &FileContext,
    ) -> Result<Vec<u8>, FileDecryptionError>;

    /// Wipe the key material. Every later operation fails.
    fn destroy(&self);
    fn is_destroyed(&self) -> bool;

    /// Size of the encrypted chunks for `cleartext_size` bytes, header excluded.
    fn ciphertext_size(&self, cleartext_size: u64) -> u64 {
        let cleartext_chunk = self.cleartext_chunk_size() as u64;
        let ciphertext_chunk = self.ciphertext_chunk_size() as u64;
        let overhead = ciphertext_chunk - cleartext_chunk;

        let full_chunks = cleartext_size / cleartext_chunk;
        let remainder = cleartext_size % cleartext_chunk;
        let trailing = if remainder == 0 { 0 } else { remainder + overhead };
        full_chunks * ciphertext_chunk + trailing
    }

    /// Inverse of [`Cryptor::ciphertext_size`], header excluded.
    ///
    /// Returns `None` when the size cannot come from a well-formed file, i.e.
    /// a trailing partial chunk no larger than the per-chunk overhead.
    fn cleartext_size(&self, ciphertext_size: u64) -> Option<u64> {
        let cleartext_chunk = self.cleartext_chunk_size() as u64;
        let ciphertext_chunk = self.ciphertext_chunk_size() as u64;
        let overhead = ciphertext_chunk - cleartext_chunk;

        let full_chunks = ciphertext_size / ciphertext_chunk;
        let remainder = ciphertext_size % ciphertext_chunk;
        if remainder > 0 && remainder <= overhead {
            return None;
        }
        let trailing = if remainder == 0 { 0 } else { remainder - overhead };
        Some(full_chunks * cleartext_chunk + trailing)
    }

    /// Cleartext size of a whole ciphertext file, header included.
    fn cleartext_file_size(&self, ciphertext_file_size: u64) -> Option<u64> {
        ciphertext_file_size
            .checked_sub(self.header_size() as u64)
            .and_then(|payload| self.cleartext_size(payload))
    }

    /// Total ciphertext file size for `cleartext_size` bytes, header included.
    fn ciphertext_file_size(&self, cleartext_size: u64) -> u64 {
        self.ciphertext_size(cleartext_size) + self.header_size() as u64
    }
}

/// [`Cryptor`] over a [`MasterKey`] and a [`CipherCombo`].
///
/// Names always use AES-SIV; content uses AES-GCM or AES-CTR + HMAC depending
/// on the combo.
#[derive(Debug)]
pub struct VaultCryptor {
    master_key: Arc<MasterKey>,
    combo: CipherCombo,
}

impl VaultCryptor {
    pub fn new(master_key: Arc<MasterKey>, combo: CipherCombo) -> Self {
        Self { master_key, combo }
    }

    pub fn cipher_combo(&self) -> CipherCombo {
        self.combo
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }
}

impl Cryptor for VaultCryptor {
    fn hash_directory_id(&self, dir_id: &str) -> Result<String, NameError> {
        name::hash_dir_id(dir_id, &self.master_key)
    }

    fn encrypt_filename(
        &self,
        encoding: NameEncoding,
        name: &str,
        dir_id: &str,
    ) -> Result<String, NameError> {
        name::encrypt_filename(name, dir_id, encoding, &self.master_key)
    }

    fn decrypt_filename(
        &self,
        encoding: NameEncoding,
        ciphertext_name: &str,
        dir_id: &str,
    ) -> Result<String, NameError> {
        name::decrypt_filename(ciphertext_name, dir_id, encoding, &self.master_key)
    }

    fn create_header(&self) -> FileHeader {
        match self.combo {
            CipherCombo::SivGcm => FileHeader::random(GCM_NONCE_SIZE),
            CipherCombo::SivCtrMac => FileHeader::random(CTRMAC_NONCE_SIZE),
        }
    }

    fn header_size(&self) -> usize {
        match self.combo {
            CipherCombo::SivGcm => GCM_HEADER_SIZE,
            CipherCombo::SivCtrMac => CTRMAC_HEADER_SIZE,
        }
    }

    fn encrypt_header(
        &self,
        header: &FileHeader,
        context: &FileContext,
    ) -> Result<Vec<u8>, FileEncryptionError> {
        match self.combo {
            CipherCombo::SivGcm => file::encrypt_header(header, &self.master_key, context),
            CipherCombo::SivCtrMac => file_ctrmac::encrypt_header(header, &self.master_key, context),
        }
    }

    fn decrypt_header(
        &self,
        ciphertext: &[u8],
        context: &FileContext,
    ) -> Result<FileHeader, FileDecryptionError> {
        match self.combo {
            CipherCombo::SivGcm => file::decrypt_header(ciphertext, &self.master_key, context),
            CipherCombo::SivCtrMac => {
                file_ctrmac::decrypt_header(ciphertext, &self.master_key, context)
            }
        }
    }

    fn cleartext_chunk_size(&self) -> usize {
        CLEARTEXT_CHUNK_SIZE
    }

    fn ciphertext_chunk_size(&self) -> usize {
        match self.combo {
            CipherCombo::SivGcm => GCM_CHUNK_SIZE,
            CipherCombo::SivCtrMac => CTRMAC_CHUNK_SIZE,
        }
    }

    fn encrypt_chunk(
        &self,
        cleartext: &[u8],
        chunk_number: u64,
        header: &FileHeader,
        context: &FileContext,
    ) -> Result<Vec<u8>, FileEncryptionError> {
        match self.combo {
            CipherCombo::SivGcm => file::encrypt_chunk(cleartext, chunk_number, header, context),
            CipherCombo::SivCtrMac => file_ctrmac::encrypt_chunk(
                cleartext,
                chunk_number,
                header,
                &self.master_key,
                context,
            ),
        }
    }

    fn decrypt_chunk(
        &self,
        ciphertext: &[u8],
        chunk_number: u64,
        header: &FileHeader,
        context: &FileContext,
    ) -> Result<Vec<u8>, FileDecryptionError> {
        match self.combo {
            CipherCombo::SivGcm => file::decrypt_chunk(ciphertext, chunk_number, header, context),
            CipherCombo::SivCtrMac => file_ctrmac::decrypt_chunk(
                ciphertext,
                chunk_number,
                header,
                &self.master_key,
                context,
            ),
        }
    }

    fn destroy(&self) {
        self.master_key.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.master_key.is_destroyed()
    }
}
