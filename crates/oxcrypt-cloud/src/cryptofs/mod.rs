//! The encrypted virtual filesystem.
//!
//! [`CryptoCloud`] exposes a cleartext, filesystem-shaped view of a vault
//! stored in a [`CloudStore`]. Requests go to the decorator matching the
//! vault's format, which maps names through the vault's cryptor and keeps
//! the directory ID cache current.

pub mod decorator;
pub mod dir_id_cache;
pub mod format7;
pub mod node;
pub mod pre7;

use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::cloud::{CloudError, CloudFolder, CloudStore, ProgressAware};
use crate::fs::file::{FileDecryptionError, FileEncryptionError};
use crate::fs::name::NameError;
use crate::vault::config::{DEFAULT_SHORTENING_THRESHOLD, LEGACY_SHORTENING_THRESHOLD};
use crate::vault::registry::{CryptorRegistry, MissingCryptor};
use crate::vault::{FORMAT7, MAX_VAULT_VERSION, MIN_VAULT_VERSION, Vault};

pub use decorator::{FormatContext, VaultFormatDecorator};
pub use dir_id_cache::{DirIdCache, PathDirIdCache, TimestampDirIdCache};
pub use format7::Format7Decorator;
pub use node::{CryptoFile, CryptoFolder, CryptoNode, CryptoSymlink, DirIdInfo};
pub use pre7::Pre7Decorator;

/// Encrypted copy of a folder's own directory ID, kept in its physical folder.
pub const DIR_ID_BACKUP_FILENAME: &str = "dirid.c9r";

/// Physical folder `d/<first 2>/<remaining 30>` for a hashed directory ID.
pub fn physical_folder(vault_folder: &CloudFolder, hashed_dir_id: &str) -> CloudFolder {
    let (first, rest) = hashed_dir_id
        .split_at_checked(2)
        .unwrap_or((hashed_dir_id, ""));
    vault_folder.folder("d").folder(first).folder(rest)
}

#[derive(Error, Debug)]
pub enum CryptoFsError {
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// The folder's dir file exists but is empty. The folder is damaged, its
    /// contents cannot be located.
    #[error("Empty directory file at {path}")]
    EmptyDirFile { path: String },

    #[error("Invalid directory ID in {path}: {reason}")]
    InvalidDirId { path: String, reason: String },

    #[error(transparent)]
    MissingCryptor(#[from] MissingCryptor),

    #[error("Name error: {0}")]
    Name(#[from] NameError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] FileEncryptionError),

    #[error("Decryption error: {0}")]
    Decryption(#[from] FileDecryptionError),

    #[error("Already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Vault format {0:?} is not supported")]
    UnsupportedVaultFormat(Option<u32>),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CryptoFsError {
    pub fn is_already_exists(&self) -> bool {
        match self {
            CryptoFsError::AlreadyExists { .. } => true,
            CryptoFsError::Cloud(e) => e.is_already_exists(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CryptoFsError::Cloud(e) if e.is_not_found())
    }
}

/// The decorator of a vault, fixed when the vault is opened.
#[derive(Debug)]
pub enum VaultFormat {
    Format7(Format7Decorator),
    Pre7(Pre7Decorator),
}

impl VaultFormat {
    pub fn decorator(&self) -> &dyn VaultFormatDecorator {
        match self {
            VaultFormat::Format7(d) => d,
            VaultFormat::Pre7(d) => d,
        }
    }
}

/// Cleartext view of an unlocked vault.
#[derive(Debug)]
pub struct CryptoCloud {
    vault: Vault,
    format: VaultFormat,
}

impl CryptoCloud {
    /// Open `vault`, which must have been unlocked so its format is known.
    ///
    /// The cryptor is looked up on every operation: locking the vault makes
    /// later calls fail with `MissingCryptor`.
    pub fn new(
        vault: &Vault,
        cloud: Arc<dyn CloudStore>,
        registry: &Arc<CryptorRegistry>,
    ) -> Result<Self, CryptoFsError> {
        let version = vault
            .format
            .filter(|v| (MIN_VAULT_VERSION..=MAX_VAULT_VERSION).contains(v))
            .ok_or(CryptoFsError::UnsupportedVaultFormat(vault.format))?;

        let default_threshold = if version >= FORMAT7 {
            DEFAULT_SHORTENING_THRESHOLD
        } else {
            LEGACY_SHORTENING_THRESHOLD
        };
        let context = FormatContext {
            cloud,
            cryptor: registry.supplier(vault.key()),
            vault_folder: vault.folder.clone(),
            shortening_threshold: vault.max_file_name_length.unwrap_or(default_threshold),
        };

        let format = if version >= FORMAT7 {
            VaultFormat::Format7(Format7Decorator::new(context, version))
        } else {
            VaultFormat::Pre7(Pre7Decorator::new(context))
        };
        debug!(version, vault = %vault.folder, "Opened vault");
        Ok(Self {
            vault: vault.clone(),
            format,
        })
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    pub fn format(&self) -> &VaultFormat {
        &self.format
    }

    fn decorator(&self) -> &dyn VaultFormatDecorator {
        self.format.decorator()
    }

    pub fn root(&self) -> CryptoFolder {
        self.decorator().root()
    }

    pub fn resolve(&self, path: &str) -> Result<CryptoFolder, CryptoFsError> {
        self.decorator().resolve(path)
    }

    pub fn folder(&self, parent: &CryptoFolder, name: &str) -> Result<CryptoFolder, CryptoFsError> {
        self.decorator().folder(parent, name)
    }

    pub fn file(
        &self,
        parent: &CryptoFolder,
        name: &str,
        size: Option<u64>,
    ) -> Result<CryptoFile, CryptoFsError> {
        self.decorator().file(parent, name, size)
    }

    pub fn exists(&self, node: &CryptoNode) -> Result<bool, CryptoFsError> {
        self.decorator().exists(node)
    }

    pub fn list(&self, folder: &CryptoFolder) -> Result<Vec<CryptoNode>, CryptoFsError> {
        self.decorator().list(folder)
    }

    pub fn create(&self, folder: &CryptoFolder) -> Result<CryptoFolder, CryptoFsError> {
        self.decorator().create(folder)
    }

    pub fn move_folder(
        &self,
        source: &CryptoFolder,
        target: &CryptoFolder,
    ) -> Result<CryptoFolder, CryptoFsError> {
        self.decorator().move_folder(source, target)
    }

    pub fn move_file(&self, source: &CryptoFile, target: &CryptoFile) -> Result<CryptoFile, CryptoFsError> {
        self.decorator().move_file(source, target)
    }

    pub fn delete(&self, node: &CryptoNode) -> Result<(), CryptoFsError> {
        self.decorator().delete(node)
    }

    pub fn write(
        &self,
        file: &CryptoFile,
        data: &mut dyn Read,
        progress: &dyn ProgressAware,
        replace: bool,
        length: u64,
    ) -> Result<CryptoFile, CryptoFsError> {
        self.decorator().write(file, data, progress, replace, length)
    }

    pub fn read(
        &self,
        file: &CryptoFile,
        sink: &mut dyn Write,
        progress: &dyn ProgressAware,
    ) -> Result<(), CryptoFsError> {
        self.decorator().read(file, sink, progress)
    }

    /// Write a small in-memory file.
    #[instrument(level = "debug", skip(self, content), fields(file = %file))]
    pub fn write_bytes(
        &self,
        file: &CryptoFile,
        content: &[u8],
        replace: bool,
    ) -> Result<CryptoFile, CryptoFsError> {
        let mut reader = content;
        self.write(
            file,
            &mut reader,
            &crate::cloud::NoProgress,
            replace,
            content.len() as u64,
        )
    }

    /// Read a small file completely.
    pub fn read_bytes(&self, file: &CryptoFile) -> Result<Vec<u8>, CryptoFsError> {
        let mut out = Vec::new();
        self.read(file, &mut out, &crate::cloud::NoProgress)?;
        Ok(out)
    }
}
