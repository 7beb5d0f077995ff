//! Vault model, configuration files and lifecycle

pub mod config;
pub mod master_key;
pub mod provider;
pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cloud::CloudFolder;

// Re-export commonly used types
pub use config::{
    CipherCombo, ClaimValidationError, VaultConfig, VaultConfigCreationError,
    VaultConfigurationClaims, create_vault_config, peek_vault_config, validate_vault_claims,
};
pub use master_key::{
    MasterKeyCreationError, MasterKeyFile, ScryptParams, create_masterkey_file,
    normalize_passphrase,
};
pub use provider::{MasterkeyCryptoCloudProvider, VaultProviderError};
pub use registry::{CryptorRegistry, CryptorStore, InMemoryCryptorStore, MissingCryptor};

/// Oldest vault format this crate opens.
pub const MIN_VAULT_VERSION: u32 = 5;

/// Newest vault format this crate opens.
pub const MAX_VAULT_VERSION: u32 = 8;

/// First vault format with the `.c9r`/`.c9s` layout and Base64url names.
pub const FORMAT7: u32 = 7;

/// Identity of a vault: the backend it lives in and its folder there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VaultKey {
    pub cloud_id: String,
    pub path: String,
}

impl fmt::Display for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cloud_id, self.path)
    }
}

/// A vault as the user knows it.
///
/// `format` and `max_file_name_length` are only known after the first
/// unlock; the provider fills them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vault {
    pub cloud_id: String,
    pub folder: CloudFolder,
    pub name: String,
    pub format: Option<u32>,
    pub max_file_name_length: Option<usize>,
    pub unlocked: bool,
    pub position: u32,
}

impl Vault {
    pub fn new(cloud_id: impl Into<String>, folder: CloudFolder) -> Self {
        let name = folder.name().to_string();
        Self {
            cloud_id: cloud_id.into(),
            folder,
            name,
            format: None,
            max_file_name_length: None,
            unlocked: false,
            position: 0,
        }
    }

    pub fn key(&self) -> VaultKey {
        VaultKey {
            cloud_id: self.cloud_id.clone(),
            path: self.folder.path().to_string(),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.format.is_some_and(|v| v < FORMAT7)
    }
}

/// Shared cancellation flag for long-running vault operations.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_identity() {
        let a = Vault::new("local:/tmp", CloudFolder::at("/vaults/My Vault"));
        assert_eq!(a.name, "My Vault");
        let mut b = a.clone();
        b.unlocked = true;
        b.position = 3;
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "local:/tmp:/vaults/My Vault");
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }
}
