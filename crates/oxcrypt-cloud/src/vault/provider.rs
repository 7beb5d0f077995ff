//! Vault lifecycle: create, unlock, lock and change password.
//!
//! Unlocking turns a password and the vault's master key file into a
//! [`VaultCryptor`] registered under the vault's [`VaultKey`]. Format 8
//! vaults are described by `vault.cryptomator`, whose `kid` names the master
//! key file; older vaults only have `masterkey.cryptomator`, whose `version`
//! field is authenticated by the version MAC.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::config::{
    self, CipherCombo, ClaimValidationError, DEFAULT_SHORTENING_THRESHOLD,
    LEGACY_SHORTENING_THRESHOLD, VAULT_CONFIG_FILENAME, VaultConfig, VaultConfigCreationError,
};
use super::master_key::{
    self, MASTERKEY_FILE_VERSION, MASTERKEY_FILENAME, MasterKeyCreationError, MasterKeyFile,
    ScryptParams,
};
use super::registry::CryptorRegistry;
use super::{CancelFlag, FORMAT7, MAX_VAULT_VERSION, MIN_VAULT_VERSION, Vault};
use crate::cloud::{CloudError, CloudFile, CloudFolder, CloudStore};
use crate::crypto::keys::{KeyAccessError, MasterKey};
use crate::crypto::{CryptoError, Cryptor, VaultCryptor};
use crate::cryptofs::{DIR_ID_BACKUP_FILENAME, physical_folder};
use crate::fs::file::{FileContext, FileEncryptionError};
use crate::fs::name::NameError;
use crate::fs::streaming;

#[derive(Error, Debug)]
pub enum VaultProviderError {
    #[error("A vault already exists at {path}")]
    VaultAlreadyExists { path: String },

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Unsupported vault format {version}")]
    UnsupportedVaultFormat { version: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Malformed master key file {path}: {reason}")]
    MalformedMasterKeyFile { path: String, reason: String },

    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Vault configuration error: {0}")]
    Config(#[from] ClaimValidationError),

    #[error("Failed to create vault configuration: {0}")]
    ConfigCreation(#[from] VaultConfigCreationError),

    #[error("Failed to create master key file: {0}")]
    MasterKeyCreation(#[from] MasterKeyCreationError),

    #[error("Failed to encrypt directory ID backup: {0}")]
    DirIdBackup(#[from] FileEncryptionError),

    #[error("Failed to hash root directory ID: {0}")]
    RootDirectory(#[from] NameError),

    #[error("Key access error: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Where a vault's master key lives and what the configuration says about it.
struct VaultDescriptor {
    masterkey_file: CloudFile,
    /// Raw configuration token, absent for vaults before format 8.
    config_token: Option<String>,
    /// Version declared by the unverified config, if any.
    declared_version: Option<u32>,
}

/// Vault lifecycle over master key files stored in a [`CloudStore`].
#[derive(Debug, Clone)]
pub struct MasterkeyCryptoCloudProvider {
    cloud: Arc<dyn CloudStore>,
    registry: Arc<CryptorRegistry>,
    scrypt_params: ScryptParams,
}

impl MasterkeyCryptoCloudProvider {
    pub fn new(cloud: Arc<dyn CloudStore>, registry: Arc<CryptorRegistry>) -> Self {
        Self::with_scrypt_params(cloud, registry, ScryptParams::default())
    }

    /// Provider that writes master key files with the given scrypt cost.
    pub fn with_scrypt_params(
        cloud: Arc<dyn CloudStore>,
        registry: Arc<CryptorRegistry>,
        scrypt_params: ScryptParams,
    ) -> Self {
        Self {
            cloud,
            registry,
            scrypt_params,
        }
    }

    pub fn registry(&self) -> &Arc<CryptorRegistry> {
        &self.registry
    }

    /// Create a new format 8 vault in `location`.
    ///
    /// Writes `masterkey.cryptomator`, `vault.cryptomator` and the root
    /// directory with its ID backup. The returned vault is locked.
    #[instrument(level = "info", skip(self, password, cancel), fields(location = %location))]
    pub fn create(
        &self,
        location: &CloudFolder,
        password: &str,
        cancel: &CancelFlag,
    ) -> Result<Vault, VaultProviderError> {
        let config_file = location.file(VAULT_CONFIG_FILENAME);
        let masterkey_file = location.file(MASTERKEY_FILENAME);
        if self.cloud.file_exists(&config_file)? || self.cloud.file_exists(&masterkey_file)? {
            return Err(VaultProviderError::VaultAlreadyExists {
                path: location.path().to_string(),
            });
        }

        let master_key = MasterKey::random()?;
        let passphrase = master_key::normalize_passphrase(password, MASTERKEY_FILE_VERSION);
        let masterkey_json = master_key::create_masterkey_file(
            &master_key,
            &passphrase,
            MASTERKEY_FILE_VERSION,
            self.scrypt_params,
        )?;
        if cancel.is_cancelled() {
            master_key.destroy();
            return Err(VaultProviderError::Cancelled);
        }

        let vault_config = VaultConfig::new();
        let token = config::create_vault_config(&vault_config, &master_key)?;

        match self.cloud.create(location) {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        self.cloud
            .write_bytes(&masterkey_file, masterkey_json.as_bytes(), false)?;
        self.cloud.write_bytes(&config_file, token.as_bytes(), false)?;

        let cryptor = VaultCryptor::new(Arc::new(master_key), vault_config.cipher_combo);
        let root = physical_folder(location, &cryptor.hash_directory_id("")?);
        match self.cloud.create(&root) {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
        let backup = streaming::encrypt_to_vec(
            &cryptor,
            b"",
            &FileContext::new().with_cloud_path(root.path()),
        )?;
        self.cloud
            .write_bytes(&root.file(DIR_ID_BACKUP_FILENAME), &backup, true)?;
        cryptor.destroy();

        info!(jti = %vault_config.jti, "Vault created");
        let mut vault = Vault::new(self.cloud.id(), location.clone());
        vault.format = Some(vault_config.format);
        vault.max_file_name_length = Some(vault_config.shortening_threshold);
        Ok(vault)
    }

    /// Unlock `vault` with `password` and register its cryptor.
    ///
    /// Returns the vault with format, shortening threshold and unlock state
    /// filled in.
    #[instrument(level = "info", skip(self, vault, password, cancel), fields(vault = %vault.folder))]
    pub fn unlock(
        &self,
        vault: &Vault,
        password: &str,
        cancel: &CancelFlag,
    ) -> Result<Vault, VaultProviderError> {
        let descriptor = self.describe(&vault.folder)?;
        let (_, masterkey) = self.read_masterkey_file(&descriptor.masterkey_file)?;

        let version = descriptor.declared_version.unwrap_or(masterkey.version);
        let passphrase = master_key::normalize_passphrase(password, version);
        let kek = masterkey.derive_key(&passphrase)?;
        if cancel.is_cancelled() {
            return Err(VaultProviderError::Cancelled);
        }
        let key = unlock_or_invalid_password(&masterkey, |file| file.unlock_with_kek(&kek))?;

        let (version, threshold, combo) = match &descriptor.config_token {
            Some(token) => {
                let claims = match config::validate_vault_claims(token, &key) {
                    Ok(claims) => claims,
                    Err(e) => {
                        key.destroy();
                        return Err(e.into());
                    }
                };
                let combo = claims.cipher_combo().unwrap_or(CipherCombo::SivGcm);
                (claims.format(), claims.shortening_threshold(), combo)
            }
            None => {
                let threshold = if masterkey.version >= FORMAT7 {
                    DEFAULT_SHORTENING_THRESHOLD
                } else {
                    LEGACY_SHORTENING_THRESHOLD
                };
                (masterkey.version, threshold, CipherCombo::SivCtrMac)
            }
        };

        if !(MIN_VAULT_VERSION..=MAX_VAULT_VERSION).contains(&version) {
            warn!(version, "Unsupported vault format");
            key.destroy();
            return Err(VaultProviderError::UnsupportedVaultFormat { version });
        }
        if cancel.is_cancelled() {
            key.destroy();
            return Err(VaultProviderError::Cancelled);
        }

        let cryptor: Arc<dyn Cryptor> = Arc::new(VaultCryptor::new(Arc::new(key), combo));
        if self
            .registry
            .put_if_absent(vault.key(), Arc::clone(&cryptor))
            .is_some()
        {
            debug!("Vault was already unlocked, keeping the registered cryptor");
            cryptor.destroy();
        }

        info!(version, %combo, "Vault unlocked");
        Ok(Vault {
            format: Some(version),
            max_file_name_length: Some(threshold),
            unlocked: true,
            ..vault.clone()
        })
    }

    /// Deregister the vault's cryptor and wipe its keys.
    #[instrument(level = "info", skip(self, vault), fields(vault = %vault.folder))]
    pub fn lock(&self, vault: &Vault) -> Vault {
        if !self.registry.remove_and_destroy(&vault.key()) {
            debug!("Vault was not unlocked");
        }
        Vault {
            unlocked: false,
            ..vault.clone()
        }
    }

    /// Re-wrap the master key under `new_password`.
    ///
    /// The current master key file is first copied to its `.bkup` name so a
    /// failed overwrite never loses the only copy. The file's `version` field
    /// is kept and with it the password normalization rule.
    #[instrument(level = "info", skip(self, vault, old_password, new_password), fields(vault = %vault.folder))]
    pub fn change_password(
        &self,
        vault: &Vault,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), VaultProviderError> {
        let descriptor = self.describe(&vault.folder)?;
        let file = &descriptor.masterkey_file;
        let (content, masterkey) = self.read_masterkey_file(file)?;

        let old = master_key::normalize_passphrase(old_password, masterkey.version);
        let key = unlock_or_invalid_password(&masterkey, |mk| mk.unlock(&old))?;

        let backup = file
            .parent()
            .file(&master_key::backup_file_name(file.name(), &content));
        self.cloud.write_bytes(&backup, &content, true)?;
        debug!(backup = %backup, "Master key file backed up");

        let new = master_key::normalize_passphrase(new_password, masterkey.version);
        let result =
            master_key::create_masterkey_file(&key, &new, masterkey.version, self.scrypt_params);
        key.destroy();
        self.cloud.write_bytes(file, result?.as_bytes(), true)?;

        info!("Vault password changed");
        Ok(())
    }

    /// Whether `password` opens the vault's master key file. Nothing is registered.
    #[instrument(level = "debug", skip(self, vault, password), fields(vault = %vault.folder))]
    pub fn is_password_valid(&self, vault: &Vault, password: &str) -> Result<bool, VaultProviderError> {
        let descriptor = self.describe(&vault.folder)?;
        let (_, masterkey) = self.read_masterkey_file(&descriptor.masterkey_file)?;
        let version = descriptor.declared_version.unwrap_or(masterkey.version);
        let passphrase = master_key::normalize_passphrase(password, version);

        match unlock_or_invalid_password(&masterkey, |mk| mk.unlock(&passphrase)) {
            Ok(key) => {
                key.destroy();
                Ok(true)
            }
            Err(VaultProviderError::InvalidPassword) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn describe(&self, folder: &CloudFolder) -> Result<VaultDescriptor, VaultProviderError> {
        let config_file = folder.file(VAULT_CONFIG_FILENAME);
        if !self.cloud.file_exists(&config_file)? {
            debug!("No vault configuration, treating as legacy vault");
            return Ok(VaultDescriptor {
                masterkey_file: folder.file(MASTERKEY_FILENAME),
                config_token: None,
                declared_version: None,
            });
        }

        let token = String::from_utf8(self.cloud.read_bytes(&config_file)?)
            .map_err(|e| ClaimValidationError::Malformed(e.to_string()))?;
        let unverified = config::peek_vault_config(&token)?;
        let masterkey_name = unverified.masterkey_file_name()?;
        debug!(
            format = unverified.claims.format(),
            masterkey = %masterkey_name,
            "Read unverified vault configuration"
        );
        Ok(VaultDescriptor {
            masterkey_file: folder.file(&masterkey_name),
            declared_version: Some(unverified.claims.format()),
            config_token: Some(token),
        })
    }

    fn read_masterkey_file(
        &self,
        file: &CloudFile,
    ) -> Result<(Vec<u8>, MasterKeyFile), VaultProviderError> {
        let content = self.cloud.read_bytes(file)?;
        let parsed = MasterKeyFile::from_json(&content).map_err(|e| {
            VaultProviderError::MalformedMasterKeyFile {
                path: file.path().to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok((content, parsed))
    }
}

fn unlock_or_invalid_password<F>(file: &MasterKeyFile, unlock: F) -> Result<MasterKey, VaultProviderError>
where
    F: FnOnce(&MasterKeyFile) -> Result<MasterKey, CryptoError>,
{
    unlock(file).map_err(|e| match e {
        CryptoError::KeyUnwrapIntegrityFailed => {
            debug!("Key unwrap failed, wrong password");
            VaultProviderError::InvalidPassword
        }
        other => other.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::LocalCloudStore;
    use tempfile::TempDir;

    const FAST: ScryptParams = ScryptParams {
        log2_n: 4,
        r: 8,
        p: 1,
    };

    fn provider() -> (TempDir, Arc<dyn CloudStore>, MasterkeyCryptoCloudProvider) {
        let dir = TempDir::new().unwrap();
        let cloud: Arc<dyn CloudStore> = Arc::new(LocalCloudStore::new(dir.path()));
        let provider = MasterkeyCryptoCloudProvider::with_scrypt_params(
            Arc::clone(&cloud),
            Arc::new(CryptorRegistry::new()),
            FAST,
        );
        (dir, cloud, provider)
    }

    #[test]
    fn test_create_writes_vault_files() {
        let (_dir, cloud, provider) = provider();
        let location = CloudFolder::at("/vault");
        let vault = provider.create(&location, "pw", &CancelFlag::new()).unwrap();
        assert_eq!(vault.format, Some(8));
        assert!(!vault.unlocked);

        assert!(cloud.file_exists(&location.file(VAULT_CONFIG_FILENAME)).unwrap());
        assert!(cloud.file_exists(&location.file(MASTERKEY_FILENAME)).unwrap());
        let d = cloud.list(&location.folder("d")).unwrap();
        assert_eq!(d.len(), 1);

        assert!(matches!(
            provider.create(&location, "pw", &CancelFlag::new()),
            Err(VaultProviderError::VaultAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_cancelled_create_writes_nothing() {
        let (_dir, cloud, provider) = provider();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let location = CloudFolder::at("/vault");
        assert!(matches!(
            provider.create(&location, "pw", &cancel),
            Err(VaultProviderError::Cancelled)
        ));
        assert!(!cloud.folder_exists(&location).unwrap());
    }

    #[test]
    fn test_unlock_lock_cycle() {
        let (_dir, _cloud, provider) = provider();
        let vault = provider
            .create(&CloudFolder::at("/vault"), "pw", &CancelFlag::new())
            .unwrap();

        let unlocked = provider.unlock(&vault, "pw", &CancelFlag::new()).unwrap();
        assert!(unlocked.unlocked);
        assert_eq!(unlocked.max_file_name_length, Some(220));
        assert_eq!(provider.registry().len(), 1);

        let cryptor = provider.registry().get(&vault.key()).unwrap();
        let locked = provider.lock(&unlocked);
        assert!(!locked.unlocked);
        assert!(cryptor.is_destroyed());
        assert!(provider.registry().is_empty());
    }

    #[test]
    fn test_wrong_password() {
        let (_dir, _cloud, provider) = provider();
        let vault = provider
            .create(&CloudFolder::at("/vault"), "pw", &CancelFlag::new())
            .unwrap();
        assert!(matches!(
            provider.unlock(&vault, "nope", &CancelFlag::new()),
            Err(VaultProviderError::InvalidPassword)
        ));
        assert!(!provider.is_password_valid(&vault, "nope").unwrap());
        assert!(provider.is_password_valid(&vault, "pw").unwrap());
        assert!(provider.registry().is_empty());
    }
}
