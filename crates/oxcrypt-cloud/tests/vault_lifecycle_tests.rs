//! Creating, unlocking, locking and re-keying vaults through the provider.

mod common;

use std::sync::Arc;

use common::{FAST_KDF, PASSWORD, TestCloud, write_file};
use oxcrypt_cloud::cloud::{CloudFolder, CloudStore};
use oxcrypt_cloud::crypto::MasterKey;
use oxcrypt_cloud::cryptofs::CryptoCloud;
use oxcrypt_cloud::vault::config::VAULT_CONFIG_FILENAME;
use oxcrypt_cloud::vault::master_key::{MASTERKEY_FILENAME, backup_file_name};
use oxcrypt_cloud::vault::{
    CancelFlag, MasterKeyFile, Vault, VaultConfig, VaultProviderError, create_masterkey_file,
    create_vault_config, normalize_passphrase,
};

fn vault_location() -> CloudFolder {
    CloudFolder::at("/vault")
}

/// Master key of the vault at `/vault`, unwrapped with `password`.
fn read_master_key(tc: &TestCloud, password: &str) -> MasterKey {
    let content = tc
        .cloud
        .read_bytes(&vault_location().file(MASTERKEY_FILENAME))
        .unwrap();
    let file = MasterKeyFile::from_json(&content).unwrap();
    file.unlock(&normalize_passphrase(password, file.version)).unwrap()
}

#[test]
fn test_create_writes_vault_files() {
    let tc = TestCloud::new();
    let vault = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();

    assert!(!vault.unlocked);
    assert_eq!(vault.format, Some(8));
    assert_eq!(vault.max_file_name_length, Some(220));
    assert_eq!(vault.name, "vault");
    assert!(tc.registry.is_empty());

    let location = vault_location();
    assert!(tc.cloud.file_exists(&location.file(MASTERKEY_FILENAME)).unwrap());
    assert!(tc.cloud.file_exists(&location.file(VAULT_CONFIG_FILENAME)).unwrap());
    assert!(tc.cloud.folder_exists(&location.folder("d")).unwrap());
}

#[test]
fn test_create_refuses_existing_vault() {
    let tc = TestCloud::new();
    tc.provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();
    let again = tc
        .provider
        .create(&vault_location(), "other password", &CancelFlag::new());
    assert!(matches!(again, Err(VaultProviderError::VaultAlreadyExists { .. })));

    // The first vault still opens with its own password.
    let vault = Vault::new(tc.cloud.id(), vault_location());
    assert!(tc.provider.is_password_valid(&vault, PASSWORD).unwrap());
}

#[test]
fn test_cancelled_create_writes_nothing() {
    let tc = TestCloud::new();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let result = tc.provider.create(&vault_location(), PASSWORD, &cancel);
    assert!(matches!(result, Err(VaultProviderError::Cancelled)));
    assert!(!tc.cloud.folder_exists(&vault_location()).unwrap());
}

#[test]
fn test_unlock_and_lock() {
    let tc = TestCloud::new();
    let created = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();

    let unlocked = tc
        .provider
        .unlock(&created, PASSWORD, &CancelFlag::new())
        .unwrap();
    assert!(unlocked.unlocked);
    assert_eq!(unlocked.format, Some(8));
    assert_eq!(unlocked.max_file_name_length, Some(220));
    assert_eq!(tc.registry.len(), 1);
    assert!(tc.registry.get(&unlocked.key()).is_ok());

    // A second unlock keeps the registered cryptor.
    let first = tc.registry.get(&unlocked.key()).unwrap();
    tc.provider
        .unlock(&created, PASSWORD, &CancelFlag::new())
        .unwrap();
    assert_eq!(tc.registry.len(), 1);
    assert!(Arc::ptr_eq(&first, &tc.registry.get(&unlocked.key()).unwrap()));
    assert!(!first.is_destroyed());

    let locked = tc.provider.lock(&unlocked);
    assert!(!locked.unlocked);
    assert!(tc.registry.is_empty());
    assert!(first.is_destroyed());

    // Locking twice is harmless.
    let locked = tc.provider.lock(&locked);
    assert!(!locked.unlocked);
}

#[test]
fn test_unlock_with_wrong_password() {
    let tc = TestCloud::new();
    let created = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();

    let result = tc.provider.unlock(&created, "wrong password", &CancelFlag::new());
    assert!(matches!(result, Err(VaultProviderError::InvalidPassword)));
    assert!(tc.registry.is_empty());
    assert!(!tc.provider.is_password_valid(&created, "wrong password").unwrap());
    assert!(tc.provider.is_password_valid(&created, PASSWORD).unwrap());
}

#[test]
fn test_cancelled_unlock_registers_nothing() {
    let tc = TestCloud::new();
    let created = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let result = tc.provider.unlock(&created, PASSWORD, &cancel);
    assert!(matches!(result, Err(VaultProviderError::Cancelled)));
    assert!(tc.registry.is_empty());
}

#[test]
fn test_change_password_keeps_backup() {
    let tc = TestCloud::new();
    let (vault, fs) = tc.unlocked_vault();
    let file = write_file(&fs, &fs.root(), "kept.txt", b"survives re-keying");
    let masterkey_file = vault_location().file(MASTERKEY_FILENAME);
    let original = tc.cloud.read_bytes(&masterkey_file).unwrap();

    tc.provider
        .change_password(&vault, PASSWORD, "new password")
        .unwrap();

    // The backup is the old file, byte for byte.
    let backup = vault_location().file(&backup_file_name(MASTERKEY_FILENAME, &original));
    assert_eq!(tc.cloud.read_bytes(&backup).unwrap(), original);
    let old = MasterKeyFile::from_json(&original).unwrap();
    assert!(old.unlock(&normalize_passphrase(PASSWORD, old.version)).is_ok());

    assert!(!tc.provider.is_password_valid(&vault, PASSWORD).unwrap());
    assert!(tc.provider.is_password_valid(&vault, "new password").unwrap());

    // Same key, so existing content still decrypts after a fresh unlock.
    let locked = tc.provider.lock(&vault);
    let unlocked = tc
        .provider
        .unlock(&locked, "new password", &CancelFlag::new())
        .unwrap();
    let fs = CryptoCloud::new(&unlocked, Arc::clone(&tc.cloud), &tc.registry).unwrap();
    assert_eq!(fs.read_bytes(&file).unwrap(), b"survives re-keying");
}

#[test]
fn test_change_password_rejects_wrong_old_password() {
    let tc = TestCloud::new();
    let vault = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();

    let result = tc.provider.change_password(&vault, "not it", "new password");
    assert!(matches!(result, Err(VaultProviderError::InvalidPassword)));
    assert!(tc.provider.is_password_valid(&vault, PASSWORD).unwrap());
}

#[test]
fn test_unsupported_config_format() {
    let tc = TestCloud::new();
    let created = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();

    let key = read_master_key(&tc, PASSWORD);
    let config = VaultConfig {
        format: 9,
        ..VaultConfig::new()
    };
    let token = create_vault_config(&config, &key).unwrap();
    key.destroy();
    tc.cloud
        .write_bytes(
            &vault_location().file(VAULT_CONFIG_FILENAME),
            token.as_bytes(),
            true,
        )
        .unwrap();

    let result = tc.provider.unlock(&created, PASSWORD, &CancelFlag::new());
    assert!(matches!(
        result,
        Err(VaultProviderError::UnsupportedVaultFormat { version: 9 })
    ));
    assert!(tc.registry.is_empty());
}

#[test]
fn test_unsupported_legacy_version() {
    let tc = TestCloud::new();
    let location = CloudFolder::at("/ancient");
    let key = MasterKey::random().unwrap();
    let json = create_masterkey_file(&key, &normalize_passphrase(PASSWORD, 4), 4, FAST_KDF).unwrap();
    key.destroy();
    tc.cloud.create(&location).unwrap();
    tc.cloud
        .write_bytes(&location.file(MASTERKEY_FILENAME), json.as_bytes(), false)
        .unwrap();

    let vault = Vault::new(tc.cloud.id(), location);
    let result = tc.provider.unlock(&vault, PASSWORD, &CancelFlag::new());
    assert!(matches!(
        result,
        Err(VaultProviderError::UnsupportedVaultFormat { version: 4 })
    ));
    assert!(tc.registry.is_empty());
}

#[test]
fn test_tampered_config_is_rejected() {
    let tc = TestCloud::new();
    let created = tc
        .provider
        .create(&vault_location(), PASSWORD, &CancelFlag::new())
        .unwrap();

    // Signed by an unrelated key.
    let stranger = MasterKey::random().unwrap();
    let token = create_vault_config(&VaultConfig::new(), &stranger).unwrap();
    stranger.destroy();
    tc.cloud
        .write_bytes(
            &vault_location().file(VAULT_CONFIG_FILENAME),
            token.as_bytes(),
            true,
        )
        .unwrap();

    let result = tc.provider.unlock(&created, PASSWORD, &CancelFlag::new());
    assert!(matches!(result, Err(VaultProviderError::Config(_))));
    assert!(tc.registry.is_empty());
}

#[test]
fn test_vaults_are_isolated() {
    let tc = TestCloud::new();
    let first = tc
        .provider
        .create(&CloudFolder::at("/one"), PASSWORD, &CancelFlag::new())
        .unwrap();
    let second = tc
        .provider
        .create(&CloudFolder::at("/two"), "second password", &CancelFlag::new())
        .unwrap();

    let first = tc.provider.unlock(&first, PASSWORD, &CancelFlag::new()).unwrap();
    let second = tc
        .provider
        .unlock(&second, "second password", &CancelFlag::new())
        .unwrap();
    assert_eq!(tc.registry.len(), 2);

    let fs_one = CryptoCloud::new(&first, Arc::clone(&tc.cloud), &tc.registry).unwrap();
    let fs_two = CryptoCloud::new(&second, Arc::clone(&tc.cloud), &tc.registry).unwrap();
    write_file(&fs_one, &fs_one.root(), "same.txt", b"one");
    write_file(&fs_two, &fs_two.root(), "same.txt", b"two");

    tc.provider.lock(&first);
    assert!(fs_one.list(&fs_one.root()).is_err());
    assert_eq!(fs_two.list(&fs_two.root()).unwrap().len(), 1);
}
