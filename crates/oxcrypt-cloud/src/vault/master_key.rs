#![forbid(unsafe_code)]

//! The `masterkey.cryptomator` file.
//!
//! Holds the AES and MAC keys wrapped (RFC 3394) under a key encryption key
//! derived from the password with scrypt, plus an HMAC over the vault version
//! so that legacy vaults cannot be downgraded by editing the `version` field.

use ring::digest;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use serde_with::base64::Base64;
use serde_with::serde_as;
use thiserror::Error;
use tracing::{debug, instrument};
use unicode_normalization::UnicodeNormalization;
use zeroize::Zeroizing;

use crate::crypto::{
    CryptoError, key_wrap,
    keys::{KeyAccessError, MasterKey},
};

/// Name of the master key file inside the vault folder.
pub const MASTERKEY_FILENAME: &str = "masterkey.cryptomator";

/// `version` written into master key files of format 8 vaults, whose real
/// format lives in the vault configuration.
pub const MASTERKEY_FILE_VERSION: u32 = 999;

/// First vault version whose passwords are NFC-normalized before derivation.
pub const NFC_PASSWORD_MIN_VERSION: u32 = 6;

const SCRYPT_SALT_LENGTH: usize = 8;
const DEFAULT_SCRYPT_COST_PARAM_LOG2: u8 = 15; // 2^15 = 32768
const FAST_SCRYPT_COST_PARAM_LOG2: u8 = 10; // 2^10 = 1024
const DEFAULT_SCRYPT_BLOCK_SIZE: u32 = 8;
const DEFAULT_SCRYPT_PARALLELIZATION: u32 = 1;

/// scrypt cost parameters used when writing a master key file.
///
/// Reading always uses the parameters stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScryptParams {
    pub log2_n: u8,
    pub r: u32,
    pub p: u32,
}

impl ScryptParams {
    /// Parameters with the given cost and the default block size.
    pub fn with_cost_log2(log2_n: u8) -> Self {
        Self {
            log2_n,
            ..Self::standard()
        }
    }

    fn standard() -> Self {
        Self {
            log2_n: DEFAULT_SCRYPT_COST_PARAM_LOG2,
            r: DEFAULT_SCRYPT_BLOCK_SIZE,
            p: DEFAULT_SCRYPT_PARALLELIZATION,
        }
    }
}

impl Default for ScryptParams {
    /// N = 2^15, or 2^10 when `OXCRYPT_FAST_KDF` is `1`/`true`.
    fn default() -> Self {
        let fast = std::env::var("OXCRYPT_FAST_KDF")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if fast {
            Self::with_cost_log2(FAST_SCRYPT_COST_PARAM_LOG2)
        } else {
            Self::standard()
        }
    }
}

#[derive(Error, Debug)]
pub enum MasterKeyCreationError {
    #[error("RNG failed: {0}")]
    Rng(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(#[from] CryptoError),

    #[error("Key wrap failed: {0}")]
    KeyWrap(#[from] key_wrap::WrapError),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Serialized form of `masterkey.cryptomator`.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyFile {
    /// Vault version for legacy vaults, [`MASTERKEY_FILE_VERSION`] otherwise.
    pub version: u32,

    #[serde_as(as = "Base64")]
    pub scrypt_salt: Vec<u8>,

    pub scrypt_cost_param: i32,

    pub scrypt_block_size: i32,

    #[serde_as(as = "Base64")]
    pub primary_master_key: Vec<u8>,

    #[serde_as(as = "Base64")]
    pub hmac_master_key: Vec<u8>,

    #[serde_as(as = "Base64")]
    pub version_mac: Vec<u8>,
}

/// Prepare a password for key derivation.
///
/// Vaults from version 6 on derive from the NFC form; older vaults use the
/// bytes as typed.
pub fn normalize_passphrase(passphrase: &str, vault_version: u32) -> Zeroizing<String> {
    if vault_version >= NFC_PASSWORD_MIN_VERSION {
        Zeroizing::new(passphrase.nfc().collect())
    } else {
        Zeroizing::new(passphrase.to_owned())
    }
}

/// Name of the backup written before a master key file is overwritten:
/// `masterkey.cryptomator.<uppercase hex of the first 4 bytes of SHA-256(content)>.bkup`,
/// the name other Cryptomator clients use.
pub fn backup_file_name(masterkey_file_name: &str, content: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, content);
    format!("{masterkey_file_name}.{}.bkup", hex::encode_upper(&hash.as_ref()[..4]))
}

fn scrypt_kek(
    passphrase: &str,
    salt: &[u8],
    log2_n: u8,
    r: u32,
    p: u32,
) -> Result<SecretBox<[u8; 32]>, CryptoError> {
    let params = scrypt::Params::new(log2_n, r, p, 32).map_err(|e| {
        CryptoError::InvalidScryptParams(format!("N=2^{log2_n}, r={r}, p={p}: {e}"))
    })?;
    let mut kek = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut kek[..])
        .map_err(|e| CryptoError::KeyDerivationFailed(format!("Scrypt derivation failed: {e}")))?;
    Ok(SecretBox::new(Box::new(*kek)))
}

impl MasterKeyFile {
    /// Parse the JSON content of a master key file.
    pub fn from_json(content: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(content)
    }

    /// Derive the key encryption key. `passphrase` must already be normalized
    /// with [`normalize_passphrase`].
    pub fn derive_key(&self, passphrase: &str) -> Result<SecretBox<[u8; 32]>, CryptoError> {
        let cost = u32::try_from(self.scrypt_cost_param)
            .ok()
            .filter(|n| n.is_power_of_two() && *n > 1)
            .ok_or_else(|| {
                CryptoError::InvalidScryptParams(format!(
                    "cost parameter {} is not a power of two",
                    self.scrypt_cost_param
                ))
            })?;
        let block_size = u32::try_from(self.scrypt_block_size).map_err(|_| {
            CryptoError::InvalidScryptParams(format!(
                "negative block size {}",
                self.scrypt_block_size
            ))
        })?;
        #[allow(clippy::cast_possible_truncation)]
        let log2_n = cost.trailing_zeros() as u8;
        scrypt_kek(
            passphrase,
            &self.scrypt_salt,
            log2_n,
            block_size,
            DEFAULT_SCRYPT_PARALLELIZATION,
        )
    }

    /// Derive the KEK and unwrap the master keys.
    ///
    /// A wrong password surfaces as [`CryptoError::KeyUnwrapIntegrityFailed`].
    #[instrument(level = "debug", skip_all, fields(version = self.version))]
    pub fn unlock(&self, passphrase: &str) -> Result<MasterKey, CryptoError> {
        let kek = self.derive_key(passphrase)?;
        self.unlock_with_kek(&kek)
    }

    /// Unwrap the master keys with an already derived KEK.
    pub fn unlock_with_kek(&self, kek: &SecretBox<[u8; 32]>) -> Result<MasterKey, CryptoError> {
        let aes_key = key_wrap::unwrap_key(&self.primary_master_key, kek.expose_secret())?;
        let mac_key = key_wrap::unwrap_key(&self.hmac_master_key, kek.expose_secret())?;

        let aes_key: Zeroizing<[u8; 32]> = Zeroizing::new(
            aes_key
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: aes_key.len(),
                })?,
        );
        let mac_key: Zeroizing<[u8; 32]> = Zeroizing::new(
            mac_key
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: 32,
                    actual: mac_key.len(),
                })?,
        );

        self.check_version_mac(&mac_key)?;
        debug!("Master keys unwrapped");
        MasterKey::new(*aes_key, *mac_key).map_err(CryptoError::from)
    }

    fn check_version_mac(&self, mac_key: &[u8; 32]) -> Result<(), CryptoError> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, mac_key);
        hmac::verify(&key, &self.version.to_be_bytes(), &self.version_mac)
            .map_err(|_| CryptoError::HmacVerificationFailed)
    }
}

/// Serialize `master_key` into a new master key file protected by `passphrase`.
///
/// `passphrase` must already be normalized for `version`.
pub fn create_masterkey_file(
    master_key: &MasterKey,
    passphrase: &str,
    version: u32,
    params: ScryptParams,
) -> Result<String, MasterKeyCreationError> {
    let mut salt = vec![0u8; SCRYPT_SALT_LENGTH];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| MasterKeyCreationError::Rng("Failed to generate salt".to_string()))?;

    let kek = scrypt_kek(passphrase, &salt, params.log2_n, params.r, params.p)?;

    let wrapped_aes = master_key.with_aes_key(|key| key_wrap::wrap_key(key, kek.expose_secret()))??;
    let wrapped_mac = master_key.with_mac_key(|key| key_wrap::wrap_key(key, kek.expose_secret()))??;
    let version_mac = master_key.with_mac_key(|key| {
        let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
        hmac::sign(&hmac_key, &version.to_be_bytes()).as_ref().to_vec()
    })?;

    let file = MasterKeyFile {
        version,
        scrypt_salt: salt,
        scrypt_cost_param: 1i32 << params.log2_n,
        scrypt_block_size: i32::try_from(params.r).unwrap_or(i32::MAX),
        primary_master_key: wrapped_aes,
        hmac_master_key: wrapped_mac,
        version_mac,
    };
    Ok(serde_json::to_string_pretty(&file)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: ScryptParams = ScryptParams {
        log2_n: 4,
        r: 8,
        p: 1,
    };

    #[test]
    fn test_roundtrip_masterkey_file() {
        let master_key = MasterKey::random().unwrap();
        let json = create_masterkey_file(&master_key, "test-passphrase-123", 999, FAST).unwrap();

        let file = MasterKeyFile::from_json(json.as_bytes()).unwrap();
        assert_eq!(file.version, 999);
        assert_eq!(file.scrypt_cost_param, 16);
        let unlocked = file.unlock("test-passphrase-123").unwrap();

        master_key
            .with_raw_key(|orig| unlocked.with_raw_key(|new| assert_eq!(orig, new)))
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_wrong_passphrase() {
        let master_key = MasterKey::random().unwrap();
        let json = create_masterkey_file(&master_key, "right", 999, FAST).unwrap();
        let file = MasterKeyFile::from_json(json.as_bytes()).unwrap();
        assert!(matches!(
            file.unlock("wrong"),
            Err(CryptoError::KeyUnwrapIntegrityFailed)
        ));
    }

    #[test]
    fn test_tampered_version_detected() {
        let master_key = MasterKey::random().unwrap();
        let json = create_masterkey_file(&master_key, "pw", 6, FAST).unwrap();
        let mut file = MasterKeyFile::from_json(json.as_bytes()).unwrap();
        file.version = 5;
        assert!(matches!(
            file.unlock("pw"),
            Err(CryptoError::HmacVerificationFailed)
        ));
    }

    #[test]
    fn test_passphrase_normalization_by_version() {
        let decomposed = "pa\u{0301}ss";
        assert_eq!(normalize_passphrase(decomposed, 6).as_str(), "p\u{e1}ss");
        assert_eq!(normalize_passphrase(decomposed, 999).as_str(), "p\u{e1}ss");
        assert_eq!(normalize_passphrase(decomposed, 5).as_str(), decomposed);
    }

    #[test]
    fn test_backup_file_name() {
        // SHA-256("{}") starts with 44 13 6f a3.
        let name = backup_file_name(MASTERKEY_FILENAME, b"{}");
        assert_eq!(name, "masterkey.cryptomator.44136FA3.bkup");
    }

    #[test]
    fn test_invalid_cost_param_rejected() {
        let master_key = MasterKey::random().unwrap();
        let json = create_masterkey_file(&master_key, "pw", 999, FAST).unwrap();
        let mut file = MasterKeyFile::from_json(json.as_bytes()).unwrap();
        file.scrypt_cost_param = 1000;
        assert!(matches!(
            file.unlock("pw"),
            Err(CryptoError::InvalidScryptParams(_))
        ));
    }
}
