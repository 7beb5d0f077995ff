#![forbid(unsafe_code)]

//! The `vault.cryptomator` configuration token.
//!
//! Format 8 vaults store their format, cipher combo and shortening threshold
//! in a JWT signed (HS256) with the master key. The `kid` header points at the
//! master key file. Header and claims can be read before the key is known,
//! which is how unlocking learns where the master key file lives and which
//! password normalization applies; the signature is verified once the key is
//! unwrapped.

use std::{fmt, str::FromStr};

use data_encoding::BASE64URL_NOPAD;
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::crypto::keys::{JwtValidationError, KeyAccessError, MasterKey};

/// Name of the configuration file inside the vault folder.
pub const VAULT_CONFIG_FILENAME: &str = "vault.cryptomator";

/// Shortening threshold written into new vaults.
pub const DEFAULT_SHORTENING_THRESHOLD: usize = 220;

/// Shortening threshold of vaults before format 7, applied to the prefixed
/// Base32 name.
pub const LEGACY_SHORTENING_THRESHOLD: usize = 129;

/// Vault format written into new vaults.
pub const CURRENT_VAULT_FORMAT: u32 = 8;

/// Key ID of new vaults: the master key file next to the config.
pub const DEFAULT_MASTERKEY_KID: &str = "masterkeyfile:masterkey.cryptomator";

/// Content cipher of a vault. Names always use AES-SIV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherCombo {
    /// AES-GCM content encryption (format 8 default).
    SivGcm,
    /// AES-CTR + HMAC-SHA256 content encryption (formats 5 to 7).
    SivCtrMac,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCipherComboError(String);

impl fmt::Display for ParseCipherComboError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown cipher combo: {}", self.0)
    }
}

impl std::error::Error for ParseCipherComboError {}

impl FromStr for CipherCombo {
    type Err = ParseCipherComboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SIV_GCM" => Ok(CipherCombo::SivGcm),
            "SIV_CTRMAC" => Ok(CipherCombo::SivCtrMac),
            _ => Err(ParseCipherComboError(s.to_owned())),
        }
    }
}

impl CipherCombo {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherCombo::SivGcm => "SIV_GCM",
            CipherCombo::SivCtrMac => "SIV_CTRMAC",
        }
    }
}

impl fmt::Display for CipherCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claims carried by `vault.cryptomator`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfigurationClaims {
    format: u32,
    #[serde(default = "default_shortening_threshold")]
    shortening_threshold: u32,
    jti: String,
    cipher_combo: String,
}

fn default_shortening_threshold() -> u32 {
    DEFAULT_SHORTENING_THRESHOLD as u32
}

impl VaultConfigurationClaims {
    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn jti(&self) -> &str {
        &self.jti
    }

    pub fn cipher_combo(&self) -> Option<CipherCombo> {
        self.cipher_combo.parse().ok()
    }

    pub fn shortening_threshold(&self) -> usize {
        self.shortening_threshold as usize
    }
}

/// Settings for a new vault configuration.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub jti: String,
    pub format: u32,
    pub shortening_threshold: usize,
    pub cipher_combo: CipherCombo,
}

impl VaultConfig {
    /// Current-format configuration with a random vault ID.
    pub fn new() -> Self {
        Self {
            jti: uuid::Uuid::new_v4().to_string(),
            format: CURRENT_VAULT_FORMAT,
            shortening_threshold: DEFAULT_SHORTENING_THRESHOLD,
            cipher_combo: CipherCombo::SivGcm,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Header and claims of a configuration token whose signature is not yet checked.
#[derive(Debug, Clone)]
pub struct UnverifiedVaultConfig {
    pub kid: Option<String>,
    pub claims: VaultConfigurationClaims,
}

impl UnverifiedVaultConfig {
    /// Name of the master key file the `kid` header points at.
    pub fn masterkey_file_name(&self) -> Result<String, ClaimValidationError> {
        let kid = self.kid.as_deref().ok_or(ClaimValidationError::MissingKid)?;
        let uri = Url::parse(kid).map_err(|e| ClaimValidationError::InvalidKid(format!("{kid}: {e}")))?;
        if uri.scheme() != "masterkeyfile" {
            return Err(ClaimValidationError::InvalidKid(format!(
                "unsupported scheme '{}'",
                uri.scheme()
            )));
        }
        let path = uri.path().trim_start_matches('/');
        if path.is_empty() || path.contains("..") {
            return Err(ClaimValidationError::InvalidKid(kid.to_owned()));
        }
        Ok(path.to_owned())
    }
}

#[derive(Error, Debug)]
pub enum ClaimValidationError {
    #[error("JWT decode error: {0}")]
    JwtDecode(#[from] jsonwebtoken::errors::Error),

    #[error("JWT validation error: {0}")]
    JwtValidation(#[from] JwtValidationError),

    #[error("Malformed vault configuration: {0}")]
    Malformed(String),

    #[error("Unsupported cipher combo: {0}")]
    UnsupportedCipherCombo(String),

    #[error("Missing kid in vault configuration header")]
    MissingKid,

    #[error("Invalid master key reference: {0}")]
    InvalidKid(String),
}

/// Read header and claims without verifying the signature.
pub fn peek_vault_config(token: &str) -> Result<UnverifiedVaultConfig, ClaimValidationError> {
    let header = jsonwebtoken::decode_header(token)?;
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ClaimValidationError::Malformed("missing payload segment".to_string()))?;
    let json = BASE64URL_NOPAD
        .decode(payload.trim_end_matches('=').as_bytes())
        .map_err(|e| ClaimValidationError::Malformed(e.to_string()))?;
    let claims = serde_json::from_slice(&json)
        .map_err(|e| ClaimValidationError::Malformed(e.to_string()))?;
    Ok(UnverifiedVaultConfig {
        kid: header.kid,
        claims,
    })
}

/// Verify the token's signature with `master_key` and return its claims.
pub fn validate_vault_claims(
    token: &str,
    master_key: &MasterKey,
) -> Result<VaultConfigurationClaims, ClaimValidationError> {
    let header = jsonwebtoken::decode_header(token)?;

    let mut validation = Validation::new(header.alg);
    validation.required_spec_claims.clear();
    validation.algorithms = vec![Algorithm::HS256, Algorithm::HS384, Algorithm::HS512];

    let claims = master_key.validate_jwt::<VaultConfigurationClaims>(token, &validation)?;
    if claims.cipher_combo().is_none() {
        return Err(ClaimValidationError::UnsupportedCipherCombo(
            claims.cipher_combo.clone(),
        ));
    }
    Ok(claims)
}

#[derive(Error, Debug)]
pub enum VaultConfigCreationError {
    #[error("JWT encoding error: {0}")]
    JwtEncode(#[from] jsonwebtoken::errors::Error),

    #[error("Key access error: {0}")]
    KeyAccess(#[from] KeyAccessError),
}

/// Sign a configuration token for `config`.
pub fn create_vault_config(
    config: &VaultConfig,
    master_key: &MasterKey,
) -> Result<String, VaultConfigCreationError> {
    let claims = VaultConfigurationClaims {
        format: config.format,
        shortening_threshold: u32::try_from(config.shortening_threshold).unwrap_or(u32::MAX),
        jti: config.jti.clone(),
        cipher_combo: config.cipher_combo.as_str().to_string(),
    };

    let encoding_key = master_key.create_jwt_encoding_key()?;
    let mut header = jsonwebtoken::Header::new(Algorithm::HS256);
    header.kid = Some(DEFAULT_MASTERKEY_KID.to_string());

    Ok(jsonwebtoken::encode(&header, &claims, &encoding_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_validate() {
        let master_key = MasterKey::random().unwrap();
        let config = VaultConfig {
            shortening_threshold: 150,
            ..VaultConfig::new()
        };

        let token = create_vault_config(&config, &master_key).unwrap();
        let claims = validate_vault_claims(&token, &master_key).unwrap();
        assert_eq!(claims.format(), 8);
        assert_eq!(claims.shortening_threshold(), 150);
        assert_eq!(claims.cipher_combo(), Some(CipherCombo::SivGcm));
        assert_eq!(claims.jti(), config.jti);
    }

    #[test]
    fn test_peek_without_key() {
        let master_key = MasterKey::random().unwrap();
        let config = VaultConfig {
            cipher_combo: CipherCombo::SivCtrMac,
            ..VaultConfig::new()
        };
        let token = create_vault_config(&config, &master_key).unwrap();

        let unverified = peek_vault_config(&token).unwrap();
        assert_eq!(unverified.claims.format(), 8);
        assert_eq!(unverified.claims.cipher_combo(), Some(CipherCombo::SivCtrMac));
        assert_eq!(unverified.masterkey_file_name().unwrap(), "masterkey.cryptomator");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let master_key = MasterKey::random().unwrap();
        let other = MasterKey::random().unwrap();
        let token = create_vault_config(&VaultConfig::new(), &master_key).unwrap();
        assert!(matches!(
            validate_vault_claims(&token, &other),
            Err(ClaimValidationError::JwtValidation(_))
        ));
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let master_key = MasterKey::random().unwrap();
        let token = create_vault_config(&VaultConfig::new(), &master_key).unwrap();

        let tampered = {
            let mut parts = token.split('.').map(str::to_owned).collect::<Vec<_>>();
            let json = String::from_utf8(BASE64URL_NOPAD.decode(parts[1].as_bytes()).unwrap()).unwrap();
            parts[1] = BASE64URL_NOPAD.encode(json.replace("SIV_GCM", "SIV_CBC").as_bytes());
            parts.join(".")
        };

        assert!(peek_vault_config(&tampered).is_ok());
        assert!(validate_vault_claims(&tampered, &master_key).is_err());
    }

    #[test]
    fn test_kid_parsing() {
        let config = |kid: Option<&str>| UnverifiedVaultConfig {
            kid: kid.map(str::to_owned),
            claims: VaultConfigurationClaims {
                format: 8,
                shortening_threshold: 220,
                jti: String::new(),
                cipher_combo: "SIV_GCM".to_string(),
            },
        };

        assert_eq!(
            config(Some("masterkeyfile:masterkey/masterkey.cryptomator"))
                .masterkey_file_name()
                .unwrap(),
            "masterkey/masterkey.cryptomator"
        );
        assert!(matches!(
            config(None).masterkey_file_name(),
            Err(ClaimValidationError::MissingKid)
        ));
        assert!(matches!(
            config(Some("https://example.com/key")).masterkey_file_name(),
            Err(ClaimValidationError::InvalidKid(_))
        ));
    }
}
