//! Error types of the crate
//!
//! Re-exports the error types and their context structures from the modules
//! that raise them.

pub use crate::cloud::CloudError;
pub use crate::crypto::CryptoError;
pub use crate::crypto::keys::{JwtValidationError, KeyAccessError};
pub use crate::cryptofs::CryptoFsError;
pub use crate::fs::file::{FileContext, FileDecryptionError, FileEncryptionError};
pub use crate::fs::name::{NameContext, NameError};
pub use crate::vault::config::{ClaimValidationError, VaultConfigCreationError};
pub use crate::vault::master_key::MasterKeyCreationError;
pub use crate::vault::provider::VaultProviderError;
pub use crate::vault::registry::MissingCryptor;
