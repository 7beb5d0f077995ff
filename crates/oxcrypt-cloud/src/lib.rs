//! Cryptomator-compatible encrypted filesystem over generic cloud storage.
//!
//! File names, directory structure and content of a vault are encrypted
//! before they reach the [`cloud::CloudStore`]; the backend only ever sees
//! opaque ciphertext names and blobs. [`vault::MasterkeyCryptoCloudProvider`]
//! creates and unlocks vaults, [`cryptofs::CryptoCloud`] exposes an unlocked
//! vault as a cleartext filesystem.

pub mod cloud;
pub mod crypto;
pub mod cryptofs;
pub mod error;
pub mod fs;
pub mod vault;

pub use cloud::{CloudStore, LocalCloudStore};
pub use cryptofs::{CryptoCloud, CryptoFile, CryptoFolder, CryptoNode};
pub use vault::{CancelFlag, CryptorRegistry, MasterkeyCryptoCloudProvider, Vault, VaultKey};
