#![forbid(unsafe_code)]

use std::sync::RwLock;

use generic_array::{GenericArray, typenum::U64};
use memsafe::MemSafe;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Error type for key access operations.
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// Memory protection operation failed (mlock, mprotect, etc.)
    #[error("Memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock was poisoned (a thread panicked while holding it)
    #[error("Key lock was poisoned")]
    LockPoisoned,

    /// The key material has been wiped by [`MasterKey::destroy`].
    #[error("Key material has been destroyed")]
    Destroyed,
}

impl KeyAccessError {
    pub fn memory_protection<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        KeyAccessError::MemoryProtection(Box::new(err))
    }
}

/// Error type for JWT validation operations.
#[derive(Debug, Error)]
pub enum JwtValidationError {
    #[error("Key access failed: {0}")]
    KeyAccess(#[from] KeyAccessError),

    #[error("JWT validation failed: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),
}

type KeySlot = RwLock<Option<MemSafe<[u8; 32]>>>;

/// Master key pair of an unlocked vault.
///
/// Holds the 256-bit AES encryption key and the 256-bit MAC key. Both live in
/// `MemSafe` containers (mlock'd, `PROT_NONE` while idle, zeroed on drop) and
/// are only reachable through scoped `with_*` accessors.
///
/// Locking a vault calls [`MasterKey::destroy`], which wipes both keys while
/// other handles to the same `MasterKey` may still exist. Every later access
/// fails with [`KeyAccessError::Destroyed`].
#[derive(Debug)]
pub struct MasterKey {
    aes_master_key: KeySlot,
    mac_master_key: KeySlot,
}

impl MasterKey {
    /// Generate a new random master key pair.
    pub fn random() -> Result<Self, KeyAccessError> {
        let mut aes_master_key = [0u8; 32];
        let mut mac_master_key = [0u8; 32];
        rand::rng().fill_bytes(&mut aes_master_key);
        rand::rng().fill_bytes(&mut mac_master_key);
        let key = Self::new(aes_master_key, mac_master_key);
        aes_master_key.zeroize();
        mac_master_key.zeroize();
        key
    }

    /// Create a master key pair from raw key material.
    ///
    /// The arrays are copied into protected memory; zeroing the originals is
    /// the caller's responsibility.
    pub fn new(aes_key: [u8; 32], mac_key: [u8; 32]) -> Result<Self, KeyAccessError> {
        Ok(MasterKey {
            aes_master_key: RwLock::new(Some(
                MemSafe::new(aes_key).map_err(KeyAccessError::memory_protection)?,
            )),
            mac_master_key: RwLock::new(Some(
                MemSafe::new(mac_key).map_err(KeyAccessError::memory_protection)?,
            )),
        })
    }

    /// Try to clone the master key.
    pub fn try_clone(&self) -> Result<Self, KeyAccessError> {
        let mut aes_key = self.with_aes_key(|k| *k)?;
        let mut mac_key = self.with_mac_key(|k| *k)?;
        let cloned = Self::new(aes_key, mac_key);
        aes_key.zeroize();
        mac_key.zeroize();
        cloned
    }

    fn with_slot<F, R>(slot: &KeySlot, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        // MemSafe::read needs &mut, hence the write lock
        let mut lock = slot.write().map_err(|_| KeyAccessError::LockPoisoned)?;
        let safe = lock.as_mut().ok_or(KeyAccessError::Destroyed)?;
        let guard = safe.read().map_err(KeyAccessError::memory_protection)?;
        Ok(f(&guard))
    }

    /// Run `f` with the 64-byte `AES || MAC` key material.
    pub fn with_raw_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        struct ZeroOnDrop([u8; 64]);
        impl Drop for ZeroOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroOnDrop([0u8; 64]);
        Self::with_slot(&self.aes_master_key, |k| key.0[..32].copy_from_slice(k))?;
        Self::with_slot(&self.mac_master_key, |k| key.0[32..].copy_from_slice(k))?;
        Ok(f(&key.0))
    }

    /// Run `f` with the AES encryption key.
    pub fn with_aes_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        Self::with_slot(&self.aes_master_key, f)
    }

    /// Run `f` with the MAC key.
    pub fn with_mac_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; 32]) -> R,
    {
        Self::with_slot(&self.mac_master_key, f)
    }

    /// Run `f` with both keys in AES-SIV order (`MAC || AES`).
    pub fn with_siv_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&GenericArray<u8, U64>) -> R,
    {
        struct ZeroizeOnDrop(GenericArray<u8, U64>);
        impl Drop for ZeroizeOnDrop {
            fn drop(&mut self) {
                self.0.zeroize();
            }
        }

        let mut key = ZeroizeOnDrop(GenericArray::<u8, U64>::default());
        Self::with_slot(&self.mac_master_key, |k| key.0[..32].copy_from_slice(k))?;
        Self::with_slot(&self.aes_master_key, |k| key.0[32..].copy_from_slice(k))?;
        Ok(f(&key.0))
    }

    /// Create a JWT encoding key from the combined key material.
    ///
    /// `jsonwebtoken` does not zeroize its keys, so keep the result short-lived.
    pub fn create_jwt_encoding_key(&self) -> Result<jsonwebtoken::EncodingKey, KeyAccessError> {
        self.with_raw_key(jsonwebtoken::EncodingKey::from_secret)
    }

    /// Validate and decode a JWT signed with this master key.
    pub fn validate_jwt<T>(
        &self,
        token: &str,
        validation: &jsonwebtoken::Validation,
    ) -> Result<T, JwtValidationError>
    where
        T: serde::de::DeserializeOwned,
    {
        let jwt_result = self.with_raw_key(|key_bytes| {
            let decoding_key = jsonwebtoken::DecodingKey::from_secret(key_bytes);
            jsonwebtoken::decode::<T>(token, &decoding_key, validation)
                .map(|token_data| token_data.claims)
        })?;
        jwt_result.map_err(JwtValidationError::from)
    }

    /// Wipe both keys. Idempotent.
    pub fn destroy(&self) {
        for slot in [&self.aes_master_key, &self.mac_master_key] {
            // a poisoned slot still gets cleared
            let mut lock = slot
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            lock.take();
        }
    }

    /// Whether [`MasterKey::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.aes_master_key
            .read()
            .map_or(true, |slot| slot.is_none())
    }
}
