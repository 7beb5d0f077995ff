//! Process-wide map from unlocked vaults to their live cryptors.
//!
//! The registry is the only mutable state shared between vault operations.
//! Entries are added when a vault is unlocked and removed (and their key
//! material wiped) when it is locked. The backing map sits behind the
//! [`CryptorStore`] trait so a host can swap in a store that outlives the
//! current process context; [`CryptorRegistry::migrate_to`] moves every live
//! entry over while holding the registry exclusively.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tracing::{debug, info, instrument};

use super::VaultKey;
use crate::crypto::Cryptor;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No cryptor registered for vault {0}")]
pub struct MissingCryptor(pub VaultKey);

/// Backing map of a [`CryptorRegistry`].
pub trait CryptorStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &VaultKey) -> Option<Arc<dyn Cryptor>>;

    /// Insert unless an entry exists. Returns the existing entry, if any.
    fn put_if_absent(&self, key: VaultKey, cryptor: Arc<dyn Cryptor>) -> Option<Arc<dyn Cryptor>>;

    fn remove(&self, key: &VaultKey) -> Option<Arc<dyn Cryptor>>;

    /// Snapshot of all entries.
    fn entries(&self) -> Vec<(VaultKey, Arc<dyn Cryptor>)>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Default [`CryptorStore`]: a concurrent in-memory map.
#[derive(Debug, Default)]
pub struct InMemoryCryptorStore {
    entries: DashMap<VaultKey, Arc<dyn Cryptor>>,
}

impl InMemoryCryptorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptorStore for InMemoryCryptorStore {
    fn get(&self, key: &VaultKey) -> Option<Arc<dyn Cryptor>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn put_if_absent(&self, key: VaultKey, cryptor: Arc<dyn Cryptor>) -> Option<Arc<dyn Cryptor>> {
        match self.entries.entry(key) {
            Entry::Occupied(existing) => Some(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(cryptor);
                None
            }
        }
    }

    fn remove(&self, key: &VaultKey) -> Option<Arc<dyn Cryptor>> {
        self.entries.remove(key).map(|(_, cryptor)| cryptor)
    }

    fn entries(&self) -> Vec<(VaultKey, Arc<dyn Cryptor>)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Thread-safe registry of live cryptors, keyed by [`VaultKey`].
#[derive(Debug)]
pub struct CryptorRegistry {
    store: RwLock<Arc<dyn CryptorStore>>,
}

impl Default for CryptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptorRegistry {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryCryptorStore::new()))
    }

    pub fn with_store(store: Arc<dyn CryptorStore>) -> Self {
        Self {
            store: RwLock::new(store),
        }
    }

    fn store(&self) -> RwLockReadGuard<'_, Arc<dyn CryptorStore>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &VaultKey) -> Result<Arc<dyn Cryptor>, MissingCryptor> {
        self.store()
            .get(key)
            .ok_or_else(|| MissingCryptor(key.clone()))
    }

    /// A handle that looks the cryptor up each time it is asked, so a lock
    /// between creation and use is observed.
    pub fn supplier(self: &Arc<Self>, key: VaultKey) -> CryptorSupplier {
        CryptorSupplier {
            registry: Arc::clone(self),
            key,
        }
    }

    /// Register `cryptor` unless the vault already has one; returns the existing one.
    #[instrument(level = "debug", skip(self, cryptor), fields(vault = %key))]
    pub fn put_if_absent(&self, key: VaultKey, cryptor: Arc<dyn Cryptor>) -> Option<Arc<dyn Cryptor>> {
        let existing = self.store().put_if_absent(key, cryptor);
        if existing.is_some() {
            debug!("Vault already has a registered cryptor");
        }
        existing
    }

    pub fn remove(&self, key: &VaultKey) -> Option<Arc<dyn Cryptor>> {
        self.store().remove(key)
    }

    /// Deregister the vault's cryptor and wipe its keys. Returns whether one was registered.
    #[instrument(level = "debug", skip(self), fields(vault = %key))]
    pub fn remove_and_destroy(&self, key: &VaultKey) -> bool {
        match self.remove(key) {
            Some(cryptor) => {
                cryptor.destroy();
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.store().is_empty()
    }

    pub fn len(&self) -> usize {
        self.store().len()
    }

    /// Move every registered cryptor into `new_store` and make it the backing store.
    ///
    /// Runs under the registry's write lock: concurrent callers block until
    /// the swap is done and never see a partially migrated registry.
    #[instrument(level = "debug", skip_all)]
    pub fn migrate_to(&self, new_store: Arc<dyn CryptorStore>) {
        let mut store = self.store.write().unwrap_or_else(PoisonError::into_inner);
        let entries = store.entries();
        let migrated = entries.len();
        for (key, cryptor) in entries {
            new_store.put_if_absent(key, cryptor);
        }
        *store = new_store;
        info!(migrated, "Cryptor registry backing store replaced");
    }
}

/// Late-binding access to one vault's cryptor.
#[derive(Debug, Clone)]
pub struct CryptorSupplier {
    registry: Arc<CryptorRegistry>,
    key: VaultKey,
}

impl CryptorSupplier {
    pub fn get(&self) -> Result<Arc<dyn Cryptor>, MissingCryptor> {
        self.registry.get(&self.key)
    }

    pub fn key(&self) -> &VaultKey {
        &self.key
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::crypto::{MasterKey, VaultCryptor};
    use crate::vault::config::CipherCombo;

    fn key(n: usize) -> VaultKey {
        VaultKey {
            cloud_id: "test".to_string(),
            path: format!("/vault{n}"),
        }
    }

    fn cryptor() -> Arc<dyn Cryptor> {
        Arc::new(VaultCryptor::new(
            Arc::new(MasterKey::random().unwrap()),
            CipherCombo::SivGcm,
        ))
    }

    #[test]
    fn test_put_if_absent_keeps_first() {
        let registry = CryptorRegistry::new();
        let first = cryptor();
        assert!(registry.put_if_absent(key(1), Arc::clone(&first)).is_none());
        let existing = registry.put_if_absent(key(1), cryptor()).unwrap();
        assert!(Arc::ptr_eq(&existing, &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_and_destroy_wipes_keys() {
        let registry = CryptorRegistry::new();
        let c = cryptor();
        registry.put_if_absent(key(1), Arc::clone(&c));
        assert!(registry.remove_and_destroy(&key(1)));
        assert!(c.is_destroyed());
        assert!(registry.is_empty());
        assert!(!registry.remove_and_destroy(&key(1)));
        assert_eq!(registry.get(&key(1)).unwrap_err(), MissingCryptor(key(1)));
    }

    #[test]
    fn test_supplier_resolves_at_call_time() {
        let registry = Arc::new(CryptorRegistry::new());
        let supplier = registry.supplier(key(1));
        assert!(supplier.get().is_err());

        registry.put_if_absent(key(1), cryptor());
        assert!(supplier.get().is_ok());

        registry.remove(&key(1));
        assert!(supplier.get().is_err());
    }

    #[test]
    fn test_migrate_preserves_entries() {
        let registry = CryptorRegistry::new();
        let c = cryptor();
        registry.put_if_absent(key(1), Arc::clone(&c));
        registry.put_if_absent(key(2), cryptor());

        let target = Arc::new(InMemoryCryptorStore::new());
        registry.migrate_to(Arc::clone(&target) as Arc<dyn CryptorStore>);

        assert_eq!(target.len(), 2);
        assert!(Arc::ptr_eq(&registry.get(&key(1)).unwrap(), &c));

        registry.put_if_absent(key(3), cryptor());
        assert_eq!(target.len(), 3);
    }

    #[test]
    fn test_concurrent_register_and_migrate() {
        let registry = Arc::new(CryptorRegistry::new());
        let shared = cryptor();
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    for j in 0..50 {
                        registry.put_if_absent(key(i * 100 + j), Arc::clone(&shared));
                    }
                })
            })
            .collect();

        for _ in 0..5 {
            registry.migrate_to(Arc::new(InMemoryCryptorStore::new()));
        }
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}
