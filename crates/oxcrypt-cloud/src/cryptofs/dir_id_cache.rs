//! Cache of resolved directory IDs.
//!
//! Resolving a folder's directory ID costs a download of its dir file, so
//! the result is kept together with the physical folder it maps to.
//! Resolution is read-then-put without compare-and-swap: concurrent first
//! lookups may both hit the store, but they compute the same value.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use lru::LruCache;
use tracing::trace;

use super::node::{CryptoFolder, DirIdInfo};

/// Number of folders each cache remembers.
pub const DIR_ID_CACHE_CAPACITY: usize = 1024;

fn capacity() -> NonZeroUsize {
    NonZeroUsize::new(DIR_ID_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub trait DirIdCache: Send + Sync + fmt::Debug {
    fn get(&self, folder: &CryptoFolder) -> Option<DirIdInfo>;

    /// Remember `info` for `folder` and return it.
    fn put(&self, folder: &CryptoFolder, info: DirIdInfo) -> DirIdInfo;

    fn evict(&self, folder: &CryptoFolder);

    /// Forget every folder below `folder`; `folder` itself is kept.
    fn evict_subtree_of(&self, folder: &CryptoFolder);
}

/// Cache for format 7+ vaults, keyed by cleartext path.
#[derive(Debug)]
pub struct PathDirIdCache {
    entries: Mutex<LruCache<String, DirIdInfo>>,
}

impl Default for PathDirIdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PathDirIdCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity())),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DirIdCache for PathDirIdCache {
    fn get(&self, folder: &CryptoFolder) -> Option<DirIdInfo> {
        lock(&self.entries).get(folder.path()).cloned()
    }

    fn put(&self, folder: &CryptoFolder, info: DirIdInfo) -> DirIdInfo {
        lock(&self.entries).put(folder.path().to_string(), info.clone());
        info
    }

    fn evict(&self, folder: &CryptoFolder) {
        lock(&self.entries).pop(folder.path());
    }

    fn evict_subtree_of(&self, folder: &CryptoFolder) {
        let prefix = format!("{}/", folder.path());
        let mut entries = lock(&self.entries);
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &doomed {
            entries.pop(path);
        }
        if !doomed.is_empty() {
            trace!(folder = folder.path(), evicted = doomed.len(), "Evicted cached subtree");
        }
    }
}

type TimestampKey = (String, Option<SystemTime>);

/// Cache for vaults before format 7, keyed by the ciphertext dir file and its
/// last-modified time.
///
/// A folder resolved without metadata is stored under a key without a
/// timestamp; once it is seen with a timestamp that entry is dropped. Legacy
/// folders carry no path structure worth walking, so subtree eviction does
/// nothing.
#[derive(Debug)]
pub struct TimestampDirIdCache {
    entries: Mutex<LruCache<TimestampKey, DirIdInfo>>,
}

impl Default for TimestampDirIdCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampDirIdCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity())),
        }
    }

    fn key(folder: &CryptoFolder) -> TimestampKey {
        match folder.dir_file() {
            Some(file) => (file.path().to_string(), file.modified()),
            None => (String::new(), None),
        }
    }
}

impl DirIdCache for TimestampDirIdCache {
    fn get(&self, folder: &CryptoFolder) -> Option<DirIdInfo> {
        lock(&self.entries).get(&Self::key(folder)).cloned()
    }

    fn put(&self, folder: &CryptoFolder, info: DirIdInfo) -> DirIdInfo {
        let (path, modified) = Self::key(folder);
        let mut entries = lock(&self.entries);
        if modified.is_some() {
            entries.pop(&(path.clone(), None));
        }
        entries.put((path, modified), info.clone());
        info
    }

    fn evict(&self, folder: &CryptoFolder) {
        let (path, modified) = Self::key(folder);
        let mut entries = lock(&self.entries);
        entries.pop(&(path.clone(), None));
        if modified.is_some() {
            entries.pop(&(path, modified));
        }
    }

    fn evict_subtree_of(&self, _folder: &CryptoFolder) {}
}
