//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use oxcrypt_cloud::cloud::{CloudFolder, CloudStore, LocalCloudStore};
use oxcrypt_cloud::cryptofs::{CryptoCloud, CryptoFile, CryptoFolder, CryptoNode};
use oxcrypt_cloud::vault::{
    CancelFlag, CryptorRegistry, MasterkeyCryptoCloudProvider, ScryptParams, Vault,
};
use tempfile::TempDir;

pub const PASSWORD: &str = "correct horse battery staple";

/// Cheap scrypt cost so vault creation and unlock stay fast.
pub const FAST_KDF: ScryptParams = ScryptParams {
    log2_n: 4,
    r: 8,
    p: 1,
};

static TRACING: Once = Once::new();

/// Install a subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A local cloud store in a temporary directory with a provider over it.
pub struct TestCloud {
    pub dir: TempDir,
    pub cloud: Arc<dyn CloudStore>,
    pub registry: Arc<CryptorRegistry>,
    pub provider: MasterkeyCryptoCloudProvider,
}

impl TestCloud {
    pub fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let cloud: Arc<dyn CloudStore> = Arc::new(LocalCloudStore::new(dir.path()));
        let registry = Arc::new(CryptorRegistry::new());
        let provider = MasterkeyCryptoCloudProvider::with_scrypt_params(
            Arc::clone(&cloud),
            Arc::clone(&registry),
            FAST_KDF,
        );
        Self {
            dir,
            cloud,
            registry,
            provider,
        }
    }

    /// Create and unlock a format 8 vault at `/vault`.
    pub fn unlocked_vault(&self) -> (Vault, CryptoCloud) {
        let vault = self
            .provider
            .create(&CloudFolder::at("/vault"), PASSWORD, &CancelFlag::new())
            .unwrap();
        self.open(&vault)
    }

    /// Unlock `vault` and open it.
    pub fn open(&self, vault: &Vault) -> (Vault, CryptoCloud) {
        let vault = self
            .provider
            .unlock(vault, PASSWORD, &CancelFlag::new())
            .unwrap();
        let fs = CryptoCloud::new(&vault, Arc::clone(&self.cloud), &self.registry).unwrap();
        (vault, fs)
    }
}

pub fn write_file(fs: &CryptoCloud, parent: &CryptoFolder, name: &str, content: &[u8]) -> CryptoFile {
    let file = fs.file(parent, name, None).unwrap();
    fs.write_bytes(&file, content, false).unwrap()
}

pub fn sorted_names(nodes: &[CryptoNode]) -> Vec<String> {
    let mut names: Vec<String> = nodes.iter().map(|n| n.name().to_string()).collect();
    names.sort();
    names
}

pub fn find_file(nodes: &[CryptoNode], name: &str) -> CryptoFile {
    nodes
        .iter()
        .find_map(|n| match n {
            CryptoNode::File(f) if f.name() == name => Some(f.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no file named {name}"))
}

/// All paths below `base`, relative, in sorted order.
pub fn physical_tree(base: &std::path::Path) -> Vec<String> {
    fn walk(dir: &std::path::Path, base: &std::path::Path, out: &mut Vec<String>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            out.push(path.strip_prefix(base).unwrap().to_string_lossy().into_owned());
            if path.is_dir() {
                walk(&path, base, out);
            }
        }
    }
    let mut out = Vec::new();
    if base.exists() {
        walk(base, base, &mut out);
    }
    out.sort();
    out
}
