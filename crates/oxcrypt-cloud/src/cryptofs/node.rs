//! Cleartext nodes of the virtual filesystem.
//!
//! Every node knows its cleartext name, its cleartext path and the ciphertext
//! file backing it in the cloud store. Paths are derived from the parent
//! chain: the root has the empty path, its children `/a`, theirs `/a/b`.
//! Equality and hashing only look at the cleartext path.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::cloud::{CloudFile, CloudFolder};

fn child_path(parent: &CryptoFolder, name: &str) -> String {
    format!("{}/{}", parent.path, name)
}

/// A cleartext folder.
///
/// `dir_file` is the ciphertext file holding the folder's directory ID; the
/// root has none.
#[derive(Debug, Clone)]
pub struct CryptoFolder {
    name: String,
    path: String,
    parent: Option<Arc<CryptoFolder>>,
    dir_file: Option<CloudFile>,
}

impl CryptoFolder {
    /// The root sentinel: empty name and path, directory ID `""`.
    pub fn root() -> Self {
        Self {
            name: String::new(),
            path: String::new(),
            parent: None,
            dir_file: None,
        }
    }

    pub fn new(parent: &CryptoFolder, name: &str, dir_file: CloudFile) -> Self {
        Self {
            name: name.to_string(),
            path: child_path(parent, name),
            parent: Some(Arc::new(parent.clone())),
            dir_file: Some(dir_file),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> Option<&CryptoFolder> {
        self.parent.as_deref()
    }

    pub fn dir_file(&self) -> Option<&CloudFile> {
        self.dir_file.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Whether `other` lies below this folder.
    pub fn is_ancestor_of(&self, other: &str) -> bool {
        other.len() > self.path.len()
            && other.starts_with(&self.path)
            && other.as_bytes()[self.path.len()] == b'/'
    }
}

/// A cleartext file with its cleartext size, if it could be computed.
#[derive(Debug, Clone)]
pub struct CryptoFile {
    name: String,
    path: String,
    parent: Arc<CryptoFolder>,
    cloud_file: CloudFile,
    size: Option<u64>,
}

impl CryptoFile {
    pub fn new(parent: &CryptoFolder, name: &str, cloud_file: CloudFile, size: Option<u64>) -> Self {
        Self {
            name: name.to_string(),
            path: child_path(parent, name),
            parent: Arc::new(parent.clone()),
            cloud_file,
            size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> &CryptoFolder {
        &self.parent
    }

    pub fn cloud_file(&self) -> &CloudFile {
        &self.cloud_file
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

/// A cleartext symbolic link. Its target is stored encrypted like file content.
#[derive(Debug, Clone)]
pub struct CryptoSymlink {
    name: String,
    path: String,
    parent: Arc<CryptoFolder>,
    cloud_file: CloudFile,
}

impl CryptoSymlink {
    pub fn new(parent: &CryptoFolder, name: &str, cloud_file: CloudFile) -> Self {
        Self {
            name: name.to_string(),
            path: child_path(parent, name),
            parent: Arc::new(parent.clone()),
            cloud_file,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parent(&self) -> &CryptoFolder {
        &self.parent
    }

    pub fn cloud_file(&self) -> &CloudFile {
        &self.cloud_file
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CryptoNode {
    File(CryptoFile),
    Folder(CryptoFolder),
    Symlink(CryptoSymlink),
}

impl CryptoNode {
    pub fn name(&self) -> &str {
        match self {
            CryptoNode::File(f) => f.name(),
            CryptoNode::Folder(f) => f.name(),
            CryptoNode::Symlink(s) => s.name(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            CryptoNode::File(f) => f.path(),
            CryptoNode::Folder(f) => f.path(),
            CryptoNode::Symlink(s) => s.path(),
        }
    }

    pub fn parent(&self) -> Option<&CryptoFolder> {
        match self {
            CryptoNode::File(f) => Some(f.parent()),
            CryptoNode::Folder(f) => f.parent(),
            CryptoNode::Symlink(s) => Some(s.parent()),
        }
    }
}

macro_rules! path_identity {
    ($($ty:ty),*) => {$(
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.path == other.path
            }
        }

        impl Eq for $ty {}

        impl Hash for $ty {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.path.hash(state);
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.path.is_empty() {
                    f.write_str("/")
                } else {
                    f.write_str(&self.path)
                }
            }
        }
    )*};
}

path_identity!(CryptoFolder, CryptoFile, CryptoSymlink);

impl From<CryptoFile> for CryptoNode {
    fn from(file: CryptoFile) -> Self {
        CryptoNode::File(file)
    }
}

impl From<CryptoFolder> for CryptoNode {
    fn from(folder: CryptoFolder) -> Self {
        CryptoNode::Folder(folder)
    }
}

/// Directory ID of a folder and the physical ciphertext folder it maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirIdInfo {
    pub dir_id: String,
    pub physical: CloudFolder,
}
