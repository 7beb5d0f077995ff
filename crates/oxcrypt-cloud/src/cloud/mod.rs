//! Generic cloud content store.
//!
//! Everything the encrypted layer persists goes through [`CloudStore`]: a
//! blocking, path-addressed store of opaque files and folders. Backends for
//! specific providers implement the trait; [`LocalCloudStore`] maps it onto a
//! local directory.
//!
//! Paths are `/`-separated and absolute, the store root is `/`.

mod local;
pub mod progress;

use std::fmt;
use std::io::{self, Read, Write};
use std::time::SystemTime;

use thiserror::Error;

pub use local::LocalCloudStore;
pub use progress::{NoProgress, Progress, ProgressAware, ProgressState};

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("Node not found: {path}")]
    NotFound { path: String },

    #[error("Node already exists: {path}")]
    AlreadyExists { path: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Backend error: {0}")]
    Backend(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, CloudError::AlreadyExists { .. })
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

fn parent_path(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// A folder in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudFolder {
    path: String,
}

impl CloudFolder {
    pub fn root() -> Self {
        Self {
            path: "/".to_string(),
        }
    }

    /// Folder at a normalized path: empty segments are dropped, a leading `/` is implied.
    pub fn at(path: &str) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            Self::root()
        } else {
            Self {
                path: format!("/{}", segments.join("/")),
            }
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        last_segment(&self.path)
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    pub fn parent(&self) -> Option<CloudFolder> {
        parent_path(&self.path).map(|path| CloudFolder { path })
    }

    pub fn folder(&self, name: &str) -> CloudFolder {
        CloudFolder {
            path: join_path(&self.path, name),
        }
    }

    pub fn file(&self, name: &str) -> CloudFile {
        CloudFile {
            path: join_path(&self.path, name),
            size: None,
            modified: None,
        }
    }
}

impl fmt::Display for CloudFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// A file in the store with the metadata the backend reported for it.
#[derive(Debug, Clone)]
pub struct CloudFile {
    path: String,
    size: Option<u64>,
    modified: Option<SystemTime>,
}

impl CloudFile {
    pub fn new(parent: &CloudFolder, name: &str, size: Option<u64>) -> Self {
        Self {
            path: join_path(&parent.path, name),
            size,
            modified: None,
        }
    }

    #[must_use]
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        last_segment(&self.path)
    }

    pub fn parent(&self) -> CloudFolder {
        parent_path(&self.path).map_or_else(CloudFolder::root, |path| CloudFolder { path })
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }
}

// Identity is the path; size and timestamps are metadata.
impl PartialEq for CloudFile {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for CloudFile {}

impl std::hash::Hash for CloudFile {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

impl fmt::Display for CloudFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CloudNode {
    File(CloudFile),
    Folder(CloudFolder),
}

impl CloudNode {
    pub fn name(&self) -> &str {
        match self {
            CloudNode::File(f) => f.name(),
            CloudNode::Folder(f) => f.name(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            CloudNode::File(f) => f.path(),
            CloudNode::Folder(f) => f.path(),
        }
    }
}

impl From<CloudFile> for CloudNode {
    fn from(file: CloudFile) -> Self {
        CloudNode::File(file)
    }
}

impl From<CloudFolder> for CloudNode {
    fn from(folder: CloudFolder) -> Self {
        CloudNode::Folder(folder)
    }
}

/// A blocking, path-addressed content store.
///
/// Implementations must be safe to call from several threads at once. Apart
/// from `NotFound` and `AlreadyExists`, errors are passed through the
/// encrypted layer unchanged.
pub trait CloudStore: Send + Sync + fmt::Debug {
    /// Stable identifier of this backend instance, part of a vault's identity.
    fn id(&self) -> &str;

    fn root(&self) -> CloudFolder {
        CloudFolder::root()
    }

    /// Folder handle for `path`. No I/O.
    fn resolve(&self, path: &str) -> Result<CloudFolder, CloudError> {
        Ok(CloudFolder::at(path))
    }

    /// File handle inside `parent`. No I/O.
    fn file(&self, parent: &CloudFolder, name: &str, size: Option<u64>) -> CloudFile {
        CloudFile::new(parent, name, size)
    }

    /// Folder handle inside `parent`. No I/O.
    fn folder(&self, parent: &CloudFolder, name: &str) -> CloudFolder {
        parent.folder(name)
    }

    fn exists(&self, node: &CloudNode) -> Result<bool, CloudError>;

    /// Children of `folder`. Fails with `NotFound` if the folder is missing.
    fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>, CloudError>;

    /// Create `folder` and any missing ancestors. Fails with `AlreadyExists`
    /// if the folder is already there.
    fn create(&self, folder: &CloudFolder) -> Result<CloudFolder, CloudError>;

    /// Fails with `AlreadyExists` if `target` exists.
    fn move_folder(&self, source: &CloudFolder, target: &CloudFolder) -> Result<CloudFolder, CloudError>;

    /// Fails with `AlreadyExists` if `target` exists.
    fn move_file(&self, source: &CloudFile, target: &CloudFile) -> Result<CloudFile, CloudError>;

    /// Upload `size` bytes from `data` into `file`.
    ///
    /// Fails with `AlreadyExists` if the file exists and `replace` is false.
    fn write(
        &self,
        file: &CloudFile,
        data: &mut dyn Read,
        progress: &dyn ProgressAware,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile, CloudError>;

    /// Download `file` into `sink`.
    fn read(
        &self,
        file: &CloudFile,
        sink: &mut dyn Write,
        progress: &dyn ProgressAware,
    ) -> Result<(), CloudError>;

    /// Delete a file, or a folder with everything below it.
    fn delete(&self, node: &CloudNode) -> Result<(), CloudError>;

    fn file_exists(&self, file: &CloudFile) -> Result<bool, CloudError> {
        self.exists(&CloudNode::File(file.clone()))
    }

    fn folder_exists(&self, folder: &CloudFolder) -> Result<bool, CloudError> {
        self.exists(&CloudNode::Folder(folder.clone()))
    }

    /// Read a small file completely.
    fn read_bytes(&self, file: &CloudFile) -> Result<Vec<u8>, CloudError> {
        let mut buffer = Vec::new();
        self.read(file, &mut buffer, &NoProgress)?;
        Ok(buffer)
    }

    /// Write a small file completely.
    fn write_bytes(&self, file: &CloudFile, bytes: &[u8], replace: bool) -> Result<CloudFile, CloudError> {
        let mut reader = bytes;
        self.write(file, &mut reader, &NoProgress, replace, bytes.len() as u64)
    }
}
