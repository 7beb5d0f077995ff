//! Behaviour shared by both vault format generations.
//!
//! A decorator translates cleartext nodes into ciphertext nodes of the
//! underlying [`CloudStore`]. The format-specific parts (how a name becomes a
//! ciphertext entry, how entries are listed, moved and removed) are required
//! methods; directory ID resolution, streaming content I/O, auto-renaming and
//! recursive deletion are provided on top of them.

use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use super::dir_id_cache::DirIdCache;
use super::node::{CryptoFile, CryptoFolder, CryptoNode, DirIdInfo};
use super::{CryptoFsError, physical_folder};
use crate::cloud::{CloudError, CloudFolder, CloudNode, CloudStore, ProgressAware};
use crate::crypto::Cryptor;
use crate::fs::file::FileContext;
use crate::fs::name::NameEncoding;
use crate::fs::streaming;
use crate::vault::registry::{CryptorSupplier, MissingCryptor};

/// What every decorator needs to reach the store and the vault's cryptor.
#[derive(Debug, Clone)]
pub struct FormatContext {
    pub cloud: Arc<dyn CloudStore>,
    pub cryptor: CryptorSupplier,
    pub vault_folder: CloudFolder,
    pub shortening_threshold: usize,
}

impl FormatContext {
    pub fn cryptor(&self) -> Result<Arc<dyn Cryptor>, MissingCryptor> {
        self.cryptor.get()
    }
}

/// Create `folder`, treating an existing one as success.
pub(crate) fn ensure_folder(cloud: &dyn CloudStore, folder: &CloudFolder) -> Result<(), CloudError> {
    match cloud.create(folder) {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

/// `"name (n).ext"`; names starting with their only dot have no extension.
pub(crate) fn numbered_name(name: &str, n: u32) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({n}){}", &name[..idx], &name[idx..]),
        _ => format!("{name} ({n})"),
    }
}

pub trait VaultFormatDecorator: Send + Sync + fmt::Debug {
    fn context(&self) -> &FormatContext;

    fn dir_id_cache(&self) -> &dyn DirIdCache;

    fn name_encoding(&self) -> NameEncoding;

    /// Handle for the folder `name` inside `parent`. Only I/O is resolving
    /// the parent's directory ID.
    fn folder(&self, parent: &CryptoFolder, name: &str) -> Result<CryptoFolder, CryptoFsError>;

    /// Handle for the file `name` inside `parent`.
    fn file(
        &self,
        parent: &CryptoFolder,
        name: &str,
        size: Option<u64>,
    ) -> Result<CryptoFile, CryptoFsError>;

    /// Decrypted children of `folder`. Entries that fail to decrypt or lack
    /// their metadata are skipped.
    fn list(&self, folder: &CryptoFolder) -> Result<Vec<CryptoNode>, CryptoFsError>;

    /// Persist the ciphertext entry that makes `folder` point at `dir_id`.
    fn write_dir_file(&self, folder: &CryptoFolder, dir_id: &str) -> Result<(), CryptoFsError>;

    /// Called for a newly created physical folder.
    fn write_dir_id_backup(&self, _info: &DirIdInfo) -> Result<(), CryptoFsError> {
        Ok(())
    }

    /// Prepare whatever must exist before `file`'s content is uploaded.
    fn prepare_file_write(&self, file: &CryptoFile) -> Result<(), CryptoFsError>;

    fn move_folder(
        &self,
        source: &CryptoFolder,
        target: &CryptoFolder,
    ) -> Result<CryptoFolder, CryptoFsError>;

    fn move_file(&self, source: &CryptoFile, target: &CryptoFile) -> Result<CryptoFile, CryptoFsError>;

    /// Remove the node's entry from its parent's physical folder.
    fn delete_entry(&self, node: &CryptoNode) -> Result<(), CryptoFsError>;

    fn root(&self) -> CryptoFolder {
        CryptoFolder::root()
    }

    /// Folder for a `/`-separated cleartext path; empty segments are ignored.
    fn resolve(&self, path: &str) -> Result<CryptoFolder, CryptoFsError> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self.root(), |parent, segment| self.folder(&parent, segment))
    }

    fn encrypt_name(&self, parent_dir_id: &str, name: &str) -> Result<String, CryptoFsError> {
        Ok(self
            .context()
            .cryptor()?
            .encrypt_filename(self.name_encoding(), name, parent_dir_id)?)
    }

    fn decrypt_name(&self, parent_dir_id: &str, ciphertext_name: &str) -> Result<String, CryptoFsError> {
        Ok(self
            .context()
            .cryptor()?
            .decrypt_filename(self.name_encoding(), ciphertext_name, parent_dir_id)?)
    }

    /// Directory ID stored in `folder`'s dir file, and whether it was read
    /// from the store. A missing dir file yields a fresh ID: the folder is
    /// not created yet.
    fn load_dir_id(&self, folder: &CryptoFolder) -> Result<(String, bool), CryptoFsError> {
        let Some(dir_file) = folder.dir_file() else {
            return Ok((String::new(), true));
        };
        match self.context().cloud.read_bytes(dir_file) {
            Ok(bytes) if bytes.is_empty() => Err(CryptoFsError::EmptyDirFile {
                path: dir_file.path().to_string(),
            }),
            Ok(bytes) => String::from_utf8(bytes)
                .map(|id| (id, true))
                .map_err(|e| CryptoFsError::InvalidDirId {
                    path: dir_file.path().to_string(),
                    reason: e.to_string(),
                }),
            Err(e) if e.is_not_found() => {
                trace!(folder = folder.path(), "No dir file, minting a directory ID");
                Ok((uuid::Uuid::new_v4().to_string(), false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Directory ID and physical folder of `folder`, cached once read.
    fn dir_id_info(&self, folder: &CryptoFolder) -> Result<DirIdInfo, CryptoFsError> {
        if let Some(info) = self.dir_id_cache().get(folder) {
            return Ok(info);
        }
        let (dir_id, persisted) = self.load_dir_id(folder)?;
        let hashed = self.context().cryptor()?.hash_directory_id(&dir_id)?;
        let info = DirIdInfo {
            physical: physical_folder(&self.context().vault_folder, &hashed),
            dir_id,
        };
        if persisted {
            Ok(self.dir_id_cache().put(folder, info))
        } else {
            Ok(info)
        }
    }

    fn exists(&self, node: &CryptoNode) -> Result<bool, CryptoFsError> {
        let cloud = &self.context().cloud;
        Ok(match node {
            CryptoNode::File(f) => cloud.file_exists(f.cloud_file())?,
            CryptoNode::Symlink(s) => cloud.file_exists(s.cloud_file())?,
            CryptoNode::Folder(f) => match f.dir_file() {
                Some(dir_file) => cloud.file_exists(dir_file)?,
                None => true,
            },
        })
    }

    /// Fail with `NotFound` unless `folder` exists. Children of a folder
    /// that was never created would be named under a throwaway directory ID.
    fn require_folder(&self, folder: &CryptoFolder) -> Result<(), CryptoFsError> {
        if self.exists(&CryptoNode::Folder(folder.clone()))? {
            Ok(())
        } else {
            Err(CloudError::NotFound {
                path: folder.to_string(),
            }
            .into())
        }
    }

    /// Create `folder` with a fresh directory ID.
    ///
    /// Fails with `AlreadyExists` when a file or folder of that name exists,
    /// and with `NotFound` when the parent does not.
    #[instrument(level = "debug", skip(self), fields(folder = %folder))]
    fn create(&self, folder: &CryptoFolder) -> Result<CryptoFolder, CryptoFsError> {
        let parent = folder.parent().ok_or_else(|| CryptoFsError::AlreadyExists {
            path: folder.to_string(),
        })?;
        self.require_folder(parent)?;
        let as_file = self.file(parent, folder.name(), None)?;
        if self.exists(&CryptoNode::Folder(folder.clone()))? || self.exists(&CryptoNode::File(as_file))? {
            return Err(CryptoFsError::AlreadyExists {
                path: folder.to_string(),
            });
        }

        self.dir_id_cache().evict_subtree_of(folder);
        self.dir_id_cache().evict(folder);
        let (dir_id, persisted) = self.load_dir_id(folder)?;
        if persisted {
            // A dir file appeared between the existence check and now.
            return Err(CryptoFsError::AlreadyExists {
                path: folder.to_string(),
            });
        }
        let hashed = self.context().cryptor()?.hash_directory_id(&dir_id)?;
        let info = DirIdInfo {
            physical: physical_folder(&self.context().vault_folder, &hashed),
            dir_id,
        };

        ensure_folder(self.context().cloud.as_ref(), &info.physical)?;
        self.write_dir_file(folder, &info.dir_id)?;
        self.write_dir_id_backup(&info)?;
        debug!(physical = %info.physical, "Folder created");
        self.dir_id_cache().put(folder, info);
        Ok(folder.clone())
    }

    /// Delete a node; folders are removed with everything below them.
    #[instrument(level = "debug", skip(self), fields(node = node.path()))]
    fn delete(&self, node: &CryptoNode) -> Result<(), CryptoFsError> {
        if let CryptoNode::Folder(folder) = node {
            if folder.is_root() {
                return Err(CryptoFsError::InvalidOperation(
                    "the root folder cannot be deleted".to_string(),
                ));
            }
            self.delete_physical_tree(folder)?;
        }
        self.delete_entry(node)?;
        if let CryptoNode::Folder(folder) = node {
            self.dir_id_cache().evict_subtree_of(folder);
            self.dir_id_cache().evict(folder);
        }
        Ok(())
    }

    /// Remove the physical folders of `folder` and all its descendants,
    /// deepest first.
    fn delete_physical_tree(&self, folder: &CryptoFolder) -> Result<(), CryptoFsError> {
        let mut order = vec![(folder.clone(), self.dir_id_info(folder)?)];
        let mut next = 0;
        while next < order.len() {
            let current = order[next].0.clone();
            for child in self.list(&current)? {
                if let CryptoNode::Folder(sub) = child {
                    let info = self.dir_id_info(&sub)?;
                    order.push((sub, info));
                }
            }
            next += 1;
        }

        let cloud = &self.context().cloud;
        for (sub, info) in order.iter().rev() {
            match cloud.delete(&CloudNode::Folder(info.physical.clone())) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    trace!(folder = sub.path(), "Physical folder already gone");
                }
                Err(e) => return Err(e.into()),
            }
            self.dir_id_cache().evict(sub);
        }
        debug!(folders = order.len(), "Deleted physical folders");
        Ok(())
    }

    /// Encrypt and upload `length` bytes from `data` into `file`.
    ///
    /// Without `replace`, an existing file or folder is never overwritten: the
    /// first unused `"name (n).ext"` is taken instead and returned. With
    /// `replace`, a folder of the same name fails the write with `AlreadyExists`.
    #[instrument(level = "debug", skip(self, data, progress), fields(file = %file, length, replace))]
    fn write(
        &self,
        file: &CryptoFile,
        data: &mut dyn Read,
        progress: &dyn ProgressAware,
        replace: bool,
        length: u64,
    ) -> Result<CryptoFile, CryptoFsError> {
        self.require_folder(file.parent())?;
        // Files and folders share one cleartext namespace.
        let taken_by_folder = |candidate: &CryptoFile| {
            self.exists(&CryptoNode::Folder(
                self.folder(candidate.parent(), candidate.name())?,
            ))
        };
        let mut target = file.clone();
        if replace {
            if taken_by_folder(&target)? {
                return Err(CryptoFsError::AlreadyExists {
                    path: target.to_string(),
                });
            }
        } else {
            let mut n = 1;
            while self.exists(&CryptoNode::File(target.clone()))? || taken_by_folder(&target)? {
                target = self.file(file.parent(), &numbered_name(file.name(), n), None)?;
                n += 1;
            }
            if n > 1 {
                debug!(name = target.name(), "Target exists, writing under a new name");
            }
        }
        self.prepare_file_write(&target)?;

        let cryptor = self.context().cryptor()?;
        let context = FileContext::new()
            .with_path(target.path())
            .with_cloud_path(target.cloud_file().path());
        let mut temp = tempfile::tempfile()?;
        let written = streaming::encrypt_stream(cryptor.as_ref(), data, &mut temp, length, progress, &context)?;
        temp.seek(SeekFrom::Start(0))?;

        let uploaded = self
            .context()
            .cloud
            .write(target.cloud_file(), &mut temp, progress, replace, written)?;
        let size = cryptor.cleartext_file_size(written);
        Ok(CryptoFile::new(target.parent(), target.name(), uploaded, size))
    }

    /// Download and decrypt `file` into `sink`.
    #[instrument(level = "debug", skip(self, sink, progress), fields(file = %file))]
    fn read(
        &self,
        file: &CryptoFile,
        sink: &mut dyn Write,
        progress: &dyn ProgressAware,
    ) -> Result<(), CryptoFsError> {
        let cryptor = self.context().cryptor()?;
        let mut temp = tempfile::tempfile()?;
        self.context().cloud.read(file.cloud_file(), &mut temp, progress)?;
        let ciphertext_size = temp.seek(SeekFrom::End(0))?;
        temp.seek(SeekFrom::Start(0))?;

        let context = FileContext::new()
            .with_path(file.path())
            .with_cloud_path(file.cloud_file().path());
        let cleartext_size = file.size().or_else(|| cryptor.cleartext_file_size(ciphertext_size));
        streaming::decrypt_stream(cryptor.as_ref(), &mut temp, sink, cleartext_size, progress, &context)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numbered_name() {
        assert_eq!(numbered_name("report.pdf", 1), "report (1).pdf");
        assert_eq!(numbered_name("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(numbered_name("README", 1), "README (1)");
        assert_eq!(numbered_name(".bashrc", 3), ".bashrc (3)");
    }
}
