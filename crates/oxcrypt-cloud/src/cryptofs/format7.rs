//! Layout of vault formats 7 and 8.
//!
//! Inside a physical folder every child is an entry named after its
//! Base64url ciphertext name plus `.c9r`:
//!
//! | Node    | Short form                  | Long form (name over threshold)              |
//! |---------|-----------------------------|----------------------------------------------|
//! | File    | `<name>.c9r`                | `<hash>.c9s/contents.c9r` + `name.c9s`       |
//! | Folder  | `<name>.c9r/dir.c9r`        | `<hash>.c9s/dir.c9r` + `name.c9s`            |
//! | Symlink | `<name>.c9r/symlink.c9r`    | `<hash>.c9s/symlink.c9r` + `name.c9s`        |
//!
//! `<hash>` is the Base64url SHA-1 of the full `<name>.c9r`, which `name.c9s`
//! stores. `dir.c9r` holds the folder's directory ID in plaintext; format 8
//! additionally keeps an encrypted copy of each folder's own ID in its
//! physical folder as `dirid.c9r`.

use tracing::{debug, instrument, trace, warn};

use super::decorator::{FormatContext, VaultFormatDecorator, ensure_folder};
use super::dir_id_cache::{DirIdCache, PathDirIdCache};
use super::node::{CryptoFile, CryptoFolder, CryptoNode, CryptoSymlink, DirIdInfo};
use super::{CryptoFsError, DIR_ID_BACKUP_FILENAME};
use crate::cloud::{CloudFile, CloudFolder, CloudNode};
use crate::crypto::Cryptor;
use crate::fs::file::FileContext;
use crate::fs::name::{NameEncoding, shortened_c9s_name};
use crate::fs::streaming;

pub const C9R_EXTENSION: &str = ".c9r";
pub const C9S_EXTENSION: &str = ".c9s";
pub const DIR_FILENAME: &str = "dir.c9r";
pub const SYMLINK_FILENAME: &str = "symlink.c9r";
pub const CONTENTS_FILENAME: &str = "contents.c9r";
pub const LONG_NAME_FILENAME: &str = "name.c9s";

/// First format that writes `dirid.c9r`.
const DIR_ID_BACKUP_MIN_VERSION: u32 = 8;

/// Ciphertext naming of one child.
struct EntryName {
    /// `<name>.c9r`, always the full ciphertext name.
    full: String,
    /// Name of the entry in the physical folder: `full` or `<hash>.c9s`.
    physical: String,
}

impl EntryName {
    fn is_long(&self) -> bool {
        self.physical.ends_with(C9S_EXTENSION)
    }
}

fn is_long_container(container: &CloudFolder) -> bool {
    container.name().ends_with(C9S_EXTENSION)
}

/// Whether a file's ciphertext is `contents.c9r` inside a `.c9s` container.
fn is_long_file(file: &CloudFile) -> bool {
    file.name() == CONTENTS_FILENAME && is_long_container(&file.parent())
}

#[derive(Debug)]
pub struct Format7Decorator {
    context: FormatContext,
    cache: PathDirIdCache,
    version: u32,
}

impl Format7Decorator {
    pub fn new(context: FormatContext, version: u32) -> Self {
        Self {
            context,
            cache: PathDirIdCache::new(),
            version,
        }
    }

    fn entry_name(&self, parent_dir_id: &str, name: &str) -> Result<EntryName, CryptoFsError> {
        let full = format!("{}{C9R_EXTENSION}", self.encrypt_name(parent_dir_id, name)?);
        let physical = if full.len() > self.context.shortening_threshold {
            format!("{}{C9S_EXTENSION}", shortened_c9s_name(&full))
        } else {
            full.clone()
        };
        Ok(EntryName { full, physical })
    }

    /// Entry name of an existing node, recomputed from its parent.
    fn entry_name_of(&self, parent: &CryptoFolder, name: &str) -> Result<EntryName, CryptoFsError> {
        let info = self.dir_id_info(parent)?;
        self.entry_name(&info.dir_id, name)
    }

    fn write_long_name(&self, container: &CloudFolder, full: &str) -> Result<(), CryptoFsError> {
        self.context
            .cloud
            .write_bytes(&container.file(LONG_NAME_FILENAME), full.as_bytes(), true)?;
        Ok(())
    }

    fn delete_container(&self, container: &CloudFolder) -> Result<(), CryptoFsError> {
        self.context
            .cloud
            .delete(&CloudNode::Folder(container.clone()))?;
        Ok(())
    }

    /// Decrypt a `<name>.c9r` found in the folder `dir_id`.
    fn decrypt_entry(&self, dir_id: &str, full: &str) -> Option<String> {
        let Some(ciphertext) = full.strip_suffix(C9R_EXTENSION) else {
            trace!(entry = full, "Not a ciphertext entry");
            return None;
        };
        match self.decrypt_name(dir_id, ciphertext) {
            Ok(name) => Some(name),
            Err(e) => {
                warn!(entry = full, error = %e, "Skipping entry that failed to decrypt");
                None
            }
        }
    }

    /// Classify a container folder by its payload file.
    fn container_node(
        &self,
        cryptor: &dyn Cryptor,
        parent: &CryptoFolder,
        name: &str,
        container: &CloudFolder,
        children: &[CloudNode],
    ) -> Option<CryptoNode> {
        let payload = |wanted: &str| {
            children.iter().find_map(|child| match child {
                CloudNode::File(f) if f.name() == wanted => Some(f.clone()),
                _ => None,
            })
        };

        if let Some(dir_file) = payload(DIR_FILENAME) {
            return Some(CryptoNode::Folder(CryptoFolder::new(parent, name, dir_file)));
        }
        if let Some(link) = payload(SYMLINK_FILENAME) {
            return Some(CryptoNode::Symlink(CryptoSymlink::new(parent, name, link)));
        }
        if is_long_container(container) {
            if let Some(contents) = payload(CONTENTS_FILENAME) {
                let size = contents.size().and_then(|s| cryptor.cleartext_file_size(s));
                return Some(CryptoNode::File(CryptoFile::new(parent, name, contents, size)));
            }
        }
        warn!(container = %container, "Skipping container without payload");
        None
    }

    /// Move the single payload file of a container, creating the target container.
    fn move_payload(
        &self,
        source: &CloudFile,
        target: &CloudFile,
        target_long_name: Option<&str>,
    ) -> Result<CloudFile, CryptoFsError> {
        let cloud = &self.context.cloud;
        let container = target.parent();
        ensure_folder(cloud.as_ref(), &container)?;
        let moved = cloud.move_file(source, target)?;
        // No rollback if this write fails: the next listing skips the container.
        if let Some(full) = target_long_name {
            self.write_long_name(&container, full)?;
        }
        Ok(moved)
    }
}

impl VaultFormatDecorator for Format7Decorator {
    fn context(&self) -> &FormatContext {
        &self.context
    }

    fn dir_id_cache(&self) -> &dyn DirIdCache {
        &self.cache
    }

    fn name_encoding(&self) -> NameEncoding {
        NameEncoding::Base64Url
    }

    fn folder(&self, parent: &CryptoFolder, name: &str) -> Result<CryptoFolder, CryptoFsError> {
        let info = self.dir_id_info(parent)?;
        let entry = self.entry_name(&info.dir_id, name)?;
        let dir_file = info.physical.folder(&entry.physical).file(DIR_FILENAME);
        Ok(CryptoFolder::new(parent, name, dir_file))
    }

    fn file(
        &self,
        parent: &CryptoFolder,
        name: &str,
        size: Option<u64>,
    ) -> Result<CryptoFile, CryptoFsError> {
        let info = self.dir_id_info(parent)?;
        let entry = self.entry_name(&info.dir_id, name)?;
        let cloud_file = if entry.is_long() {
            info.physical.folder(&entry.physical).file(CONTENTS_FILENAME)
        } else {
            info.physical.file(&entry.physical)
        };
        Ok(CryptoFile::new(parent, name, cloud_file, size))
    }

    #[instrument(level = "debug", skip(self), fields(folder = %folder))]
    fn list(&self, folder: &CryptoFolder) -> Result<Vec<CryptoNode>, CryptoFsError> {
        self.cache.evict_subtree_of(folder);
        let info = self.dir_id_info(folder)?;
        let cryptor = self.context.cryptor()?;
        let cloud = &self.context.cloud;

        let mut nodes = Vec::new();
        for child in cloud.list(&info.physical)? {
            match child {
                CloudNode::File(f) if f.name() == DIR_ID_BACKUP_FILENAME => {}
                CloudNode::File(f) => {
                    let Some(name) = self.decrypt_entry(&info.dir_id, f.name()) else {
                        continue;
                    };
                    let size = f.size().and_then(|s| cryptor.cleartext_file_size(s));
                    nodes.push(CryptoNode::File(CryptoFile::new(folder, &name, f, size)));
                }
                CloudNode::Folder(container) if container.name().ends_with(C9S_EXTENSION) => {
                    let full = match cloud.read_bytes(&container.file(LONG_NAME_FILENAME)) {
                        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                        Err(e) if e.is_not_found() => {
                            warn!(container = %container, "Skipping long name without name.c9s");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    let Some(name) = self.decrypt_entry(&info.dir_id, &full) else {
                        continue;
                    };
                    let children = cloud.list(&container)?;
                    if let Some(node) =
                        self.container_node(cryptor.as_ref(), folder, &name, &container, &children)
                    {
                        nodes.push(node);
                    }
                }
                CloudNode::Folder(container) => {
                    let Some(name) = self.decrypt_entry(&info.dir_id, container.name()) else {
                        continue;
                    };
                    let children = cloud.list(&container)?;
                    if let Some(node) =
                        self.container_node(cryptor.as_ref(), folder, &name, &container, &children)
                    {
                        nodes.push(node);
                    }
                }
            }
        }
        debug!(entries = nodes.len(), "Listed folder");
        Ok(nodes)
    }

    fn write_dir_file(&self, folder: &CryptoFolder, dir_id: &str) -> Result<(), CryptoFsError> {
        let (Some(parent), Some(dir_file)) = (folder.parent(), folder.dir_file()) else {
            return Ok(());
        };
        let container = dir_file.parent();
        ensure_folder(self.context.cloud.as_ref(), &container)?;
        if is_long_container(&container) {
            let entry = self.entry_name_of(parent, folder.name())?;
            self.write_long_name(&container, &entry.full)?;
        }
        self.context
            .cloud
            .write_bytes(dir_file, dir_id.as_bytes(), false)?;
        Ok(())
    }

    fn write_dir_id_backup(&self, info: &DirIdInfo) -> Result<(), CryptoFsError> {
        if self.version < DIR_ID_BACKUP_MIN_VERSION {
            return Ok(());
        }
        let cryptor = self.context.cryptor()?;
        let backup = info.physical.file(DIR_ID_BACKUP_FILENAME);
        let encrypted = streaming::encrypt_to_vec(
            cryptor.as_ref(),
            info.dir_id.as_bytes(),
            &FileContext::new().with_cloud_path(backup.path()),
        )?;
        self.context.cloud.write_bytes(&backup, &encrypted, true)?;
        Ok(())
    }

    fn prepare_file_write(&self, file: &CryptoFile) -> Result<(), CryptoFsError> {
        if !is_long_file(file.cloud_file()) {
            return Ok(());
        }
        let container = file.cloud_file().parent();
        ensure_folder(self.context.cloud.as_ref(), &container)?;
        let entry = self.entry_name_of(file.parent(), file.name())?;
        self.write_long_name(&container, &entry.full)
    }

    #[instrument(level = "debug", skip(self), fields(source = %source, target = %target))]
    fn move_folder(
        &self,
        source: &CryptoFolder,
        target: &CryptoFolder,
    ) -> Result<CryptoFolder, CryptoFsError> {
        let (Some(source_parent), Some(source_dir), Some(target_parent), Some(target_dir)) = (
            source.parent(),
            source.dir_file(),
            target.parent(),
            target.dir_file(),
        ) else {
            return Err(CryptoFsError::InvalidOperation(
                "the root folder cannot be moved".to_string(),
            ));
        };
        if self.exists(&CryptoNode::Folder(target.clone()))?
            || self.exists(&CryptoNode::File(self.file(target_parent, target.name(), None)?))?
        {
            return Err(CryptoFsError::AlreadyExists {
                path: target.to_string(),
            });
        }

        let source_container = source_dir.parent();
        let target_container = target_dir.parent();
        match (is_long_container(&source_container), is_long_container(&target_container)) {
            (false, false) => {
                self.context
                    .cloud
                    .move_folder(&source_container, &target_container)?;
            }
            (false, true) | (true, true) => {
                let entry = self.entry_name_of(target_parent, target.name())?;
                self.move_payload(source_dir, target_dir, Some(&entry.full))?;
                self.delete_container(&source_container)?;
            }
            (true, false) => {
                self.move_payload(source_dir, target_dir, None)?;
                self.delete_container(&source_container)?;
            }
        }
        trace!(from = source_parent.path(), "Folder moved");

        self.cache.evict_subtree_of(source);
        self.cache.evict(source);
        self.cache.evict(target);
        Ok(target.clone())
    }

    #[instrument(level = "debug", skip(self), fields(source = %source, target = %target))]
    fn move_file(&self, source: &CryptoFile, target: &CryptoFile) -> Result<CryptoFile, CryptoFsError> {
        if self.exists(&CryptoNode::File(target.clone()))?
            || self.exists(&CryptoNode::Folder(self.folder(target.parent(), target.name())?))?
        {
            return Err(CryptoFsError::AlreadyExists {
                path: target.to_string(),
            });
        }

        let source_file = source.cloud_file();
        let target_file = target.cloud_file();
        let moved = match (is_long_file(source_file), is_long_file(target_file)) {
            (false, false) => self.context.cloud.move_file(source_file, target_file)?,
            (false, true) => {
                let entry = self.entry_name_of(target.parent(), target.name())?;
                self.move_payload(source_file, target_file, Some(&entry.full))?
            }
            (true, false) => {
                let moved = self.context.cloud.move_file(source_file, target_file)?;
                self.delete_container(&source_file.parent())?;
                moved
            }
            (true, true) => {
                let entry = self.entry_name_of(target.parent(), target.name())?;
                let moved = self.move_payload(source_file, target_file, Some(&entry.full))?;
                self.delete_container(&source_file.parent())?;
                moved
            }
        };
        Ok(CryptoFile::new(
            target.parent(),
            target.name(),
            moved,
            source.size(),
        ))
    }

    fn delete_entry(&self, node: &CryptoNode) -> Result<(), CryptoFsError> {
        let cloud = &self.context.cloud;
        match node {
            CryptoNode::File(f) if is_long_file(f.cloud_file()) => {
                self.delete_container(&f.cloud_file().parent())
            }
            CryptoNode::File(f) => {
                cloud.delete(&CloudNode::File(f.cloud_file().clone()))?;
                Ok(())
            }
            CryptoNode::Symlink(s) => self.delete_container(&s.cloud_file().parent()),
            CryptoNode::Folder(f) => match f.dir_file() {
                Some(dir_file) => self.delete_container(&dir_file.parent()),
                None => Ok(()),
            },
        }
    }
}
