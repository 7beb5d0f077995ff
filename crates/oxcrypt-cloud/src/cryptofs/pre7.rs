//! Layout of vault formats 5 and 6.
//!
//! Children of a physical folder are plain files named after their Base32
//! ciphertext name with a type prefix: `0` for folders (the file holds the
//! directory ID), `1S` for symlinks, none for files. A prefixed name longer
//! than the threshold is replaced by `<base32 sha1>.lng`, and the full name is
//! kept in the vault-wide metadata tree at `m/<h[0..2]>/<h[2..4]>/<hash>.lng`.

use tracing::{debug, instrument, trace, warn};

use super::decorator::{FormatContext, VaultFormatDecorator, ensure_folder};
use super::dir_id_cache::{DirIdCache, TimestampDirIdCache};
use super::node::{CryptoFile, CryptoFolder, CryptoNode, CryptoSymlink};
use super::CryptoFsError;
use crate::cloud::{CloudError, CloudFile, CloudFolder, CloudNode};
use crate::fs::name::{NameEncoding, shortened_lng_name};

pub const FOLDER_PREFIX: &str = "0";
pub const SYMLINK_PREFIX: &str = "1S";
pub const LONG_NAME_SUFFIX: &str = ".lng";
pub const METADATA_FOLDER: &str = "m";

#[derive(Debug)]
pub struct Pre7Decorator {
    context: FormatContext,
    cache: TimestampDirIdCache,
}

impl Pre7Decorator {
    pub fn new(context: FormatContext) -> Self {
        Self {
            context,
            cache: TimestampDirIdCache::new(),
        }
    }

    /// Physical name of `prefix + enc(name)`, and the full name when shortened.
    fn physical_name(
        &self,
        parent_dir_id: &str,
        prefix: &str,
        name: &str,
    ) -> Result<(String, Option<String>), CryptoFsError> {
        let full = format!("{prefix}{}", self.encrypt_name(parent_dir_id, name)?);
        if full.len() > self.context.shortening_threshold {
            let short = format!("{}{LONG_NAME_SUFFIX}", shortened_lng_name(&full));
            Ok((short, Some(full)))
        } else {
            Ok((full, None))
        }
    }

    fn metadata_file(&self, short_name: &str) -> CloudFile {
        let first = short_name.get(..2).unwrap_or(short_name);
        let second = short_name.get(2..4).unwrap_or_default();
        self.metadata_folder(first, second).file(short_name)
    }

    fn metadata_folder(&self, first: &str, second: &str) -> CloudFolder {
        self.context
            .vault_folder
            .folder(METADATA_FOLDER)
            .folder(first)
            .folder(second)
    }

    fn write_metadata(&self, short_name: &str, full: &str) -> Result<(), CryptoFsError> {
        let file = self.metadata_file(short_name);
        ensure_folder(self.context.cloud.as_ref(), &file.parent())?;
        self.context.cloud.write_bytes(&file, full.as_bytes(), true)?;
        Ok(())
    }

    /// Full name behind a `.lng` surrogate, `None` if its metadata is missing.
    fn read_metadata(&self, short_name: &str) -> Result<Option<String>, CloudError> {
        match self.context.cloud.read_bytes(&self.metadata_file(short_name)) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Write the metadata a shortened entry needs before it is created.
    fn prepare_entry(
        &self,
        entry: &CloudFile,
        parent: &CryptoFolder,
        prefix: &str,
        name: &str,
    ) -> Result<(), CryptoFsError> {
        if !entry.name().ends_with(LONG_NAME_SUFFIX) {
            return Ok(());
        }
        let info = self.dir_id_info(parent)?;
        if let (short, Some(full)) = self.physical_name(&info.dir_id, prefix, name)? {
            self.write_metadata(&short, &full)?;
        }
        Ok(())
    }

    /// Rename a surrogate to its full name when that fits the threshold.
    fn inflate(&self, surrogate: CloudFile, full: &str) -> CloudFile {
        if full.len() > self.context.shortening_threshold {
            return surrogate;
        }
        let inflated = surrogate.parent().file(full);
        match self.context.cloud.move_file(&surrogate, &inflated) {
            Ok(moved) => {
                debug!(surrogate = surrogate.name(), "Inflated long name");
                moved.with_modified(surrogate.modified())
            }
            Err(e) => {
                warn!(surrogate = surrogate.name(), error = %e, "Failed to inflate long name");
                surrogate
            }
        }
    }
}

impl VaultFormatDecorator for Pre7Decorator {
    fn context(&self) -> &FormatContext {
        &self.context
    }

    fn dir_id_cache(&self) -> &dyn DirIdCache {
        &self.cache
    }

    fn name_encoding(&self) -> NameEncoding {
        NameEncoding::Base32
    }

    fn folder(&self, parent: &CryptoFolder, name: &str) -> Result<CryptoFolder, CryptoFsError> {
        let info = self.dir_id_info(parent)?;
        let (physical, _) = self.physical_name(&info.dir_id, FOLDER_PREFIX, name)?;
        Ok(CryptoFolder::new(parent, name, info.physical.file(&physical)))
    }

    fn file(
        &self,
        parent: &CryptoFolder,
        name: &str,
        size: Option<u64>,
    ) -> Result<CryptoFile, CryptoFsError> {
        let info = self.dir_id_info(parent)?;
        let (physical, _) = self.physical_name(&info.dir_id, "", name)?;
        Ok(CryptoFile::new(parent, name, info.physical.file(&physical), size))
    }

    #[instrument(level = "debug", skip(self), fields(folder = %folder))]
    fn list(&self, folder: &CryptoFolder) -> Result<Vec<CryptoNode>, CryptoFsError> {
        self.cache.evict_subtree_of(folder);
        let info = self.dir_id_info(folder)?;
        let cryptor = self.context.cryptor()?;

        let mut nodes = Vec::new();
        for child in self.context.cloud.list(&info.physical)? {
            let mut entry = match child {
                CloudNode::File(file) => file,
                CloudNode::Folder(other) => {
                    trace!(entry = other.name(), "Skipping folder in legacy layout");
                    continue;
                }
            };

            let full = if entry.name().ends_with(LONG_NAME_SUFFIX) {
                let Some(full) = self.read_metadata(entry.name())? else {
                    warn!(entry = entry.name(), "Skipping long name without metadata");
                    continue;
                };
                entry = self.inflate(entry, &full);
                full
            } else {
                entry.name().to_string()
            };

            let (prefix, ciphertext) = if let Some(rest) = full.strip_prefix(SYMLINK_PREFIX) {
                (SYMLINK_PREFIX, rest)
            } else if let Some(rest) = full.strip_prefix(FOLDER_PREFIX) {
                (FOLDER_PREFIX, rest)
            } else {
                ("", full.as_str())
            };
            let name = match self.decrypt_name(&info.dir_id, ciphertext) {
                Ok(name) => name,
                Err(e) => {
                    warn!(entry = entry.name(), error = %e, "Skipping entry that failed to decrypt");
                    continue;
                }
            };

            nodes.push(match prefix {
                FOLDER_PREFIX => CryptoNode::Folder(CryptoFolder::new(folder, &name, entry)),
                SYMLINK_PREFIX => CryptoNode::Symlink(CryptoSymlink::new(folder, &name, entry)),
                _ => {
                    let size = entry.size().and_then(|s| cryptor.cleartext_file_size(s));
                    CryptoNode::File(CryptoFile::new(folder, &name, entry, size))
                }
            });
        }
        debug!(entries = nodes.len(), "Listed folder");
        Ok(nodes)
    }

    fn write_dir_file(&self, folder: &CryptoFolder, dir_id: &str) -> Result<(), CryptoFsError> {
        let (Some(parent), Some(dir_file)) = (folder.parent(), folder.dir_file()) else {
            return Ok(());
        };
        self.prepare_entry(dir_file, parent, FOLDER_PREFIX, folder.name())?;
        self.context
            .cloud
            .write_bytes(dir_file, dir_id.as_bytes(), false)?;
        Ok(())
    }

    fn prepare_file_write(&self, file: &CryptoFile) -> Result<(), CryptoFsError> {
        self.prepare_entry(file.cloud_file(), file.parent(), "", file.name())
    }

    #[instrument(level = "debug", skip(self), fields(source = %source, target = %target))]
    fn move_folder(
        &self,
        source: &CryptoFolder,
        target: &CryptoFolder,
    ) -> Result<CryptoFolder, CryptoFsError> {
        let (Some(source_dir), Some(target_parent), Some(target_dir)) =
            (source.dir_file(), target.parent(), target.dir_file())
        else {
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

        self.prepare_entry(target_dir, target_parent, FOLDER_PREFIX, target.name())?;
        self.context.cloud.move_file(source_dir, target_dir)?;
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

        self.prepare_entry(target.cloud_file(), target.parent(), "", target.name())?;
        let moved = self
            .context
            .cloud
            .move_file(source.cloud_file(), target.cloud_file())?;
        Ok(CryptoFile::new(
            target.parent(),
            target.name(),
            moved,
            source.size(),
        ))
    }

    fn delete_entry(&self, node: &CryptoNode) -> Result<(), CryptoFsError> {
        let entry = match node {
            CryptoNode::File(f) => f.cloud_file(),
            CryptoNode::Symlink(s) => s.cloud_file(),
            CryptoNode::Folder(f) => match f.dir_file() {
                Some(dir_file) => dir_file,
                None => return Ok(()),
            },
        };
        self.context.cloud.delete(&CloudNode::File(entry.clone()))?;
        Ok(())
    }
}
