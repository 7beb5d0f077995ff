use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use super::{
    CloudError, CloudFile, CloudFolder, CloudNode, CloudStore, Progress, ProgressAware,
    ProgressState,
};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// [`CloudStore`] backed by a directory on the local filesystem.
///
/// Store paths are resolved below `base`. Uploads land in a temporary file in
/// the target directory and are renamed into place, so readers never see a
/// partially written file.
#[derive(Debug, Clone)]
pub struct LocalCloudStore {
    id: String,
    base: PathBuf,
}

impl LocalCloudStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            id: format!("local:{}", base.display()),
            base,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn local_path(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|s| !s.is_empty())
            .fold(self.base.clone(), |acc, segment| acc.join(segment))
    }

    fn io_error(path: &str, source: io::Error) -> CloudError {
        match source.kind() {
            io::ErrorKind::NotFound => CloudError::NotFound {
                path: path.to_string(),
            },
            io::ErrorKind::AlreadyExists => CloudError::AlreadyExists {
                path: path.to_string(),
            },
            _ => CloudError::Io {
                path: path.to_string(),
                source,
            },
        }
    }

    fn ensure_absent(&self, path: &str) -> Result<(), CloudError> {
        if self.local_path(path).exists() {
            Err(CloudError::AlreadyExists {
                path: path.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn copy_with_progress(
        from: &mut dyn Read,
        to: &mut dyn Write,
        state: ProgressState,
        total: Option<u64>,
        progress: &dyn ProgressAware,
    ) -> io::Result<u64> {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut done = 0u64;
        progress.on_progress(Progress::new(state, 0, total));
        loop {
            let n = match from.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            to.write_all(&buffer[..n])?;
            done += n as u64;
            progress.on_progress(Progress::new(state, done, total));
        }
        Ok(done)
    }
}

impl CloudStore for LocalCloudStore {
    fn id(&self) -> &str {
        &self.id
    }

    fn exists(&self, node: &CloudNode) -> Result<bool, CloudError> {
        let local = self.local_path(node.path());
        Ok(match node {
            CloudNode::File(_) => local.is_file(),
            CloudNode::Folder(_) => local.is_dir(),
        })
    }

    #[instrument(level = "trace", skip(self), fields(folder = %folder))]
    fn list(&self, folder: &CloudFolder) -> Result<Vec<CloudNode>, CloudError> {
        let local = self.local_path(folder.path());
        let entries = fs::read_dir(&local).map_err(|e| Self::io_error(folder.path(), e))?;

        let mut nodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_error(folder.path(), e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                trace!(entry = ?entry.file_name(), "Skipping non-UTF-8 entry");
                continue;
            };
            let metadata = entry
                .metadata()
                .map_err(|e| Self::io_error(folder.path(), e))?;
            if metadata.is_dir() {
                nodes.push(CloudNode::Folder(folder.folder(&name)));
            } else if metadata.is_file() {
                nodes.push(CloudNode::File(
                    folder
                        .file(&name)
                        .with_size(Some(metadata.len()))
                        .with_modified(metadata.modified().ok()),
                ));
            }
        }
        Ok(nodes)
    }

    #[instrument(level = "debug", skip(self), fields(folder = %folder))]
    fn create(&self, folder: &CloudFolder) -> Result<CloudFolder, CloudError> {
        let local = self.local_path(folder.path());
        if local.exists() {
            return Err(CloudError::AlreadyExists {
                path: folder.path().to_string(),
            });
        }
        fs::create_dir_all(&local).map_err(|e| Self::io_error(folder.path(), e))?;
        Ok(folder.clone())
    }

    #[instrument(level = "debug", skip(self), fields(source = %source, target = %target))]
    fn move_folder(&self, source: &CloudFolder, target: &CloudFolder) -> Result<CloudFolder, CloudError> {
        self.ensure_absent(target.path())?;
        fs::rename(self.local_path(source.path()), self.local_path(target.path()))
            .map_err(|e| Self::io_error(source.path(), e))?;
        Ok(target.clone())
    }

    #[instrument(level = "debug", skip(self), fields(source = %source, target = %target))]
    fn move_file(&self, source: &CloudFile, target: &CloudFile) -> Result<CloudFile, CloudError> {
        self.ensure_absent(target.path())?;
        fs::rename(self.local_path(source.path()), self.local_path(target.path()))
            .map_err(|e| Self::io_error(source.path(), e))?;
        Ok(target.clone().with_size(source.size()))
    }

    #[instrument(level = "debug", skip(self, data, progress), fields(file = %file, size))]
    fn write(
        &self,
        file: &CloudFile,
        data: &mut dyn Read,
        progress: &dyn ProgressAware,
        replace: bool,
        size: u64,
    ) -> Result<CloudFile, CloudError> {
        let local = self.local_path(file.path());
        if !replace && local.exists() {
            return Err(CloudError::AlreadyExists {
                path: file.path().to_string(),
            });
        }
        let dir = local.parent().unwrap_or(&self.base);
        if !dir.is_dir() {
            return Err(CloudError::NotFound {
                path: file.parent().path().to_string(),
            });
        }

        let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| Self::io_error(file.path(), e))?;
        let written =
            Self::copy_with_progress(data, temp.as_file_mut(), ProgressState::Upload, Some(size), progress)
                .map_err(|e| Self::io_error(file.path(), e))?;
        temp.as_file_mut()
            .sync_all()
            .map_err(|e| Self::io_error(file.path(), e))?;

        if replace {
            temp.persist(&local)
                .map_err(|e| Self::io_error(file.path(), e.error))?;
        } else {
            temp.persist_noclobber(&local)
                .map_err(|e| Self::io_error(file.path(), e.error))?;
        }
        debug!(written, "Upload complete");

        let modified = fs::metadata(&local).and_then(|m| m.modified()).ok();
        Ok(file.clone().with_size(Some(written)).with_modified(modified))
    }

    #[instrument(level = "debug", skip(self, sink, progress), fields(file = %file))]
    fn read(
        &self,
        file: &CloudFile,
        sink: &mut dyn Write,
        progress: &dyn ProgressAware,
    ) -> Result<(), CloudError> {
        let local = self.local_path(file.path());
        let mut source = File::open(&local).map_err(|e| Self::io_error(file.path(), e))?;
        let total = source.metadata().ok().map(|m| m.len());
        Self::copy_with_progress(&mut source, sink, ProgressState::Download, total, progress)
            .map_err(|e| Self::io_error(file.path(), e))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(node = node.path()))]
    fn delete(&self, node: &CloudNode) -> Result<(), CloudError> {
        let local = self.local_path(node.path());
        match node {
            CloudNode::File(_) => fs::remove_file(&local),
            CloudNode::Folder(_) => fs::remove_dir_all(&local),
        }
        .map_err(|e| Self::io_error(node.path(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct Recorder(Mutex<Vec<Progress>>);

    impl ProgressAware for Recorder {
        fn on_progress(&self, progress: Progress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    fn store() -> (TempDir, LocalCloudStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalCloudStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_write_read_and_list() {
        let (_dir, store) = store();
        let folder = store.create(&CloudFolder::at("/a/b")).unwrap();
        let file = store.file(&folder, "data.bin", None);

        let recorder = Recorder(Mutex::new(Vec::new()));
        let written = store
            .write(&file, &mut &b"payload"[..], &recorder, false, 7)
            .unwrap();
        assert_eq!(written.size(), Some(7));
        assert_eq!(
            recorder.0.lock().unwrap().last().copied(),
            Some(Progress::new(ProgressState::Upload, 7, Some(7)))
        );

        assert_eq!(store.read_bytes(&file).unwrap(), b"payload");
        let listed = store.list(&folder).unwrap();
        assert_eq!(listed.len(), 1);
        match &listed[0] {
            CloudNode::File(f) => {
                assert_eq!(f.name(), "data.bin");
                assert_eq!(f.size(), Some(7));
                assert!(f.modified().is_some());
            }
            CloudNode::Folder(_) => panic!("expected a file"),
        }
    }

    #[test]
    fn test_conflicts_and_missing_nodes() {
        let (_dir, store) = store();
        let folder = store.create(&CloudFolder::at("/x")).unwrap();
        assert!(store.create(&folder).unwrap_err().is_already_exists());

        let file = folder.file("f");
        store.write_bytes(&file, b"1", false).unwrap();
        assert!(store.write_bytes(&file, b"2", false).unwrap_err().is_already_exists());
        store.write_bytes(&file, b"3", true).unwrap();
        assert_eq!(store.read_bytes(&file).unwrap(), b"3");

        assert!(store.read_bytes(&folder.file("missing")).unwrap_err().is_not_found());
        assert!(store.list(&CloudFolder::at("/nope")).unwrap_err().is_not_found());
        assert!(store
            .write_bytes(&CloudFolder::at("/nope").file("f"), b"", false)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_move_and_delete() {
        let (_dir, store) = store();
        let a = store.create(&CloudFolder::at("/a")).unwrap();
        let b = store.create(&CloudFolder::at("/b")).unwrap();
        let file = a.file("f");
        store.write_bytes(&file, b"data", false).unwrap();

        let moved = store.move_file(&file, &b.file("g")).unwrap();
        assert!(!store.file_exists(&file).unwrap());
        assert!(store.file_exists(&moved).unwrap());

        store.write_bytes(&a.file("h"), b"", false).unwrap();
        assert!(store.move_file(&a.file("h"), &moved).unwrap_err().is_already_exists());

        let c = store.move_folder(&a, &CloudFolder::at("/c")).unwrap();
        assert!(store.file_exists(&c.file("h")).unwrap());
        assert!(store.move_folder(&c, &b).unwrap_err().is_already_exists());

        store.delete(&CloudNode::Folder(b.clone())).unwrap();
        assert!(!store.folder_exists(&b).unwrap());
        store.delete(&CloudNode::File(c.file("h"))).unwrap();
        assert!(store.list(&c).unwrap().is_empty());
        assert!(store.delete(&CloudNode::File(c.file("h"))).unwrap_err().is_not_found());
    }
}
