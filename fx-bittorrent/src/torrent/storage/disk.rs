use crate::torrent::storage::{Error, FileEntry, Result, Storage};
use async_trait::async_trait;
use log::{debug, trace};
use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{create_dir_all, remove_dir_all, remove_file, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// File system storage for the torrent files.
///
/// Files are opened lazily on first use and their handles are kept open until the storage is
/// dropped. A file is created with its full length on the first write, and recreated when the
/// existing path is a directory or has the wrong size.
#[derive(Debug)]
pub struct DiskStorage {
    path: PathBuf,
    handles: Mutex<HashMap<PathBuf, File>>,
}

impl DiskStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            handles: Default::default(),
        }
    }

    /// Get the root path of the storage.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Get the absolute filepath for the given filepath within the storage.
    /// This prevents file paths from traversing upwards/leaving the storage path.
    fn absolute_filepath(&self, filepath: &Path) -> Result<PathBuf> {
        let absolute_path = self.path.join(filepath);
        let base = Self::canonicalize_unchecked(&self.path);
        let target = Self::canonicalize_unchecked(&absolute_path);

        if target == base || !target.starts_with(&base) {
            return Err(Error::InvalidFilepath(filepath.to_path_buf()));
        }

        Ok(absolute_path)
    }

    /// Get the open file handle of the given entry.
    ///
    /// When `create` is false and the file doesn't exist in a usable state, [None] is returned.
    async fn open<'a>(
        &self,
        handles: &'a mut HashMap<PathBuf, File>,
        entry: &FileEntry,
        create: bool,
    ) -> Result<Option<&'a mut File>> {
        let absolute_path = self.absolute_filepath(&entry.path)?;

        if !handles.contains_key(&absolute_path) {
            match tokio::fs::metadata(&absolute_path).await {
                Ok(meta) if meta.is_file() && meta.len() == entry.length as u64 => {}
                Ok(_) if !create => return Ok(None),
                Ok(meta) => {
                    debug!(
                        "Disk storage is recreating {:?}, directory {}, size {}",
                        absolute_path,
                        meta.is_dir(),
                        meta.len()
                    );
                    if meta.is_dir() {
                        remove_dir_all(&absolute_path).await?;
                    } else {
                        remove_file(&absolute_path).await?;
                    }
                    Self::create(&absolute_path, entry.length).await?;
                }
                Err(e) if e.kind() == ErrorKind::NotFound && !create => return Ok(None),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Self::create(&absolute_path, entry.length).await?;
                }
                Err(e) => return Err(Error::Io(e)),
            }

            trace!("Disk storage is opening {:?}", absolute_path);
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&absolute_path)
                .await?;
            handles.insert(absolute_path.clone(), handle);
        }

        Ok(handles.get_mut(&absolute_path))
    }

    /// Create the given file with the given length, including any missing parent directories.
    async fn create(path: &Path, length: usize) -> Result<()> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        file.set_len(length as u64).await?;
        debug!("Disk storage created {:?} with {} bytes", path, length);
        Ok(())
    }

    /// Get the canonicalized path for the given path.
    /// This function traverses the path components and resolves ".." and "." appropriately,
    /// without touching the file system.
    fn canonicalize_unchecked(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();

        for component in path.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(part) => {
                    result.push(part);
                }
                _ => {}
            }
        }

        result
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn read(&self, file: &FileEntry, offset: usize, buffer: &mut [u8]) -> Result<usize> {
        if offset + buffer.len() > file.length {
            return Err(Error::OutOfBounds);
        }

        let mut handles = self.handles.lock().await;
        let handle = self
            .open(&mut handles, file, false)
            .await?
            .ok_or(Error::Unavailable)?;

        handle.seek(SeekFrom::Start(offset as u64)).await?;
        handle.read_exact(buffer).await?;
        Ok(buffer.len())
    }

    async fn write(&self, file: &FileEntry, offset: usize, data: &[u8]) -> Result<usize> {
        if offset + data.len() > file.length {
            return Err(Error::OutOfBounds);
        }

        let mut handles = self.handles.lock().await;
        let handle = self
            .open(&mut handles, file, true)
            .await?
            .ok_or(Error::Unavailable)?;

        handle.seek(SeekFrom::Start(offset as u64)).await?;
        handle.write_all(data).await?;
        handle.flush().await?;
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_read() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let storage = DiskStorage::new(temp_dir.path());
        let file = FileEntry {
            path: PathBuf::from("foo").join("bar.txt"),
            length: 20,
        };

        let result = storage.write(&file, 5, b"lorem").await;
        assert_eq!(Ok(5), result, "expected all bytes to have been written");

        let metadata = std::fs::metadata(temp_dir.path().join("foo").join("bar.txt")).unwrap();
        assert_eq!(20, metadata.len(), "expected the file to have its full length");

        let mut buffer = vec![0u8; 10];
        let result = storage.read(&file, 0, &mut buffer).await;
        assert_eq!(Ok(10), result);
        assert_eq!(b"\0\0\0\0\0lorem".to_vec(), buffer);
    }

    #[tokio::test]
    async fn test_read_unavailable() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let storage = DiskStorage::new(temp_dir.path());
        let file = FileEntry {
            path: PathBuf::from("missing.txt"),
            length: 10,
        };
        let mut buffer = vec![0u8; 4];

        let result = storage.read(&file, 0, &mut buffer).await;

        assert_eq!(Err(Error::Unavailable), result);
    }

    #[tokio::test]
    async fn test_read_out_of_bounds() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let storage = DiskStorage::new(temp_dir.path());
        let file = FileEntry {
            path: PathBuf::from("foo.txt"),
            length: 10,
        };
        let mut buffer = vec![0u8; 4];

        let result = storage.read(&file, 8, &mut buffer).await;

        assert_eq!(Err(Error::OutOfBounds), result);
    }

    #[tokio::test]
    async fn test_write_invalid_filepath() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        let storage = DiskStorage::new(temp_dir.path().join("torrent"));
        let file = FileEntry {
            path: PathBuf::from("..").join("..").join("escape.txt"),
            length: 10,
        };

        let result = storage.write(&file, 0, b"foo").await;

        assert_eq!(
            Err(Error::InvalidFilepath(PathBuf::new())),
            result,
            "expected the filepath to be rejected"
        );
    }

    #[tokio::test]
    async fn test_write_recreates_directory() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("foo.txt").join("nested")).unwrap();
        let storage = DiskStorage::new(temp_dir.path());
        let file = FileEntry {
            path: PathBuf::from("foo.txt"),
            length: 8,
        };

        let result = storage.write(&file, 0, b"ipsum").await;

        assert_eq!(Ok(5), result);
        let metadata = std::fs::metadata(temp_dir.path().join("foo.txt")).unwrap();
        assert!(metadata.is_file(), "expected the directory to have been replaced");
        assert_eq!(8, metadata.len());
    }

    #[tokio::test]
    async fn test_write_recreates_wrong_size() {
        init_logger!();
        let temp_dir = tempdir().unwrap();
        std::fs::write(temp_dir.path().join("foo.txt"), b"too short").unwrap();
        let storage = DiskStorage::new(temp_dir.path());
        let file = FileEntry {
            path: PathBuf::from("foo.txt"),
            length: 32,
        };

        let result = storage.write(&file, 30, b"ab").await;

        assert_eq!(Ok(2), result);
        let data = std::fs::read(temp_dir.path().join("foo.txt")).unwrap();
        assert_eq!(32, data.len());
        assert_eq!(vec![0u8; 30], data[..30].to_vec());
    }
}
