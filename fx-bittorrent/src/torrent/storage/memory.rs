use crate::torrent::storage::{Error, FileEntry, Result, Storage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// Fast in-memory storage of torrent files.
/// This storage type is not recommended for large torrents.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read(&self, file: &FileEntry, offset: usize, buffer: &mut [u8]) -> Result<usize> {
        let end = offset + buffer.len();
        if end > file.length {
            return Err(Error::OutOfBounds);
        }

        let files = self.files.read().await;
        let data = files
            .get(&file.path)
            .filter(|e| e.len() == file.length)
            .ok_or(Error::Unavailable)?;

        buffer.copy_from_slice(&data[offset..end]);
        Ok(buffer.len())
    }

    async fn write(&self, file: &FileEntry, offset: usize, data: &[u8]) -> Result<usize> {
        let end = offset + data.len();
        if end > file.length {
            return Err(Error::OutOfBounds);
        }

        let mut files = self.files.write().await;
        let bytes = files
            .entry(file.path.clone())
            .or_insert_with(|| vec![0u8; file.length]);
        if bytes.len() != file.length {
            *bytes = vec![0u8; file.length];
        }

        bytes[offset..end].copy_from_slice(data);
        Ok(data.len())
    }
}
