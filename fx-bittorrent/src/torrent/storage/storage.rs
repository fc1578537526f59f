use crate::torrent::storage::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;

/// A single file which is persisted by a [Storage].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    /// The relative path of the file within the storage.
    pub path: PathBuf,
    /// The expected length of the file in bytes.
    pub length: usize,
}

/// The byte storage of torrent files.
///
/// A storage operates on whole files, the mapping of pieces onto files is done by the
/// [crate::torrent::PieceStore].
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    /// Read the bytes of the given file, starting at the offset, into the buffer.
    ///
    /// # Returns
    ///
    /// It returns the number of bytes read, which is always the buffer length on success.
    /// It returns [crate::torrent::storage::Error::Unavailable] when the file doesn't exist yet.
    async fn read(&self, file: &FileEntry, offset: usize, buffer: &mut [u8]) -> Result<usize>;

    /// Write the given data into the file, starting at the offset.
    /// The file is created with its full length when it doesn't exist yet.
    ///
    /// # Returns
    ///
    /// It returns the number of bytes written to the storage.
    async fn write(&self, file: &FileEntry, offset: usize, data: &[u8]) -> Result<usize>;
}

#[cfg(test)]
pub mod mock {
    use super::*;

    use mockall::mock;

    mock! {
        #[derive(Debug)]
        pub Storage {}

        #[async_trait]
        impl Storage for Storage {
            async fn read(&self, file: &FileEntry, offset: usize, buffer: &mut [u8]) -> Result<usize>;
            async fn write(&self, file: &FileEntry, offset: usize, data: &[u8]) -> Result<usize>;
        }
    }
}
