use crate::torrent::{overlapping_range, PieceIndex};
use std::ops::Range;
use std::path::PathBuf;

/// The unique index of the file within the torrent.
pub type FileIndex = usize;

/// The information about a single file within a torrent.
/// A file owns no bytes, it describes which byte range of the torrent is stored in it.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    /// The index of the file within the torrent.
    pub index: FileIndex,
    /// The relative path of the file within the storage.
    pub path: PathBuf,
    /// The byte offset of the file within the torrent.
    pub offset: usize,
    /// The length of the file in bytes.
    pub length: usize,
    /// Indicates if the file should be downloaded.
    pub wanted: bool,
    /// The range of torrent pieces that contain this file's data.
    pub pieces: Range<PieceIndex>,
}

impl File {
    /// Get the filename of the file.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .and_then(|e| e.to_str())
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    /// Get the total amount of bytes in the file.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Check if the file has no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Get the byte range of the file within the torrent.
    pub fn torrent_range(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }

    /// Check if the file contains at least 1 byte of the given torrent byte range.
    pub fn contains(&self, range: &Range<usize>) -> bool {
        overlapping_range(self.torrent_range(), range).is_some()
    }

    /// Get the portion of the given torrent byte range which is stored in this file,
    /// relative to the start of the file.
    pub fn io_applicable_byte_range(&self, torrent_bytes: &Range<usize>) -> Option<Range<usize>> {
        overlapping_range(self.torrent_range(), torrent_bytes)
            .map(|e| e.start - self.offset..e.end - self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_file() -> File {
        File {
            index: 1,
            path: PathBuf::from("dir").join("bar.mkv"),
            offset: 100,
            length: 50,
            wanted: true,
            pieces: 6..10,
        }
    }

    #[test]
    fn test_filename() {
        let file = create_file();

        assert_eq!("bar.mkv", file.filename());
    }

    #[test]
    fn test_contains() {
        let file = create_file();

        assert!(file.contains(&(90..101)));
        assert!(file.contains(&(149..200)));
        assert!(!file.contains(&(150..200)));
        assert!(!file.contains(&(0..100)));
    }

    #[test]
    fn test_io_applicable_byte_range() {
        let file = create_file();

        assert_eq!(Some(0..20), file.io_applicable_byte_range(&(80..120)));
        assert_eq!(Some(40..50), file.io_applicable_byte_range(&(140..200)));
        assert_eq!(None, file.io_applicable_byte_range(&(0..100)));
    }
}
