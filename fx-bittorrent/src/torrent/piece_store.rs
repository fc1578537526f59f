use crate::torrent::errors::Result;
use crate::torrent::storage::{FileEntry, Storage};
use crate::torrent::{
    storage, Bitfield, File, FileIndex, Piece, PieceError, PieceFragment, PieceIndex, Sha1Hash,
    TorrentError, TorrentMetadataInfo, MAX_FRAGMENT_SIZE,
};
use log::{debug, trace, warn};
use sha1::{Digest, Sha1};
use std::fmt::{Debug, Formatter};
use std::ops::Range;

/// The result of adding a fragment to the [PieceStore].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FragmentResult {
    /// The fragment has been stored, but the piece is still missing bytes.
    Incomplete,
    /// The fragment completed the piece and the piece data has been verified.
    Completed,
    /// The fragment completed the piece, but the piece data didn't match the expected hash.
    /// The received bytes of the piece have been reset.
    Corrupted,
    /// The piece has already been verified, the fragment has been ignored.
    Ignored,
}

/// A contiguous byte range within a single file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FileRange {
    /// The index of the file
    pub file: FileIndex,
    /// The offset within the file
    pub offset: usize,
    /// The number of bytes
    pub length: usize,
}

/// Iterates over the file ranges which cover a torrent byte range.
#[derive(Debug)]
pub struct RangeIter<'a> {
    files: &'a [File],
    file: FileIndex,
    offset: usize,
    remaining: usize,
}

impl Iterator for RangeIter<'_> {
    type Item = FileRange;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let file = self.files.get(self.file)?;
            let file_end = file.offset + file.length;

            if self.offset >= file_end {
                self.file += 1;
                continue;
            }

            let length = self.remaining.min(file_end - self.offset);
            let range = FileRange {
                file: file.index,
                offset: self.offset - file.offset,
                length,
            };

            self.offset += length;
            self.remaining -= length;
            return Some(range);
        }

        None
    }
}

/// A snapshot of the piece completion of a [PieceStore].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PieceStoreStats {
    /// The total number of pieces
    pub total: usize,
    /// The number of verified pieces
    pub have: usize,
    /// The number of pieces which still need to be downloaded for the wanted files
    pub needed: usize,
}

/// The piece and file storage engine of a torrent.
///
/// It maps pieces onto the file layout, tracks the received fragments of each piece and verifies
/// completed pieces against their expected hash.
pub struct PieceStore {
    storage: Box<dyn Storage>,
    piece_length: usize,
    total_length: usize,
    pieces: Vec<Piece>,
    files: Vec<File>,
    bitfield: Bitfield,
}

impl PieceStore {
    /// Create a new piece store for the given info dictionary.
    pub fn from_info(info: &TorrentMetadataInfo, storage: Box<dyn Storage>) -> Result<Self> {
        let files = info
            .files()
            .iter()
            .map(|e| FileEntry {
                path: info.path(e),
                length: e.length as usize,
            })
            .collect();

        Self::new(
            info.piece_length as usize,
            info.sha1_pieces(),
            files,
            storage,
        )
    }

    /// Create a new piece store for the given layout.
    ///
    /// # Arguments
    ///
    /// * `piece_length` - The length of every piece, except possibly the last one.
    /// * `hashes` - The expected hash of each piece.
    /// * `files` - The files in torrent order, they partition the torrent bytes without gaps.
    /// * `storage` - The storage which persists the file bytes.
    pub fn new(
        piece_length: usize,
        hashes: Vec<Sha1Hash>,
        files: Vec<FileEntry>,
        storage: Box<dyn Storage>,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(PieceError::InvalidLayout("piece length must be larger than 0".to_string()).into());
        }

        let total_length: usize = files.iter().map(|e| e.length).sum();
        let piece_count = total_length.div_ceil(piece_length);
        if piece_count != hashes.len() {
            return Err(PieceError::InvalidLayout(format!(
                "expected {} piece hashes, got {}",
                piece_count,
                hashes.len()
            ))
            .into());
        }

        let pieces: Vec<Piece> = hashes
            .into_iter()
            .enumerate()
            .map(|(index, hash)| {
                let offset = index * piece_length;
                let length = piece_length.min(total_length - offset);
                Piece::new(index, hash, offset, length)
            })
            .collect();

        let mut offset = 0;
        let files = files
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let first_piece = offset / piece_length;
                let last_piece = (offset + entry.length).div_ceil(piece_length);
                let file = File {
                    index,
                    path: entry.path,
                    offset,
                    length: entry.length,
                    wanted: true,
                    pieces: first_piece..last_piece.max(first_piece),
                };

                offset += entry.length;
                file
            })
            .collect();

        Ok(Self {
            storage,
            piece_length,
            total_length,
            bitfield: Bitfield::new(pieces.len()),
            pieces,
            files,
        })
    }

    /// Get the nominal piece length of the torrent.
    pub fn nominal_piece_length(&self) -> usize {
        self.piece_length
    }

    /// Get the total number of pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Get the length of the given piece, which is only different for the last piece.
    pub fn piece_length(&self, piece: PieceIndex) -> Option<usize> {
        self.pieces.get(piece).map(|e| e.length)
    }

    /// Get the total number of bytes of the torrent.
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    /// Get the pieces of the torrent.
    pub fn pieces(&self) -> &[Piece] {
        self.pieces.as_slice()
    }

    /// Get the files of the torrent.
    pub fn files(&self) -> &[File] {
        self.files.as_slice()
    }

    /// Get the file for the given index.
    pub fn file(&self, file: FileIndex) -> Option<&File> {
        self.files.get(file)
    }

    /// Get the bitfield of verified pieces.
    pub fn good_pieces(&self) -> &Bitfield {
        &self.bitfield
    }

    /// Check if the given piece has been verified.
    pub fn have_piece(&self, piece: PieceIndex) -> bool {
        self.bitfield.has(piece)
    }

    /// Create an iterator over the file ranges which cover the given torrent byte range.
    ///
    /// # Returns
    ///
    /// It returns [storage::Error::OutOfBounds] when the range exceeds the torrent length.
    pub fn range_iter(&self, offset: usize, length: usize) -> storage::Result<RangeIter<'_>> {
        if offset + length > self.total_length {
            return Err(storage::Error::OutOfBounds);
        }

        let file = self.files.partition_point(|e| e.offset + e.length <= offset);
        Ok(RangeIter {
            files: self.files.as_slice(),
            file,
            offset,
            remaining: length,
        })
    }

    /// Read the given part of a piece from the storage.
    pub async fn read_piece_part(
        &self,
        piece: PieceIndex,
        begin: usize,
        length: usize,
    ) -> Result<Vec<u8>> {
        let piece = self.piece_range(piece, begin, length)?;
        self.read_bytes(piece.start + begin, length).await
    }

    /// Read the complete data of the given piece from the storage.
    pub async fn read_piece(&self, piece: PieceIndex) -> Result<Vec<u8>> {
        let length = self
            .piece_length(piece)
            .ok_or(PieceError::OutOfRange(piece))?;
        self.read_piece_part(piece, 0, length).await
    }

    /// Write the given data into a piece at the given offset.
    pub async fn write_piece_part(
        &self,
        piece: PieceIndex,
        begin: usize,
        data: &[u8],
    ) -> Result<()> {
        let piece = self.piece_range(piece, begin, data.len())?;
        let mut cursor = 0;

        for range in self.range_iter(piece.start + begin, data.len())? {
            let file = self.file_entry(range.file)?;
            self.storage
                .write(&file, range.offset, &data[cursor..cursor + range.length])
                .await?;
            cursor += range.length;
        }

        Ok(())
    }

    /// Read the given torrent byte range, which must only overlap verified pieces.
    ///
    /// # Returns
    ///
    /// It returns [TorrentError::DataUnavailable] when one of the overlapping pieces hasn't been
    /// verified yet.
    pub async fn read(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        if offset + length > self.total_length {
            return Err(TorrentError::InvalidRange(offset..offset + length));
        }

        let first = offset / self.piece_length;
        let last = (offset + length - 1) / self.piece_length;
        if (first..=last).any(|piece| !self.have_piece(piece)) {
            return Err(TorrentError::DataUnavailable);
        }

        self.read_bytes(offset, length).await
    }

    /// Add a received fragment of a piece.
    /// When the fragment completes the piece, the piece data is verified.
    ///
    /// # Returns
    ///
    /// It returns [PieceError::InvalidFragment] when the fragment doesn't fit within the piece.
    pub async fn add_fragment(
        &mut self,
        piece: PieceIndex,
        begin: usize,
        data: &[u8],
    ) -> Result<FragmentResult> {
        let piece_length = self
            .piece_length(piece)
            .ok_or(PieceError::OutOfRange(piece))?;

        if data.is_empty() || data.len() > MAX_FRAGMENT_SIZE {
            return Err(PieceError::InvalidFragment(
                piece,
                format!("invalid fragment length {}", data.len()),
            )
            .into());
        }
        if begin + data.len() > piece_length {
            return Err(PieceError::InvalidFragment(
                piece,
                format!(
                    "fragment {}..{} exceeds the piece length {}",
                    begin,
                    begin + data.len(),
                    piece_length
                ),
            )
            .into());
        }
        if self.pieces[piece].good {
            trace!("Piece {} is already verified, ignoring fragment", piece);
            return Ok(FragmentResult::Ignored);
        }

        self.write_piece_part(piece, begin, data).await?;
        self.pieces[piece].received.insert(begin..begin + data.len());

        if !self.pieces[piece].is_complete() {
            return Ok(FragmentResult::Incomplete);
        }

        if self.verify(piece).await? {
            self.mark_good(piece);
            Ok(FragmentResult::Completed)
        } else {
            warn!("Piece {} data is corrupt, resetting received fragments", piece);
            self.pieces[piece].reset();
            Ok(FragmentResult::Corrupted)
        }
    }

    /// Verify the stored data of the given piece against the expected hash.
    ///
    /// # Returns
    ///
    /// It returns `false` when the piece data is not available in the storage.
    pub async fn verify(&self, piece: PieceIndex) -> Result<bool> {
        let expected_hash = self
            .pieces
            .get(piece)
            .map(|e| e.hash)
            .ok_or(PieceError::OutOfRange(piece))?;

        match self.read_piece(piece).await {
            Ok(data) => {
                let hash = Sha1::digest(data.as_slice());
                Ok(hash.as_slice() == expected_hash.as_slice())
            }
            Err(TorrentError::Storage(storage::Error::Unavailable)) => Ok(false),
            Err(TorrentError::Storage(storage::Error::Io(e)))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Inspect the stored data of a single piece and mark it as verified when it's valid.
    /// A piece which has already been verified stays verified.
    pub async fn inspect_piece(&mut self, piece: PieceIndex) -> Result<bool> {
        if self.have_piece(piece) {
            return Ok(true);
        }

        let valid = self.verify(piece).await?;
        if valid {
            self.mark_good(piece);
        }

        Ok(valid)
    }

    /// Sequentially inspect the stored data of all pieces to rebuild the verified bitfield.
    pub async fn inspect(&mut self) -> Result<&Bitfield> {
        for piece in 0..self.pieces.len() {
            self.inspect_piece(piece).await?;
        }

        debug!(
            "Piece store inspected {} pieces, {} are valid",
            self.pieces.len(),
            self.bitfield.count_ones()
        );
        Ok(&self.bitfield)
    }

    /// Get the number of verified bytes of the given file.
    pub fn bytes_completed(&self, file: FileIndex) -> usize {
        self.files
            .get(file)
            .map(|file| {
                let file_range = file.torrent_range();
                file.pieces
                    .clone()
                    .filter(|piece| self.have_piece(*piece))
                    .filter_map(|piece| {
                        file.io_applicable_byte_range(&self.pieces[piece].torrent_range())
                    })
                    .map(|e| e.len())
                    .sum::<usize>()
                    .min(file_range.len())
            })
            .unwrap_or(0)
    }

    /// Get the number of bytes which still need to be downloaded for the wanted files.
    pub fn left_until_done(&self) -> usize {
        self.files
            .iter()
            .filter(|e| e.wanted)
            .map(|e| e.length - self.bytes_completed(e.index))
            .sum()
    }

    /// Check if the given file has been completely verified.
    pub fn is_file_completed(&self, file: FileIndex) -> bool {
        self.files
            .get(file)
            .map(|e| self.bytes_completed(file) == e.length)
            .unwrap_or(false)
    }

    /// Get the pieces which overlap the wanted files and haven't been verified yet, in index order.
    pub fn missing_pieces(&self) -> Vec<PieceIndex> {
        let mut pieces: Vec<PieceIndex> = self
            .files
            .iter()
            .filter(|e| e.wanted)
            .flat_map(|e| e.pieces.clone())
            .filter(|e| !self.have_piece(*e))
            .collect();

        pieces.sort_unstable();
        pieces.dedup();
        pieces
    }

    /// Get the fragments of the given piece which haven't been received yet.
    pub fn missing_fragments(&self, piece: PieceIndex) -> Vec<PieceFragment> {
        self.pieces
            .get(piece)
            .map(|e| e.missing_fragments())
            .unwrap_or_default()
    }

    /// Update whether the given file should be downloaded.
    pub fn set_file_wanted(&mut self, file: FileIndex, wanted: bool) -> Result<()> {
        let len = self.files.len();
        let file = self
            .files
            .get_mut(file)
            .ok_or(TorrentError::OutOfRange(file, len))?;

        file.wanted = wanted;
        Ok(())
    }

    /// Get the completion stats of the store.
    pub fn stats(&self) -> PieceStoreStats {
        PieceStoreStats {
            total: self.pieces.len(),
            have: self.bitfield.count_ones(),
            needed: self.missing_pieces().len(),
        }
    }

    fn mark_good(&mut self, piece: PieceIndex) {
        let entry = &mut self.pieces[piece];
        entry.good = true;
        entry.received.clear();
        self.bitfield.set(piece, true);
    }

    /// Get the torrent byte range of the piece, verifying that the part fits within it.
    fn piece_range(&self, piece: PieceIndex, begin: usize, length: usize) -> Result<Range<usize>> {
        let entry = self.pieces.get(piece).ok_or(PieceError::OutOfRange(piece))?;

        if begin + length > entry.length {
            return Err(storage::Error::OutOfBounds.into());
        }

        Ok(entry.torrent_range())
    }

    async fn read_bytes(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        let mut cursor = 0;

        for range in self.range_iter(offset, length)? {
            let file = self.file_entry(range.file)?;
            self.storage
                .read(&file, range.offset, &mut buffer[cursor..cursor + range.length])
                .await?;
            cursor += range.length;
        }

        Ok(buffer)
    }

    fn file_entry(&self, file: FileIndex) -> Result<FileEntry> {
        self.files
            .get(file)
            .map(|e| FileEntry {
                path: e.path.clone(),
                length: e.length,
            })
            .ok_or(TorrentError::OutOfRange(file, self.files.len()))
    }
}

impl Debug for PieceStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("storage", &self.storage)
            .field("piece_length", &self.piece_length)
            .field("total_length", &self.total_length)
            .field("pieces", &self.pieces.len())
            .field("files", &self.files)
            .field("bitfield", &self.bitfield)
            .finish()
    }
}
