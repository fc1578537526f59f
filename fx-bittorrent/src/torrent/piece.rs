use crate::torrent::Sha1Hash;
use std::fmt::{Debug, Formatter};
use std::ops::Range;

/// The size in bytes of a fragment which is requested from a peer.
pub const FRAGMENT_SIZE: usize = 16 * 1024; // 16 KiB

/// The maximum size in bytes of a fragment which is accepted from, or served to, a peer.
pub const MAX_FRAGMENT_SIZE: usize = 32 * 1024; // 32 KiB

/// The alias type used to identify piece indexes.
pub type PieceIndex = usize;

/// A sub-range of a piece which is exchanged with a peer in a single request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PieceFragment {
    /// The index of the piece
    pub piece: PieceIndex,
    /// The offset within the piece
    pub begin: usize,
    /// The length of the fragment in bytes
    pub length: usize,
}

impl PieceFragment {
    /// Get the byte range of the fragment within its piece.
    pub fn range(&self) -> Range<usize> {
        self.begin..self.begin + self.length
    }
}

/// An ordered set of disjoint, non-adjacent byte ranges.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct ByteRanges {
    ranges: Vec<Range<usize>>,
}

impl ByteRanges {
    /// Insert the given range, merging it with any overlapping or adjacent ranges.
    pub fn insert(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }

        let mut start = range.start;
        let mut end = range.end;
        let first = self.ranges.partition_point(|e| e.end < start);
        let mut last = first;

        while last < self.ranges.len() && self.ranges[last].start <= end {
            start = start.min(self.ranges[last].start);
            end = end.max(self.ranges[last].end);
            last += 1;
        }

        self.ranges.splice(first..last, [start..end]);
    }

    /// Check if the given range is fully covered.
    pub fn contains(&self, range: &Range<usize>) -> bool {
        if range.is_empty() {
            return true;
        }

        let index = self.ranges.partition_point(|e| e.end <= range.start);
        self.ranges
            .get(index)
            .map(|e| e.start <= range.start && range.end <= e.end)
            .unwrap_or(false)
    }

    /// Get the total number of covered bytes.
    pub fn covered(&self) -> usize {
        self.ranges.iter().map(|e| e.len()).sum()
    }

    /// Remove all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Check if no range has been covered.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl Debug for ByteRanges {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ranges.iter()).finish()
    }
}

/// A fixed-size, content-addressed unit of the torrent.
#[derive(Debug, Clone)]
pub struct Piece {
    /// The index of the piece
    pub index: PieceIndex,
    /// The expected SHA1 hash of the piece data
    pub hash: Sha1Hash,
    /// The offset of the piece within the torrent
    pub offset: usize,
    /// The piece length in bytes
    pub length: usize,
    /// Indicates if the piece data has been verified
    pub(crate) good: bool,
    /// The byte ranges of the piece that have been received
    pub(crate) received: ByteRanges,
}

impl Piece {
    pub fn new(index: PieceIndex, hash: Sha1Hash, offset: usize, length: usize) -> Self {
        Self {
            index,
            hash,
            offset,
            length,
            good: false,
            received: ByteRanges::default(),
        }
    }

    /// Get the length of this piece in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Check if the piece is empty.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Check if the piece data has been verified.
    pub fn is_good(&self) -> bool {
        self.good
    }

    /// Check if all bytes of the piece have been received.
    pub fn is_complete(&self) -> bool {
        self.received.contains(&(0..self.length))
    }

    /// Get the byte range of this piece within the torrent.
    pub fn torrent_range(&self) -> Range<usize> {
        self.offset..self.offset + self.length
    }

    /// Get the fragments of this piece which haven't been received yet.
    pub fn missing_fragments(&self) -> Vec<PieceFragment> {
        if self.good {
            return Vec::new();
        }

        (0..self.length)
            .step_by(FRAGMENT_SIZE)
            .map(|begin| PieceFragment {
                piece: self.index,
                begin,
                length: FRAGMENT_SIZE.min(self.length - begin),
            })
            .filter(|fragment| !self.received.contains(&fragment.range()))
            .collect()
    }

    /// Reset the received bytes of the piece.
    pub(crate) fn reset(&mut self) {
        self.received.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_ranges_insert_merges() {
        let mut ranges = ByteRanges::default();

        ranges.insert(10..20);
        ranges.insert(30..40);
        ranges.insert(20..30);

        assert_eq!(30, ranges.covered());
        assert!(ranges.contains(&(10..40)), "expected the ranges to be merged");
    }

    #[test]
    fn test_byte_ranges_insert_overlapping() {
        let mut ranges = ByteRanges::default();

        ranges.insert(0..10);
        ranges.insert(50..60);
        ranges.insert(5..55);

        assert_eq!(60, ranges.covered());
        assert!(ranges.contains(&(0..60)));
    }

    #[test]
    fn test_byte_ranges_contains() {
        let mut ranges = ByteRanges::default();
        ranges.insert(0..16);
        ranges.insert(32..48);

        assert!(ranges.contains(&(0..16)));
        assert!(ranges.contains(&(34..40)));
        assert!(!ranges.contains(&(8..40)));
        assert!(!ranges.contains(&(16..32)));
    }

    #[test]
    fn test_piece_missing_fragments() {
        let mut piece = Piece::new(1, [0u8; 20], 40000, 40000);
        piece.received.insert(0..FRAGMENT_SIZE);

        let result = piece.missing_fragments();

        assert_eq!(
            vec![
                PieceFragment {
                    piece: 1,
                    begin: FRAGMENT_SIZE,
                    length: FRAGMENT_SIZE,
                },
                PieceFragment {
                    piece: 1,
                    begin: 2 * FRAGMENT_SIZE,
                    length: 40000 - 2 * FRAGMENT_SIZE,
                },
            ],
            result
        );
    }

    #[test]
    fn test_piece_is_complete() {
        let mut piece = Piece::new(0, [0u8; 20], 0, 100);

        piece.received.insert(50..100);
        assert!(!piece.is_complete());

        piece.received.insert(0..50);
        assert!(piece.is_complete());

        piece.reset();
        assert!(!piece.is_complete());
    }
}
