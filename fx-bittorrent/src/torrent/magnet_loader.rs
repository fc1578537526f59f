use crate::torrent::errors::Result;
use crate::torrent::peer::extension::metadata::METADATA_PIECE_SIZE;
use crate::torrent::{InfoHash, MetadataError, Swarm};
use derive_more::Display;
use log::{debug, trace, warn};
use serde_bencode::value::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The max metadata size which is accepted from a peer.
pub(crate) const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

/// Retrieves the info dictionary of a torrent from the swarm through the metadata extension.
///
/// The metadata is split into pieces of 16 KiB, which are requested from random peers until every
/// piece has been received. The assembled metadata is only accepted when its hash matches the
/// info hash of the torrent.
#[derive(Debug, Display)]
#[display("{}", tag)]
pub struct MagnetLoader {
    tag: String,
    info_hash: InfoHash,
    size: Option<usize>,
    /// The metadata sizes announced by peers, with the number of announcements
    announced_sizes: HashMap<usize, usize>,
    pieces: Vec<Option<Vec<u8>>>,
    retry_interval: Duration,
    last_request: Option<Instant>,
    completed: bool,
}

impl MagnetLoader {
    /// Create a new loader for the metadata of the given info hash.
    ///
    /// # Arguments
    ///
    /// * `info_hash` - The info hash which the assembled metadata should match.
    /// * `retry_interval` - The interval in which missing pieces are requested again.
    pub fn new(info_hash: InfoHash, retry_interval: Duration) -> Self {
        Self {
            tag: info_hash.tag(),
            info_hash,
            size: None,
            announced_sizes: HashMap::new(),
            pieces: Vec::new(),
            retry_interval,
            last_request: None,
            completed: false,
        }
    }

    /// Get the metadata size, if it has been announced by a peer.
    pub fn metadata_size(&self) -> Option<usize> {
        self.size
    }

    /// Check if the metadata has been retrieved.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Get the number of metadata pieces which still need to be received.
    pub fn missing_pieces(&self) -> Vec<usize> {
        self.pieces
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(index, _)| index)
            .collect()
    }

    /// Handle the metadata size which has been announced by a peer.
    /// The first announced size allocates the metadata pieces, a conflicting size is remembered
    /// in case the current size turns out to be wrong.
    ///
    /// # Returns
    ///
    /// It returns `true` when the metadata pieces have been allocated.
    pub fn on_metadata_size(&mut self, size: usize) -> bool {
        if self.completed || size == 0 {
            return false;
        }
        if size > MAX_METADATA_SIZE {
            warn!(
                "Magnet loader {} received metadata size {} which exceeds the limit of {}",
                self, size, MAX_METADATA_SIZE
            );
            return false;
        }

        *self.announced_sizes.entry(size).or_insert(0) += 1;
        match self.size {
            Some(existing) if existing != size => {
                warn!(
                    "Magnet loader {} received conflicting metadata size {}, expected {}",
                    self, size, existing
                );
                false
            }
            Some(_) => false,
            None => {
                debug!("Magnet loader {} received metadata size {}", self, size);
                self.allocate(size);
                true
            }
        }
    }

    /// Request the missing metadata pieces from the swarm, if the retry interval has elapsed
    /// since the last request.
    ///
    /// # Returns
    ///
    /// It returns the number of sent requests.
    pub fn request_pieces(&mut self, swarm: &mut Swarm, now: Instant) -> usize {
        if self.completed || self.size.is_none() {
            return 0;
        }
        if let Some(last_request) = self.last_request {
            if now.saturating_duration_since(last_request) < self.retry_interval {
                return 0;
            }
        }

        let requests: usize = self
            .missing_pieces()
            .into_iter()
            .map(|piece| swarm.request_metadata_piece(piece))
            .sum();

        trace!("Magnet loader {} sent {} metadata requests", self, requests);
        if requests > 0 {
            self.last_request = Some(now);
        }
        requests
    }

    /// Handle a received metadata piece.
    ///
    /// # Returns
    ///
    /// It returns the info dictionary bytes once every piece has been received and the assembled
    /// metadata matches the info hash. The info dictionary is returned only once.
    pub fn on_piece(&mut self, piece: usize, total_size: usize, data: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.completed {
            return Ok(None);
        }
        if self.size.is_none() {
            self.on_metadata_size(total_size);
        }

        let size = self.size.ok_or(MetadataError::SizeUnknown)?;
        if size != total_size {
            warn!(
                "Magnet loader {} received piece {} with conflicting metadata size {}, expected {}",
                self, piece, total_size, size
            );
            return Ok(None);
        }

        let piece_count = self.pieces.len();
        if piece >= piece_count {
            return Err(MetadataError::InvalidPiece(piece).into());
        }

        let expected_len = Self::piece_len(size, piece, piece_count);
        if data.len() != expected_len {
            return Err(MetadataError::InvalidPieceLength(piece, expected_len, data.len()).into());
        }

        match self.pieces[piece].as_ref() {
            Some(existing) if existing.as_slice() == data => return Ok(None),
            Some(_) => return Err(MetadataError::ConflictingPiece(piece).into()),
            None => self.pieces[piece] = Some(data.to_vec()),
        }
        trace!("Magnet loader {} received metadata piece {}", self, piece);

        if self.pieces.iter().any(|e| e.is_none()) {
            return Ok(None);
        }

        Ok(self.finalize())
    }

    /// Handle a metadata piece which has been rejected by a peer.
    pub fn on_reject(&self, piece: usize) {
        trace!("Magnet loader {} metadata piece {} has been rejected", self, piece);
    }

    fn finalize(&mut self) -> Option<Vec<u8>> {
        let bytes: Vec<u8> = self.pieces.iter().flatten().flatten().cloned().collect();

        match Self::canonical_info(&bytes) {
            Some(info) if InfoHash::from_metadata(&info) == self.info_hash => {
                debug!("Magnet loader {} retrieved the metadata", self);
                self.completed = true;
                self.pieces.clear();
                Some(info)
            }
            _ => {
                warn!(
                    "Magnet loader {} received metadata which doesn't match the info hash, resetting",
                    self
                );
                if let Some(size) = self.size.take() {
                    self.announced_sizes.remove(&size);
                }
                self.pieces.clear();
                self.last_request = None;

                // continue with the size which has been announced by most of the other peers
                let next_size = self
                    .announced_sizes
                    .iter()
                    .max_by_key(|(size, count)| (**count, **size))
                    .map(|(size, _)| *size);
                if let Some(size) = next_size {
                    self.allocate(size);
                }
                None
            }
        }
    }

    fn allocate(&mut self, size: usize) {
        self.size = Some(size);
        self.pieces = vec![None; size.div_ceil(METADATA_PIECE_SIZE)];
        self.last_request = None;
    }

    fn canonical_info(bytes: &[u8]) -> Option<Vec<u8>> {
        let value = serde_bencode::from_bytes::<Value>(bytes).ok()?;
        serde_bencode::to_bytes(&value).ok()
    }

    fn piece_len(size: usize, piece: usize, piece_count: usize) -> usize {
        if piece + 1 < piece_count {
            return METADATA_PIECE_SIZE;
        }

        match size % METADATA_PIECE_SIZE {
            0 => METADATA_PIECE_SIZE,
            remainder => remainder,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use crate::torrent::torrent_metadata::tests::create_info_bytes;
    use crate::torrent::TorrentError;

    /// Create an info dictionary which spans 2 metadata pieces.
    fn create_metadata() -> Vec<u8> {
        let info = create_info_bytes("foo", &vec![3u8; 16 * 1000], 16);
        assert!(info.len() > METADATA_PIECE_SIZE && info.len() < 2 * METADATA_PIECE_SIZE);
        info
    }

    #[test]
    fn test_on_metadata_size() {
        init_logger!();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(b"foo"), Duration::from_secs(30));

        assert_eq!(true, loader.on_metadata_size(20000));
        assert_eq!(vec![0, 1], loader.missing_pieces());

        assert_eq!(false, loader.on_metadata_size(30000), "expected the conflicting size to be ignored");
        assert_eq!(Some(20000), loader.metadata_size());
    }

    #[test]
    fn test_on_piece_out_of_order() {
        init_logger!();
        let metadata = create_metadata();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(&metadata), Duration::from_secs(30));
        loader.on_metadata_size(metadata.len());

        let result = loader
            .on_piece(1, metadata.len(), &metadata[METADATA_PIECE_SIZE..])
            .unwrap();
        assert_eq!(None, result, "expected no metadata before every piece is received");

        let result = loader
            .on_piece(0, metadata.len(), &metadata[..METADATA_PIECE_SIZE])
            .unwrap();
        assert_eq!(Some(metadata.clone()), result);
        assert_eq!(true, loader.is_completed());

        let result = loader
            .on_piece(0, metadata.len(), &metadata[..METADATA_PIECE_SIZE])
            .unwrap();
        assert_eq!(None, result, "expected the metadata to be returned only once");
    }

    #[test]
    fn test_on_piece_hash_mismatch() {
        init_logger!();
        let metadata = create_metadata();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(b"bar"), Duration::from_secs(30));
        loader.on_metadata_size(metadata.len());

        loader
            .on_piece(0, metadata.len(), &metadata[..METADATA_PIECE_SIZE])
            .unwrap();
        let result = loader
            .on_piece(1, metadata.len(), &metadata[METADATA_PIECE_SIZE..])
            .unwrap();

        assert_eq!(None, result);
        assert_eq!(None, loader.metadata_size(), "expected the metadata size to be reset");
        assert_eq!(Vec::<usize>::new(), loader.missing_pieces());
        assert_eq!(false, loader.is_completed());

        assert_eq!(true, loader.on_metadata_size(metadata.len()));
        assert_eq!(vec![0, 1], loader.missing_pieces());
    }

    #[test]
    fn test_on_piece_hash_mismatch_adopts_other_size() {
        init_logger!();
        let metadata = create_metadata();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(&metadata), Duration::from_secs(30));
        assert_eq!(true, loader.on_metadata_size(20000));
        assert_eq!(false, loader.on_metadata_size(metadata.len()));
        assert_ne!(20000, metadata.len());

        loader
            .on_piece(0, 20000, &metadata[..METADATA_PIECE_SIZE])
            .unwrap();
        let result = loader.on_piece(1, 20000, &[0u8; 3616]).unwrap();
        assert_eq!(None, result);
        assert_eq!(Some(metadata.len()), loader.metadata_size());
        assert_eq!(vec![0, 1], loader.missing_pieces());

        loader
            .on_piece(0, metadata.len(), &metadata[..METADATA_PIECE_SIZE])
            .unwrap();
        let result = loader
            .on_piece(1, metadata.len(), &metadata[METADATA_PIECE_SIZE..])
            .unwrap();
        assert_eq!(Some(metadata), result);
    }

    #[test]
    fn test_on_metadata_size_too_large() {
        init_logger!();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(b"foo"), Duration::from_secs(30));

        assert_eq!(false, loader.on_metadata_size(MAX_METADATA_SIZE + 1));
        assert_eq!(false, loader.on_metadata_size(0));
        assert_eq!(None, loader.metadata_size());
        assert_eq!(Vec::<usize>::new(), loader.missing_pieces());

        assert_eq!(true, loader.on_metadata_size(MAX_METADATA_SIZE));
    }

    #[test]
    fn test_on_piece_conflicting_data() {
        init_logger!();
        let metadata = create_metadata();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(&metadata), Duration::from_secs(30));
        loader.on_metadata_size(metadata.len());
        loader
            .on_piece(0, metadata.len(), &metadata[..METADATA_PIECE_SIZE])
            .unwrap();

        let result = loader.on_piece(0, metadata.len(), &vec![0u8; METADATA_PIECE_SIZE]);

        assert_eq!(
            Err(TorrentError::Metadata(MetadataError::ConflictingPiece(0))),
            result
        );
        assert_eq!(vec![1], loader.missing_pieces(), "expected the first value to be kept");
    }

    #[test]
    fn test_on_piece_invalid_length() {
        init_logger!();
        let mut loader = MagnetLoader::new(InfoHash::from_metadata(b"foo"), Duration::from_secs(30));
        loader.on_metadata_size(20000);

        let result = loader.on_piece(1, 20000, &[0u8; 100]);
        assert_eq!(
            Err(TorrentError::Metadata(MetadataError::InvalidPieceLength(1, 3616, 100))),
            result
        );

        let result = loader.on_piece(2, 20000, &[0u8; 100]);
        assert_eq!(Err(TorrentError::Metadata(MetadataError::InvalidPiece(2))), result);
    }

    #[test]
    fn test_piece_len() {
        assert_eq!(METADATA_PIECE_SIZE, MagnetLoader::piece_len(20000, 0, 2));
        assert_eq!(3616, MagnetLoader::piece_len(20000, 1, 2));
        assert_eq!(METADATA_PIECE_SIZE, MagnetLoader::piece_len(2 * METADATA_PIECE_SIZE, 1, 2));
    }

    #[test]
    fn test_request_pieces_retry_interval() {
        init_logger!();
        let info_hash = InfoHash::from_metadata(b"foo");
        let mut swarm = Swarm::new(&info_hash);
        let mut loader = MagnetLoader::new(info_hash, Duration::from_secs(30));
        let now = Instant::now();

        assert_eq!(0, loader.request_pieces(&mut swarm, now), "expected no requests without size");

        loader.on_metadata_size(20000);
        assert_eq!(0, loader.request_pieces(&mut swarm, now), "expected no requests without peers");
        assert_eq!(None, loader.last_request);
    }
}
