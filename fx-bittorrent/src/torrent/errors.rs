use crate::torrent::tracker::TrackerError;
use crate::torrent::{peer, storage, InfoHash, PieceIndex};
use thiserror::Error;

/// The result type for the torrent package.
pub type Result<T> = std::result::Result<T, TorrentError>;

/// Represents possible errors that can occur when parsing a magnet URI.
pub type MagnetResult<T> = std::result::Result<T, MagnetError>;

/// Represents possible errors that can occur when parsing a magnet URI.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MagnetError {
    /// Failed to parse the magnet URI.
    #[error("failed to parse magnet uri, {0}")]
    Parse(String),
    /// The specified magnet URI is invalid.
    #[error("invalid magnet uri")]
    InvalidUri,
    /// The specified value is invalid.
    #[error("value \"{0}\" is invalid")]
    InvalidValue(String),
    /// The specified scheme in the magnet URI is not supported.
    #[error("scheme \"{0}\" is not supported")]
    UnsupportedScheme(String),
}

/// The torrent piece specific errors.
/// These errors can occur when working with [crate::torrent::Piece] related operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PieceError {
    #[error("torrent pieces are currently unknown")]
    Unavailable,
    #[error("piece {0} is out of range")]
    OutOfRange(PieceIndex),
    #[error("invalid fragment for piece {0}, {1}")]
    InvalidFragment(PieceIndex, String),
    #[error("the piece layout is invalid, {0}")]
    InvalidLayout(String),
}

/// The errors which can occur while exchanging the torrent metadata with peers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetadataError {
    #[error("the metadata size is unknown")]
    SizeUnknown,
    #[error("metadata piece {0} is out of range")]
    InvalidPiece(usize),
    #[error("metadata piece {0} has an invalid length, expected {1} but got {2}")]
    InvalidPieceLength(usize, usize, usize),
    #[error("metadata piece {0} conflicts with the previously received data")]
    ConflictingPiece(usize),
}

#[derive(Debug, Error, PartialEq)]
pub enum TorrentError {
    #[error("failed to parse magnet uri, {0}")]
    Magnet(MagnetError),
    #[error("failed to parse torrent data, {0}")]
    TorrentParse(String),
    #[error("the metadata of the torrent is invalid, {0}")]
    InvalidMetadata(String),
    #[error("the provided exact topic (xt) is invalid, {0}")]
    InvalidTopic(String),
    #[error("the provided info hash is invalid, {0}")]
    InvalidInfoHash(String),
    #[error("index {0} is out of range for length {1}")]
    OutOfRange(usize, usize),
    #[error("the specified range {0:?} is invalid")]
    InvalidRange(std::ops::Range<usize>),
    #[error("torrent {0} already exists")]
    DuplicateTorrent(InfoHash),
    #[error("tracker error: {0}")]
    Tracker(TrackerError),
    #[error("peer error: {0}")]
    Peer(peer::Error),
    #[error("storage error: {0}")]
    Storage(storage::Error),
    #[error("a torrent piece error occurred, {0}")]
    Piece(PieceError),
    #[error("a metadata exchange error occurred, {0}")]
    Metadata(MetadataError),
    #[error("an io error occurred, {0}")]
    Io(String),
    #[error("the torrent operation has timed out")]
    Timeout,
    #[error("the requested data is unavailable")]
    DataUnavailable,
    #[error("the torrent has been closed")]
    Closed,
}

impl From<MagnetError> for TorrentError {
    fn from(error: MagnetError) -> Self {
        Self::Magnet(error)
    }
}

impl From<TrackerError> for TorrentError {
    fn from(error: TrackerError) -> Self {
        Self::Tracker(error)
    }
}

impl From<peer::Error> for TorrentError {
    fn from(error: peer::Error) -> Self {
        Self::Peer(error)
    }
}

impl From<storage::Error> for TorrentError {
    fn from(error: storage::Error) -> Self {
        Self::Storage(error)
    }
}

impl From<std::io::Error> for TorrentError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(error: serde_bencode::Error) -> Self {
        Self::TorrentParse(error.to_string())
    }
}

impl From<PieceError> for TorrentError {
    fn from(error: PieceError) -> Self {
        Self::Piece(error)
    }
}

impl From<MetadataError> for TorrentError {
    fn from(error: MetadataError) -> Self {
        Self::Metadata(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_torrent_error_from_tracker_error() {
        let err = TrackerError::Connection("foo bar".to_string());

        let result: TorrentError = err.into();

        assert_eq!(
            result,
            TorrentError::Tracker(TrackerError::Connection("foo bar".to_string()))
        );
    }

    #[test]
    fn test_torrent_error_from_peer_error() {
        let err = peer::Error::InvalidPeerId;

        let result: TorrentError = err.into();

        assert_eq!(result, TorrentError::Peer(peer::Error::InvalidPeerId));
    }

    #[test]
    fn test_torrent_error_from_io_error() {
        let err = io::Error::new(io::ErrorKind::Other, "foo bar");

        let result: TorrentError = err.into();

        assert_eq!(result, TorrentError::Io("foo bar".to_string()));
    }

    #[test]
    fn test_torrent_error_from_storage_error() {
        let result: TorrentError = storage::Error::OutOfBounds.into();

        assert_eq!(result, TorrentError::Storage(storage::Error::OutOfBounds));
    }
}
