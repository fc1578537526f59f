use crate::torrent::peer::extension;
use crate::torrent::PieceIndex;
use std::io;
use std::mem;
use std::net::SocketAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A protocol violation or failure of a peer connection.
/// Every error closes the connection it originated from.
#[derive(Debug, Error)]
pub enum Error {
    #[error("handshake with {0} failed, {1}")]
    Handshake(SocketAddr, String),
    #[error("expected a peer id of 20 bytes")]
    InvalidPeerId,
    #[error("expected a payload of {0} bytes, got {1}")]
    InvalidLength(u32, u32),
    #[error("piece {0} is out of range")]
    InvalidPiece(PieceIndex),
    #[error("request is out of range, {0}")]
    InvalidRequest(String),
    #[error("message type {0} is unknown")]
    UnknownMessage(u8),
    #[error("message exceeds the limit of {0} bytes")]
    TooLarge(usize),
    #[error("malformed message, {0}")]
    Malformed(String),
    #[error(transparent)]
    Extension(#[from] extension::Error),
    #[error("connection failure, {0}")]
    Io(#[from] io::Error),
    #[error("the connection is closed")]
    Closed,
}

/// Errors are compared by kind, their details are ignored.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        mem::discriminant(self) == mem::discriminant(other)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(error: serde_bencode::Error) -> Self {
        Error::Malformed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_ignores_details() {
        assert_eq!(Error::InvalidPiece(1), Error::InvalidPiece(200));
        assert_ne!(Error::InvalidPiece(1), Error::TooLarge(1));
    }

    #[test]
    fn test_from_extension() {
        let result = Error::from(extension::Error::NotSupported("ut_metadata".to_string()));

        assert_eq!(
            Error::Extension(extension::Error::NotSupported(String::new())),
            result
        );
    }
}
