use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// The payload isn't valid bencode, or misses a required key
    #[error("invalid extension payload, {0}")]
    InvalidPayload(String),
    /// The remote peer didn't announce the extension within its extended handshake
    #[error("extension {0} isn't supported by the remote peer")]
    NotSupported(String),
}

impl From<serde_bencode::Error> for Error {
    fn from(error: serde_bencode::Error) -> Self {
        Self::InvalidPayload(error.to_string())
    }
}
