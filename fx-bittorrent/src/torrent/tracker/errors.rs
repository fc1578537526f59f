use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;
use url::{ParseError, Url};

/// The result type of tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Error type for tracker-related operations.
///
/// This enum groups all errors that can occur while configuring trackers,
/// connecting to them, or parsing their responses.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker url \"{0}\" is invalid")]
    InvalidUrl(String),
    #[error("tracker url \"{0}\" is already registered")]
    DuplicateUrl(Url),
    #[error("tracker scheme \"{0}\" is not supported")]
    UnsupportedScheme(String),
    #[error("an error occurred while connecting to the tracker, {0}")]
    Connection(String),
    #[error("the tracker responded with a failure, {0}")]
    Tracker(String),
    #[error("the tracker responded with status code {0}")]
    Status(u16),
    #[error("the tracker exceeded the maximum number of redirects")]
    TooManyRedirects,
    #[error("an io error occurred while communicating with the tracker, {0}")]
    Io(io::Error),
    #[error("failed to parse tracker response, {0}")]
    Parse(String),
    #[error("timed out while performing the operation")]
    Timeout,
}

impl PartialEq for TrackerError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidUrl(_), Self::InvalidUrl(_)) => true,
            (Self::DuplicateUrl(_), Self::DuplicateUrl(_)) => true,
            (Self::UnsupportedScheme(_), Self::UnsupportedScheme(_)) => true,
            (Self::Connection(_), Self::Connection(_)) => true,
            (Self::Tracker(_), Self::Tracker(_)) => true,
            (Self::Status(a), Self::Status(b)) => a == b,
            (Self::TooManyRedirects, Self::TooManyRedirects) => true,
            (Self::Io(_), Self::Io(_)) => true,
            (Self::Parse(_), Self::Parse(_)) => true,
            (Self::Timeout, Self::Timeout) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for TrackerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<Elapsed> for TrackerError {
    fn from(_: Elapsed) -> Self {
        Self::Timeout
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_redirect() {
            return Self::TooManyRedirects;
        }
        if err.is_timeout() {
            return Self::Timeout;
        }
        if let Some(status) = err.status() {
            return Self::Status(status.as_u16());
        }

        Self::Connection(err.to_string())
    }
}

impl From<ParseError> for TrackerError {
    fn from(error: ParseError) -> Self {
        Self::InvalidUrl(error.to_string())
    }
}

impl From<serde_bencode::Error> for TrackerError {
    fn from(error: serde_bencode::Error) -> Self {
        Self::Parse(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_error_eq() {
        assert_eq!(TrackerError::Status(404), TrackerError::Status(404));
        assert_ne!(TrackerError::Status(404), TrackerError::Status(500));
        assert_eq!(
            TrackerError::Tracker("foo".to_string()),
            TrackerError::Tracker("bar".to_string()),
            "expected only the variant to be compared"
        );
    }

    #[test]
    fn test_from_parse_error() {
        let err = url::Url::parse("lorem").unwrap_err();

        let result = TrackerError::from(err);

        assert_eq!(TrackerError::InvalidUrl(String::new()), result);
    }
}
