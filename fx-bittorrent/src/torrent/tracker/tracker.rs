use crate::torrent::peer::PeerId;
use crate::torrent::tracker::http::HttpTracker;
use crate::torrent::tracker::udp::UdpTracker;
use crate::torrent::tracker::{Result, TrackerError};
use crate::torrent::{CompactPeer, InfoHash};
use async_trait::async_trait;
use derive_more::Display;
use fx_handle::Handle;
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

/// The default number of peers requested from a tracker.
pub const DEFAULT_NUM_WANT: u32 = 50;

/// The tracker identifier handle
pub type TrackerHandle = Handle;

/// Kinds of tracker announces. This is typically indicated as the ``&event=``
/// HTTP query string parameter to HTTP trackers.
#[repr(u32)]
#[derive(Debug, Display, Copy, Clone, PartialEq)]
pub enum AnnounceEvent {
    #[display("none")]
    None = 0,
    #[display("completed")]
    Completed = 1,
    #[display("started")]
    Started = 2,
    #[display("stopped")]
    Stopped = 3,
}

/// The announcement information for a tracker.
/// This is the most recent torrent information that should be shared with the tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    /// The info hash of the torrent
    pub info_hash: InfoHash,
    /// The peer id of the torrent session
    pub peer_id: PeerId,
    /// The port on which the torrent accepts incoming peer connections
    pub port: u16,
    /// The number of bytes uploaded to peers
    pub uploaded: u64,
    /// The number of piece bytes downloaded from peers
    pub downloaded: u64,
    /// The number of bytes remaining to be downloaded by the torrent
    pub left: u64,
    /// The tracker announcement event
    pub event: AnnounceEvent,
    /// The number of peers which are requested from the tracker
    pub num_want: u32,
}

/// The response of a tracker announcement.
///
/// The discovered peers are kept in their compact form until a connection is made to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    /// The interval in which the tracker expects the next announcement
    pub interval: Duration,
    /// The number of peers which have not yet completed the torrent
    pub leechers: u32,
    /// The number of peers which have completed the torrent
    pub seeders: u32,
    /// The peers announced by the tracker
    pub peers: Vec<CompactPeer>,
}

/// A client which is able to announce a torrent to a specific tracker.
///
/// Implementations of this trait provide the logic for the different tracker protocols.
#[async_trait]
pub trait TrackerClient: Debug + Send + Sync {
    /// Get the url of the tracker.
    fn url(&self) -> &Url;

    /// Announce the given torrent information to the tracker.
    ///
    /// # Returns
    ///
    /// It returns the announce response of the tracker, or the [TrackerError] that occurred.
    async fn announce(&self, announcement: Announcement) -> Result<AnnounceResponse>;
}

/// Create a new tracker client for the given url.
/// The tracker protocol is determined by the scheme of the url.
///
/// # Arguments
///
/// * `url` - The announce url of the tracker.
/// * `timeout` - The (initial) timeout of requests to the tracker.
pub fn create_tracker_client(url: Url, timeout: Duration) -> Result<Box<dyn TrackerClient>> {
    match url.scheme() {
        "udp" => Ok(Box::new(UdpTracker::new(url, timeout)?)),
        "http" | "https" => Ok(Box::new(HttpTracker::new(url, timeout)?)),
        scheme => Err(TrackerError::UnsupportedScheme(scheme.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tracker_client() {
        let url = Url::parse("udp://tracker.example.org:1337/announce").unwrap();
        let result = create_tracker_client(url.clone(), Duration::from_secs(1)).unwrap();
        assert_eq!(&url, result.url());

        let url = Url::parse("https://tracker.example.org/announce").unwrap();
        let result = create_tracker_client(url.clone(), Duration::from_secs(1)).unwrap();
        assert_eq!(&url, result.url());
    }

    #[test]
    fn test_create_tracker_client_unsupported_scheme() {
        let url = Url::parse("wss://tracker.example.org/announce").unwrap();

        let result = create_tracker_client(url, Duration::from_secs(1));

        assert_eq!(
            TrackerError::UnsupportedScheme("wss".to_string()),
            result.unwrap_err()
        );
    }

    #[test]
    fn test_announce_event_display() {
        assert_eq!("started", AnnounceEvent::Started.to_string());
        assert_eq!(3, AnnounceEvent::Stopped as u32);
    }
}
