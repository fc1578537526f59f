use crate::torrent::tracker::{
    AnnounceEvent, AnnounceResponse, Announcement, Result, TrackerClient, TrackerError,
};
use crate::torrent::CompactPeers;
use async_trait::async_trait;
use derive_more::Display;
use log::{debug, trace};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// The maximum number of redirects which are followed for a single announce.
const MAX_REDIRECTS: usize = 10;
/// The interval which is used when the tracker didn't return one.
const DEFAULT_INTERVAL_SECONDS: u64 = 1800;

const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'~')
    .remove(b'.');

#[derive(Debug, Clone, Deserialize)]
struct HttpResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
    /// The total number of peers which have completed the torrent
    #[serde(default)]
    complete: Option<u32>,
    /// The total number of peers which have not yet completed the torrent
    #[serde(default)]
    incomplete: Option<u32>,
    #[serde(default)]
    peers: CompactPeers,
    #[serde(default, deserialize_with = "crate::torrent::compact::compact_ipv6::deserialize")]
    peers6: CompactPeers,
}

impl From<HttpResponse> for AnnounceResponse {
    fn from(value: HttpResponse) -> Self {
        Self {
            interval: Duration::from_secs(value.interval.unwrap_or(DEFAULT_INTERVAL_SECONDS)),
            leechers: value.incomplete.unwrap_or(0),
            seeders: value.complete.unwrap_or(0),
            peers: value.peers.into_iter().chain(value.peers6).collect(),
        }
    }
}

/// The HTTP/HTTPS tracker client.
#[derive(Debug, Display)]
#[display("{}", url)]
pub struct HttpTracker {
    /// The announce url of the http tracker
    url: Url,
    client: Client,
}

impl HttpTracker {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()?;

        Ok(Self { url, client })
    }

    fn create_announce_url(&self, announce: &Announcement) -> Result<Url> {
        let mut url = self.url.clone();

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("port", announce.port.to_string().as_str())
                .append_pair("uploaded", announce.uploaded.to_string().as_str())
                .append_pair("downloaded", announce.downloaded.to_string().as_str())
                .append_pair("left", announce.left.to_string().as_str())
                .append_pair("numwant", announce.num_want.to_string().as_str())
                .append_pair("compact", "1");
            if announce.event != AnnounceEvent::None {
                query.append_pair("event", announce.event.to_string().as_str());
            }
        }

        // the binary values can't be added through the query pairs as they would be encoded twice
        let info_hash =
            percent_encoding::percent_encode(announce.info_hash.as_bytes(), URL_ENCODE_RESERVED);
        let peer_id = announce.peer_id.value();
        let peer_id = percent_encoding::percent_encode(&peer_id, URL_ENCODE_RESERVED);
        let url = format!("{}&info_hash={}&peer_id={}", url, info_hash, peer_id);

        Ok(Url::parse(&url)?)
    }

    fn parse_response(&self, bytes: &[u8]) -> Result<AnnounceResponse> {
        trace!(
            "Http tracker {} received {} bytes, {}",
            self,
            bytes.len(),
            String::from_utf8_lossy(bytes)
        );
        let message = serde_bencode::from_bytes::<HttpResponse>(bytes)?;

        if let Some(failure) = message.failure_reason {
            return Err(TrackerError::Tracker(failure));
        }

        debug!(
            "Http tracker {} received announce response, {:?}",
            self, message
        );
        Ok(message.into())
    }
}

#[async_trait]
impl TrackerClient for HttpTracker {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn announce(&self, announcement: Announcement) -> Result<AnnounceResponse> {
        let url = self.create_announce_url(&announcement)?;

        trace!("Http tracker {} is sending request to {}", self, url);
        let response = self.client.get(url).send().await?;
        let status_code = response.status();

        // an unsuccessful response body is never parsed
        if !status_code.is_success() {
            debug!(
                "Http tracker {} received invalid status code {}",
                self, status_code
            );
            return Err(TrackerError::Status(status_code.as_u16()));
        }

        let bytes = response.bytes().await?;
        self.parse_response(bytes.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use crate::torrent::peer::PeerId;
    use crate::torrent::tracker::DEFAULT_NUM_WANT;
    use crate::torrent::InfoHash;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use std::net::SocketAddr;
    use std::str::FromStr;

    fn create_announcement(event: AnnounceEvent) -> Announcement {
        Announcement {
            info_hash: InfoHash::from_str("2E8E44068B254814EA1A7D4969A9AF1D78E0F51F").unwrap(),
            peer_id: PeerId::new(),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 1024,
            event,
            num_want: DEFAULT_NUM_WANT,
        }
    }

    #[test]
    fn test_create_announce_url() {
        init_logger!();
        let expected_hash_value = "info_hash=.%8ED%06%8B%25H%14%EA%1A%7DIi%A9%AF%1Dx%E0%F5%1F";
        let url = Url::parse("http://localhost:6969/announce?passkey=foo").unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let url = tracker
            .create_announce_url(&create_announcement(AnnounceEvent::Started))
            .unwrap();
        let result = url.query().unwrap();

        assert!(
            result.contains(expected_hash_value),
            "expected the info hash to be present, got {}",
            result
        );
        assert!(result.starts_with("passkey=foo&"), "expected the existing query to be kept");
        assert!(result.contains("event=started"));
        assert!(result.contains("compact=1"));
        assert!(result.contains("numwant=50"));
    }

    #[test]
    fn test_create_announce_url_event_none() {
        init_logger!();
        let url = Url::parse("http://localhost:6969/announce").unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let url = tracker
            .create_announce_url(&create_announcement(AnnounceEvent::None))
            .unwrap();
        let result = url.query().unwrap();

        assert!(!result.contains("event="), "expected the event to be omitted");
    }

    #[tokio::test]
    async fn test_announce() {
        init_logger!();
        let mut body = b"d8:completei3e10:incompletei5e8:intervali900e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        body.extend_from_slice(b"e");
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/announce")
                    .query_param("compact", "1")
                    .query_param("event", "started");
                then.status(200).body(body.as_slice());
            })
            .await;
        let url = Url::parse(server.url("/announce").as_str()).unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let result = tracker
            .announce(create_announcement(AnnounceEvent::Started))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(Duration::from_secs(900), result.interval);
        assert_eq!(3, result.seeders);
        assert_eq!(5, result.leechers);
        assert_eq!(
            vec![
                SocketAddr::from(([127, 0, 0, 1], 6881)),
                SocketAddr::from(([10, 0, 0, 2], 6882))
            ],
            result.peers.iter().map(|e| e.addr()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_announce_peers_dictionary() {
        init_logger!();
        let body = "d8:intervali60e5:peersld2:ip9:127.0.0.14:porti6881eeee";
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/announce");
                then.status(200).body(body);
            })
            .await;
        let url = Url::parse(server.url("/announce").as_str()).unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let result = tracker
            .announce(create_announcement(AnnounceEvent::None))
            .await
            .unwrap();

        assert_eq!(1, result.peers.len());
        assert_eq!(SocketAddr::from(([127, 0, 0, 1], 6881)), result.peers[0].addr());
    }

    #[tokio::test]
    async fn test_announce_failure_reason() {
        init_logger!();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/announce");
                then.status(200).body("d14:failure reason17:torrent not founde");
            })
            .await;
        let url = Url::parse(server.url("/announce").as_str()).unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let result = tracker
            .announce(create_announcement(AnnounceEvent::Started))
            .await;

        assert_eq!(
            Err(TrackerError::Tracker("torrent not found".to_string())),
            result
        );
    }

    #[tokio::test]
    async fn test_announce_invalid_status() {
        init_logger!();
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/announce");
                then.status(503);
            })
            .await;
        let url = Url::parse(server.url("/announce").as_str()).unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let result = tracker
            .announce(create_announcement(AnnounceEvent::Started))
            .await;

        assert_eq!(Err(TrackerError::Status(503)), result);
    }

    #[tokio::test]
    async fn test_announce_redirect() {
        init_logger!();
        let mut body = b"d8:intervali60e5:peers6:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(b"e");
        let server = MockServer::start_async().await;
        let location = server.url("/tracker/announce");
        let redirect = server
            .mock_async(|when, then| {
                when.method(GET).path("/announce");
                then.status(302).header("Location", location.as_str());
            })
            .await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/tracker/announce");
                then.status(200).body(body.as_slice());
            })
            .await;
        let url = Url::parse(server.url("/announce").as_str()).unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let result = tracker
            .announce(create_announcement(AnnounceEvent::Started))
            .await
            .unwrap();

        redirect.assert_async().await;
        mock.assert_async().await;
        assert_eq!(Duration::from_secs(60), result.interval);
        assert_eq!(
            vec![SocketAddr::from(([127, 0, 0, 1], 6881))],
            result.peers.iter().map(|e| e.addr()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_announce_too_many_redirects() {
        init_logger!();
        let server = MockServer::start_async().await;
        let location = server.url("/announce");
        server
            .mock_async(|when, then| {
                when.method(GET).path("/announce");
                then.status(302).header("Location", location.as_str());
            })
            .await;
        let url = Url::parse(server.url("/announce").as_str()).unwrap();
        let tracker = HttpTracker::new(url, Duration::from_secs(2)).unwrap();

        let result = tracker
            .announce(create_announcement(AnnounceEvent::Started))
            .await;

        assert_eq!(Err(TrackerError::TooManyRedirects), result);
    }
}
