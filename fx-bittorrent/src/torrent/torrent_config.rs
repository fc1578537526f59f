use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const DEFAULT_PEER_PORT: u16 = 6881;
pub(crate) const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(6);
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 50;
pub(crate) const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_METADATA_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_MAX_PIECES_PER_TICK: usize = 50;
pub(crate) const DEFAULT_TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

/// The torrent configuration values.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentConfig {
    path: PathBuf,
    /// The port on which incoming peer connections are accepted
    pub peer_port: u16,
    /// The max time to establish an outgoing peer connection
    pub peer_connection_timeout: Duration,
    /// The max number of peer connections of the torrent
    pub max_connections: usize,
    /// The interval of the piece scheduler
    pub tick_interval: Duration,
    /// The interval in which keep-alive messages are sent to the peers
    pub keepalive_interval: Duration,
    /// The interval in which missing metadata pieces are requested again
    pub metadata_retry_interval: Duration,
    /// The time after which an unanswered fragment request is issued again
    pub request_timeout: Duration,
    /// The max number of pieces which are requested on each tick
    pub max_pieces_per_tick: usize,
    /// The (initial) timeout of tracker requests
    pub tracker_timeout: Duration,
}

impl TorrentConfig {
    /// Create a new torrent configuration builder.
    pub fn builder() -> TorrentConfigBuilder {
        TorrentConfigBuilder::builder()
    }

    /// Get the path of the torrent data.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Get a copy of this configuration which stores the torrent data within the given path.
    pub fn with_path<P: AsRef<Path>>(&self, path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..self.clone()
        }
    }
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct TorrentConfigBuilder {
    path: Option<PathBuf>,
    peer_port: Option<u16>,
    peer_connection_timeout: Option<Duration>,
    max_connections: Option<usize>,
    tick_interval: Option<Duration>,
    keepalive_interval: Option<Duration>,
    metadata_retry_interval: Option<Duration>,
    request_timeout: Option<Duration>,
    max_pieces_per_tick: Option<usize>,
    tracker_timeout: Option<Duration>,
}

impl TorrentConfigBuilder {
    /// Create a new torrent configuration builder.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Set the torrent data path.
    /// This is the directory in which the downloaded data will be stored.
    pub fn path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the port on which incoming peer connections are accepted.
    pub fn peer_port(&mut self, port: u16) -> &mut Self {
        self.peer_port = Some(port);
        self
    }

    /// Set the timeout for outgoing peer connections.
    pub fn peer_connection_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.peer_connection_timeout = Some(timeout);
        self
    }

    /// Set the max number of peer connections.
    pub fn max_connections(&mut self, limit: usize) -> &mut Self {
        self.max_connections = Some(limit);
        self
    }

    pub fn tick_interval(&mut self, interval: Duration) -> &mut Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn keepalive_interval(&mut self, interval: Duration) -> &mut Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn metadata_retry_interval(&mut self, interval: Duration) -> &mut Self {
        self.metadata_retry_interval = Some(interval);
        self
    }

    /// Set the time after which an unanswered fragment request is issued again.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the max number of pieces which are requested on each scheduler tick.
    pub fn max_pieces_per_tick(&mut self, limit: usize) -> &mut Self {
        self.max_pieces_per_tick = Some(limit);
        self
    }

    pub fn tracker_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.tracker_timeout = Some(timeout);
        self
    }

    /// Build the torrent configuration.
    pub fn build(&mut self) -> TorrentConfig {
        TorrentConfig {
            path: self.path.take().unwrap_or_default(),
            peer_port: self.peer_port.take().unwrap_or(DEFAULT_PEER_PORT),
            peer_connection_timeout: self
                .peer_connection_timeout
                .take()
                .unwrap_or(DEFAULT_PEER_TIMEOUT),
            max_connections: self
                .max_connections
                .take()
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            tick_interval: self.tick_interval.take().unwrap_or(DEFAULT_TICK_INTERVAL),
            keepalive_interval: self
                .keepalive_interval
                .take()
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL),
            metadata_retry_interval: self
                .metadata_retry_interval
                .take()
                .unwrap_or(DEFAULT_METADATA_RETRY_INTERVAL),
            request_timeout: self
                .request_timeout
                .take()
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            max_pieces_per_tick: self
                .max_pieces_per_tick
                .take()
                .unwrap_or(DEFAULT_MAX_PIECES_PER_TICK),
            tracker_timeout: self
                .tracker_timeout
                .take()
                .unwrap_or(DEFAULT_TRACKER_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let expected_result = TorrentConfigBuilder::builder().build();

        let result = TorrentConfig::default();

        assert_eq!(expected_result, result);
        assert_eq!(50, result.max_connections);
        assert_eq!(Duration::from_secs(5), result.tick_interval);
        assert_eq!(Duration::from_secs(15), result.request_timeout);
    }

    #[test]
    fn test_builder() {
        let result = TorrentConfig::builder()
            .path("/tmp/lorem")
            .peer_port(7000)
            .max_pieces_per_tick(10)
            .build();

        assert_eq!(Path::new("/tmp/lorem"), result.path());
        assert_eq!(7000, result.peer_port);
        assert_eq!(10, result.max_pieces_per_tick);
    }
}
