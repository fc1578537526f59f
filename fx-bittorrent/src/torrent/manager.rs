use crate::torrent::peer::{IncomingPeer, PeerId, PeerListener, TcpPeerListener};
use crate::torrent::{
    InfoHash, Magnet, Result, Torrent, TorrentConfig, TorrentError, TorrentMetadata,
};
use derive_more::Display;
use futures::future;
use fx_callback::{Callback, MultiThreadedCallback, Subscription};
use fx_handle::Handle;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 6881..=6889;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The unique handle of a torrent manager.
pub type SessionHandle = Handle;

/// The configuration of a [TorrentManager].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// The directory in which the torrent data is stored
    pub path: PathBuf,
    /// The ports on which the manager tries to accept incoming peer connections
    pub port_range: RangeInclusive<u16>,
    /// The max time to wait for the handshake of an incoming peer connection
    pub handshake_timeout: Duration,
    /// The configuration which is applied to new torrents
    pub torrent_config: TorrentConfig,
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    path: Option<PathBuf>,
    port_range: Option<RangeInclusive<u16>>,
    handshake_timeout: Option<Duration>,
    torrent_config: Option<TorrentConfig>,
}

impl SessionConfigBuilder {
    /// Set the directory in which the torrent data is stored.
    pub fn path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the range of ports on which incoming peer connections are accepted.
    /// The first available port within the range is used.
    pub fn port_range(&mut self, range: RangeInclusive<u16>) -> &mut Self {
        self.port_range = Some(range);
        self
    }

    pub fn handshake_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Set the default configuration of new torrents.
    pub fn torrent_config(&mut self, config: TorrentConfig) -> &mut Self {
        self.torrent_config = Some(config);
        self
    }

    pub fn build(&mut self) -> SessionConfig {
        SessionConfig {
            path: self.path.take().unwrap_or_default(),
            port_range: self.port_range.take().unwrap_or(DEFAULT_PORT_RANGE),
            handshake_timeout: self
                .handshake_timeout
                .take()
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            torrent_config: self.torrent_config.take().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Display, Clone, PartialEq)]
pub enum TorrentManagerEvent {
    /// Invoked when a new torrent has been added to the manager
    #[display("torrent {} has been added", _0)]
    TorrentAdded(InfoHash),
    /// Invoked when a torrent has been removed from the manager
    #[display("torrent {} has been removed", _0)]
    TorrentRemoved(InfoHash),
}

/// The aggregated statistics of all torrents within a manager.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct SessionStats {
    /// The number of torrents
    pub torrents: usize,
    /// The total number of connected peers
    pub peers: usize,
    /// The total number of bytes which still need to be downloaded
    pub bytes_left: usize,
}

/// The registry of the torrents within a session.
///
/// The manager owns the listener for incoming peer connections, and dispatches each incoming
/// connection to the torrent which matches the info hash of the handshake.
///
/// # Example
///
/// ```rust,no_run
/// use fx_bittorrent::torrent::{Result, SessionConfig, TorrentManager};
///
/// async fn download(torrent_file: &[u8]) -> Result<()> {
///     let manager = TorrentManager::new(
///         SessionConfig::builder()
///             .path("/torrent/location/directory")
///             .build(),
///     )
///     .await?;
///
///     let torrent = manager.add_torrent_from_bytes(torrent_file).await?;
///     torrent.start().await
/// }
/// ```
#[derive(Debug, Display, Clone)]
#[display("{}", inner)]
pub struct TorrentManager {
    inner: Arc<InnerTorrentManager>,
}

impl TorrentManager {
    /// Create a new torrent manager, which starts listening for incoming peer connections.
    ///
    /// # Returns
    ///
    /// It returns an error when none of the ports within the configured range is available.
    pub async fn new(config: SessionConfig) -> Result<Self> {
        let listener = Self::bind_listener(&config).await?;
        let handle = SessionHandle::new();
        let inner = Arc::new(InnerTorrentManager {
            handle,
            peer_id: PeerId::new(),
            port: listener.port(),
            config,
            torrents: Default::default(),
            callbacks: MultiThreadedCallback::new(),
            cancellation_token: CancellationToken::new(),
        });

        let torrents = inner.torrents.clone();
        let cancellation_token = inner.cancellation_token.clone();
        tokio::spawn(async move {
            Self::start_listener(handle, listener, torrents, cancellation_token).await
        });

        info!("Torrent manager {} is listening on port {}", inner, inner.port);
        Ok(Self { inner })
    }

    pub fn handle(&self) -> SessionHandle {
        self.inner.handle
    }

    /// Get the port on which incoming peer connections are accepted.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Get the peer id which is used by all torrents of this manager.
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Add a new torrent from the raw bytes of a `.torrent` file.
    pub async fn add_torrent_from_bytes(&self, bytes: &[u8]) -> Result<Arc<Torrent>> {
        let metadata = TorrentMetadata::try_from(bytes)?;
        self.add_torrent(metadata).await
    }

    /// Add a new torrent from the given magnet uri.
    /// The info dictionary of the torrent is retrieved from the swarm once started.
    pub async fn add_torrent_from_magnet(&self, uri: &str) -> Result<Arc<Torrent>> {
        let magnet = Magnet::from_str(uri)?;
        let metadata = TorrentMetadata::try_from(magnet)?;
        self.add_torrent(metadata).await
    }

    /// Add a new torrent for the given metadata.
    /// The torrent is not started yet, see [Torrent::start].
    ///
    /// # Returns
    ///
    /// It returns [TorrentError::DuplicateTorrent] when a torrent with the same info hash exists.
    pub async fn add_torrent(&self, metadata: TorrentMetadata) -> Result<Arc<Torrent>> {
        let info_hash = metadata.info_hash;
        let mut torrents = self.inner.torrents.write().await;
        if torrents.contains_key(&info_hash) {
            debug!("Torrent manager {} already contains {}", self, info_hash);
            return Err(TorrentError::DuplicateTorrent(info_hash));
        }

        let torrent = Arc::new(
            Torrent::request()
                .metadata(metadata)
                .config(self.inner.torrent_config())
                .peer_id(self.inner.peer_id)
                .build()?,
        );
        torrents.insert(info_hash, torrent.clone());
        drop(torrents);

        debug!("Torrent manager {} added torrent {}", self, info_hash);
        self.inner
            .callbacks
            .invoke(TorrentManagerEvent::TorrentAdded(info_hash));
        Ok(torrent)
    }

    /// Find the torrent of the given info hash.
    pub async fn find(&self, info_hash: &InfoHash) -> Option<Arc<Torrent>> {
        self.inner.torrents.read().await.get(info_hash).cloned()
    }

    /// Get all torrents of the manager.
    pub async fn torrents(&self) -> Vec<Arc<Torrent>> {
        self.inner.torrents.read().await.values().cloned().collect()
    }

    /// Stop and remove the torrent of the given info hash.
    ///
    /// # Returns
    ///
    /// It returns `true` when the torrent has been removed.
    pub async fn remove(&self, info_hash: &InfoHash) -> bool {
        let torrent = self.inner.torrents.write().await.remove(info_hash);
        let Some(torrent) = torrent else {
            trace!("Torrent manager {} has no torrent {}", self, info_hash);
            return false;
        };

        if let Err(e) = torrent.stop().await {
            debug!("Torrent manager {} failed to stop {}, {}", self, torrent, e);
        }
        debug!("Torrent manager {} removed torrent {}", self, info_hash);
        self.inner
            .callbacks
            .invoke(TorrentManagerEvent::TorrentRemoved(*info_hash));
        true
    }

    /// Get the aggregated statistics of all torrents.
    pub async fn stats(&self) -> SessionStats {
        let torrents = self.torrents().await;
        let futures: Vec<_> = torrents.iter().map(|e| e.stats()).collect();
        let mut stats = SessionStats {
            torrents: torrents.len(),
            ..Default::default()
        };

        for (torrent, result) in torrents.iter().zip(future::join_all(futures).await) {
            match result {
                Ok(torrent_stats) => {
                    stats.peers += torrent_stats.peers;
                    stats.bytes_left += torrent_stats.bytes_left;
                }
                Err(e) => debug!("Failed to retrieve stats of torrent {}, {}", torrent, e),
            }
        }

        stats
    }

    /// Bind the peer listener on the first available port within the configured range.
    async fn bind_listener(config: &SessionConfig) -> Result<TcpPeerListener> {
        let mut last_error = None;

        for port in config.port_range.clone() {
            match TcpPeerListener::new(port, config.handshake_timeout).await {
                Ok(listener) => return Ok(listener),
                Err(e) => {
                    trace!("Port {} is unavailable for the peer listener, {}", port, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(TorrentError::from)
            .unwrap_or(TorrentError::Io("peer listener port range is empty".to_string())))
    }

    async fn start_listener(
        handle: SessionHandle,
        mut listener: TcpPeerListener,
        torrents: Arc<RwLock<HashMap<InfoHash, Arc<Torrent>>>>,
        cancellation_token: CancellationToken,
    ) {
        loop {
            select! {
                _ = cancellation_token.cancelled() => break,
                peer = listener.recv() => match peer {
                    Some(peer) => Self::dispatch_incoming(&torrents, peer).await,
                    None => break,
                },
            }
        }

        listener.close();
        debug!("Torrent manager {} listener has stopped", handle);
    }

    async fn dispatch_incoming(
        torrents: &RwLock<HashMap<InfoHash, Arc<Torrent>>>,
        peer: IncomingPeer,
    ) {
        let torrent = torrents.read().await.get(&peer.info_hash).cloned();
        match torrent {
            Some(torrent) => {
                trace!("Dispatching incoming peer {} to torrent {}", peer, torrent);
                if let Err(e) = torrent.add_incoming(peer) {
                    warn!("Torrent {} failed to accept incoming peer, {}", torrent, e);
                }
            }
            None => debug!(
                "Incoming peer {} requested unknown torrent {}",
                peer, peer.info_hash
            ),
        }
    }
}

impl Callback<TorrentManagerEvent> for TorrentManager {
    fn subscribe(&self) -> Subscription<TorrentManagerEvent> {
        self.inner.callbacks.subscribe()
    }
}

#[derive(Debug, Display)]
#[display("{}", handle)]
struct InnerTorrentManager {
    handle: SessionHandle,
    peer_id: PeerId,
    /// The port of the peer listener
    port: u16,
    config: SessionConfig,
    torrents: Arc<RwLock<HashMap<InfoHash, Arc<Torrent>>>>,
    callbacks: MultiThreadedCallback<TorrentManagerEvent>,
    cancellation_token: CancellationToken,
}

impl InnerTorrentManager {
    /// Get the configuration of a new torrent within this manager.
    fn torrent_config(&self) -> TorrentConfig {
        let mut config = self.config.torrent_config.with_path(&self.config.path);
        config.peer_port = self.port;
        config
    }
}

impl Drop for InnerTorrentManager {
    fn drop(&mut self) {
        trace!("Dropping torrent manager {}", self);
        self.cancellation_token.cancel();
    }
}
