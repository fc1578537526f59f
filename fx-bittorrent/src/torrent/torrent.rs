use crate::torrent::peer::extension::metadata::MetadataExtension;
use crate::torrent::peer::extension::Extensions;
use crate::torrent::peer::{
    spawn_peer_stream, IncomingPeer, PeerCommand, PeerConnection, PeerEvent, PeerHandle, PeerId,
    PeerStreamEvent, PieceLayout,
};
use crate::torrent::storage::{DiskStorage, Storage};
use crate::torrent::tracker::{
    TrackerHandle, TrackerInfo, TrackerManager, TrackerManagerEvent, TransferProgress,
};
use crate::torrent::{
    peer, File, FileIndex, FragmentResult, InfoHash, MagnetLoader, PieceError, PieceFragment,
    PieceIndex, PieceStore, Result, Swarm, TorrentConfig, TorrentError, TorrentMetadata,
};
use derive_more::Display;
use fx_callback::{Callback, MultiThreadedCallback, Subscription};
use fx_handle::Handle;
use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time;
use tokio_util::sync::CancellationToken;
use url::Url;

/// The unique handle of a torrent within a session.
pub type TorrentHandle = Handle;

/// The lifecycle state of a torrent.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum TorrentState {
    /// The torrent has been created, but not yet started
    #[display("initialized")]
    Initialized,
    /// The torrent is exchanging data with the swarm
    #[display("started")]
    Started,
    /// All wanted files have been downloaded, the torrent keeps seeding
    #[display("finished")]
    Finished,
    /// The torrent has been stopped
    #[display("stopped")]
    Stopped,
}

impl TorrentState {
    /// Check if the torrent is exchanging data with peers in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Started | Self::Finished)
    }
}

/// The direction in which a peer connection has been established.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    #[display("inbound")]
    Inbound,
    #[display("outbound")]
    Outbound,
}

#[derive(Debug, Display, Clone, PartialEq)]
#[display("{} ({})", addr, connection_type)]
pub struct PeerInfo {
    /// The handle of the peer
    pub handle: PeerHandle,
    /// The remote address of the peer
    pub addr: SocketAddr,
    /// The indication of the connection direction
    pub connection_type: ConnectionType,
}

#[derive(Debug, Display, Clone, PartialEq)]
pub enum TorrentEvent {
    /// Invoked when the state of the torrent has changed
    #[display("torrent state has changed to {}", _0)]
    StateChanged(TorrentState),
    /// Invoked when the info dictionary of the torrent has been retrieved
    #[display("torrent metadata has been changed")]
    MetadataChanged,
    /// Invoked when a peer completed the handshake
    #[display("peer {} has been connected", _0)]
    PeerConnected(PeerInfo),
    /// Invoked when a connected peer has been closed
    #[display("peer {} has been disconnected", _0)]
    PeerDisconnected(PeerInfo),
    /// Invoked when a piece has been downloaded and verified
    #[display("piece {} has been completed", _0)]
    PieceCompleted(PieceIndex),
    /// Invoked when every piece of a file has been verified
    #[display("file {} has been completed", _0)]
    FileCompleted(FileIndex),
}

/// A snapshot of the progress of a torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentStats {
    pub state: TorrentState,
    /// The completion of the wanted files, between 0 and 100
    pub percent_done: f32,
    /// The number of connected peers
    pub peers: usize,
    /// The total number of pieces, `0` when the metadata is unknown
    pub pieces: usize,
    pub completed_pieces: usize,
    pub files: usize,
    /// The number of bytes which still need to be downloaded for the wanted files
    pub bytes_left: usize,
}

/// The request builder of a new [Torrent].
#[derive(Debug, Default)]
pub struct TorrentRequest {
    metadata: Option<TorrentMetadata>,
    config: Option<TorrentConfig>,
    storage: Option<Box<dyn Storage>>,
    extensions: Option<Extensions>,
    peer_id: Option<PeerId>,
}

impl TorrentRequest {
    /// Set the metadata of the torrent, which might not contain the info dictionary yet.
    pub fn metadata(mut self, metadata: TorrentMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn config(mut self, config: TorrentConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the storage of the torrent data.
    /// When not set, the data is stored on disk within the configured torrent path.
    pub fn storage(mut self, storage: Box<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = Some(extensions);
        self
    }

    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Create the torrent and start its main loop.
    /// The torrent itself won't exchange any data until [Torrent::start] has been called.
    pub fn build(self) -> Result<Torrent> {
        let metadata = self
            .metadata
            .ok_or(TorrentError::InvalidMetadata("metadata is missing".to_string()))?;
        let config = self.config.unwrap_or_default();
        let storage = self
            .storage
            .unwrap_or_else(|| Box::new(DiskStorage::new(config.path())));
        let extensions = self
            .extensions
            .unwrap_or_else(|| vec![Box::new(MetadataExtension::new())]);
        let peer_id = self.peer_id.unwrap_or_else(PeerId::new);

        Torrent::new(metadata, config, storage, extensions, peer_id)
    }
}

/// A torrent which is exchanging pieces with the swarm.
///
/// The torrent state is owned by a single background task, this instance only sends commands to
/// that task. Dropping the torrent stops the background task.
#[derive(Debug, Display)]
#[display("{}", tag)]
pub struct Torrent {
    handle: TorrentHandle,
    info_hash: InfoHash,
    peer_id: PeerId,
    tag: String,
    sender: UnboundedSender<TorrentCommand>,
    callbacks: Arc<MultiThreadedCallback<TorrentEvent>>,
    cancellation_token: CancellationToken,
}

impl Torrent {
    /// Create a new request builder for creating a new torrent.
    pub fn request() -> TorrentRequest {
        TorrentRequest::default()
    }

    fn new(
        metadata: TorrentMetadata,
        config: TorrentConfig,
        storage: Box<dyn Storage>,
        extensions: Extensions,
        peer_id: PeerId,
    ) -> Result<Self> {
        let handle = TorrentHandle::new();
        let info_hash = metadata.info_hash;
        let (sender, command_receiver) = unbounded_channel();
        let (stream_sender, stream_receiver) = unbounded_channel();
        let (dial_sender, dial_receiver) = unbounded_channel();
        let callbacks = Arc::new(MultiThreadedCallback::new());
        let cancellation_token = CancellationToken::new();

        let context = TorrentContext::new(
            metadata,
            config,
            storage,
            extensions,
            peer_id,
            callbacks.clone(),
            stream_sender,
            dial_sender,
            cancellation_token.clone(),
        )?;

        tokio::spawn(async move {
            context
                .run(command_receiver, stream_receiver, dial_receiver)
                .await
        });

        let torrent = Self {
            handle,
            info_hash,
            peer_id,
            tag: info_hash.tag(),
            sender,
            callbacks,
            cancellation_token,
        };
        info!("Torrent {} created for {}", torrent, info_hash);
        Ok(torrent)
    }

    pub fn handle(&self) -> TorrentHandle {
        self.handle
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Get our own peer id which is used by this torrent.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Start exchanging data with the swarm.
    /// This starts the inspection of the stored data and the tracker announcements.
    ///
    /// # Returns
    ///
    /// It returns [TorrentError::Closed] when the torrent has already been stopped.
    pub async fn start(&self) -> Result<()> {
        self.execute(TorrentCommand::Start).await?
    }

    /// Stop the torrent, all peer connections are closed and the trackers are notified.
    pub async fn stop(&self) -> Result<()> {
        self.execute(TorrentCommand::Stop).await
    }

    pub async fn state(&self) -> Result<TorrentState> {
        self.execute(TorrentCommand::State).await
    }

    /// Get the current metadata of the torrent.
    pub async fn metadata(&self) -> Result<TorrentMetadata> {
        self.execute(TorrentCommand::Metadata).await
    }

    /// Get the files of the torrent, which are empty while the metadata is unknown.
    pub async fn files(&self) -> Result<Vec<File>> {
        self.execute(TorrentCommand::Files).await
    }

    pub async fn stats(&self) -> Result<TorrentStats> {
        self.execute(TorrentCommand::Stats).await
    }

    pub async fn trackers(&self) -> Result<Vec<TrackerInfo>> {
        self.execute(TorrentCommand::Trackers).await
    }

    /// Add a new tracker to the torrent.
    pub async fn add_tracker(&self, url: Url) -> Result<TrackerHandle> {
        self.execute(|sender| TorrentCommand::AddTracker(url, sender))
            .await?
    }

    /// Update whether the given file should be downloaded.
    pub async fn set_file_wanted(&self, file: FileIndex, wanted: bool) -> Result<()> {
        self.execute(|sender| TorrentCommand::SetFileWanted(file, wanted, sender))
            .await?
    }

    /// Read the given torrent byte range.
    ///
    /// # Returns
    ///
    /// It returns [TorrentError::DataUnavailable] when the range overlaps pieces which haven't
    /// been verified yet.
    pub async fn read(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        self.execute(|sender| TorrentCommand::Read(offset, length, sender))
            .await?
    }

    /// Connect to the peer at the given address.
    pub fn add_peer(&self, addr: SocketAddr) -> Result<()> {
        self.send(TorrentCommand::ConnectPeer(addr))
    }

    /// Add an incoming peer connection, of which the handshake has already been received.
    pub fn add_incoming(&self, peer: IncomingPeer) -> Result<()> {
        self.send(TorrentCommand::Incoming(peer))
    }

    async fn execute<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> TorrentCommand,
    {
        let (sender, receiver) = oneshot::channel();
        self.send(command(sender))?;
        receiver.await.map_err(|_| TorrentError::Closed)
    }

    fn send(&self, command: TorrentCommand) -> Result<()> {
        self.sender.send(command).map_err(|_| TorrentError::Closed)
    }
}

impl Callback<TorrentEvent> for Torrent {
    fn subscribe(&self) -> Subscription<TorrentEvent> {
        self.callbacks.subscribe()
    }
}

impl PartialEq for Torrent {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Drop for Torrent {
    fn drop(&mut self) {
        trace!("Dropping torrent {}", self);
        self.cancellation_token.cancel();
    }
}

/// The commands which are executed on the main loop of the torrent.
enum TorrentCommand {
    Start(oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    State(oneshot::Sender<TorrentState>),
    Metadata(oneshot::Sender<TorrentMetadata>),
    Files(oneshot::Sender<Vec<File>>),
    Stats(oneshot::Sender<TorrentStats>),
    Trackers(oneshot::Sender<Vec<TrackerInfo>>),
    AddTracker(Url, oneshot::Sender<Result<TrackerHandle>>),
    SetFileWanted(FileIndex, bool, oneshot::Sender<Result<()>>),
    Read(usize, usize, oneshot::Sender<Result<Vec<u8>>>),
    ConnectPeer(SocketAddr),
    Incoming(IncomingPeer),
}

/// The result of an outgoing peer connection attempt.
#[derive(Debug)]
enum DialResult {
    Connected(SocketAddr, TcpStream),
    Failed(SocketAddr),
}

#[derive(Debug)]
struct PeerEntry {
    info: PeerInfo,
    /// Indicates if the peer completed the handshake
    connected: bool,
}

/// The torrent state which is owned by the main loop of the torrent.
#[derive(Debug, Display)]
#[display("{}", tag)]
struct TorrentContext {
    tag: String,
    info_hash: InfoHash,
    peer_id: PeerId,
    config: TorrentConfig,
    metadata: TorrentMetadata,
    state: TorrentState,
    /// The storage which is used once the piece store is created
    storage: Option<Box<dyn Storage>>,
    store: Option<PieceStore>,
    swarm: Swarm,
    magnet_loader: Option<MagnetLoader>,
    tracker_manager: TrackerManager,
    extensions: Extensions,
    peers: HashMap<PeerHandle, PeerEntry>,
    /// The addresses which are currently being dialed
    dialing: HashSet<SocketAddr>,
    /// The outstanding fragment requests and the peer they've been sent to
    requested: HashMap<PieceFragment, (PeerHandle, Instant)>,
    /// The next piece which should be inspected
    inspect_cursor: Option<PieceIndex>,
    uploaded: u64,
    downloaded: u64,
    callbacks: Arc<MultiThreadedCallback<TorrentEvent>>,
    stream_sender: UnboundedSender<PeerStreamEvent>,
    dial_sender: UnboundedSender<DialResult>,
    cancellation_token: CancellationToken,
}

impl TorrentContext {
    fn new(
        metadata: TorrentMetadata,
        config: TorrentConfig,
        storage: Box<dyn Storage>,
        extensions: Extensions,
        peer_id: PeerId,
        callbacks: Arc<MultiThreadedCallback<TorrentEvent>>,
        stream_sender: UnboundedSender<PeerStreamEvent>,
        dial_sender: UnboundedSender<DialResult>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let info_hash = metadata.info_hash;
        let magnet_loader = metadata
            .info
            .is_none()
            .then(|| MagnetLoader::new(info_hash, config.metadata_retry_interval));
        let tracker_manager = TrackerManager::new(
            info_hash,
            peer_id,
            config.peer_port,
            config.tracker_timeout,
        );

        let mut context = Self {
            tag: info_hash.tag(),
            info_hash,
            peer_id,
            metadata,
            state: TorrentState::Initialized,
            storage: Some(storage),
            store: None,
            swarm: Swarm::new(&info_hash),
            magnet_loader,
            tracker_manager,
            extensions,
            peers: HashMap::new(),
            dialing: HashSet::new(),
            requested: HashMap::new(),
            inspect_cursor: None,
            uploaded: 0,
            downloaded: 0,
            callbacks,
            stream_sender,
            dial_sender,
            cancellation_token,
            config,
        };

        context.create_store()?;
        Ok(context)
    }

    async fn run(
        mut self,
        mut command_receiver: UnboundedReceiver<TorrentCommand>,
        mut stream_receiver: UnboundedReceiver<PeerStreamEvent>,
        mut dial_receiver: UnboundedReceiver<DialResult>,
    ) {
        let cancellation_token = self.cancellation_token.clone();
        let mut tracker_receiver = self.tracker_manager.subscribe();
        let mut tick_interval = time::interval(self.config.tick_interval);
        let mut keepalive_interval = time::interval(self.config.keepalive_interval);

        self.add_trackers().await;

        loop {
            select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                command = command_receiver.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(event) = stream_receiver.recv() => self.on_stream_event(event).await,
                Some(result) = dial_receiver.recv() => self.on_dial_result(result).await,
                Ok(event) = tracker_receiver.recv() => self.on_tracker_event(&event),
                _ = future::ready(()), if self.inspect_cursor.is_some() => self.inspect_next().await,
                _ = tick_interval.tick() => self.tick().await,
                _ = keepalive_interval.tick() => self.swarm.send_keepalives(),
            }
        }

        self.swarm.close();
        debug!("Torrent {} main loop ended", self);
    }

    async fn add_trackers(&mut self) {
        for url in self.metadata.trackers() {
            if let Err(e) = self.tracker_manager.add_tracker(url.clone()).await {
                warn!("Torrent {} failed to add tracker {}, {}", self, url, e);
            }
        }
    }

    async fn on_command(&mut self, command: TorrentCommand) {
        match command {
            TorrentCommand::Start(sender) => {
                let _ = sender.send(self.start().await);
            }
            TorrentCommand::Stop(sender) => {
                self.stop().await;
                let _ = sender.send(());
            }
            TorrentCommand::State(sender) => {
                let _ = sender.send(self.state);
            }
            TorrentCommand::Metadata(sender) => {
                let _ = sender.send(self.metadata.clone());
            }
            TorrentCommand::Files(sender) => {
                let files = self
                    .store
                    .as_ref()
                    .map(|e| e.files().to_vec())
                    .unwrap_or_default();
                let _ = sender.send(files);
            }
            TorrentCommand::Stats(sender) => {
                let _ = sender.send(self.stats());
            }
            TorrentCommand::Trackers(sender) => {
                let _ = sender.send(self.tracker_manager.trackers().await);
            }
            TorrentCommand::AddTracker(url, sender) => {
                let result = self
                    .tracker_manager
                    .add_tracker(url)
                    .await
                    .map_err(TorrentError::from);
                let _ = sender.send(result);
            }
            TorrentCommand::SetFileWanted(file, wanted, sender) => {
                let _ = sender.send(self.set_file_wanted(file, wanted).await);
            }
            TorrentCommand::Read(offset, length, sender) => {
                let result = match self.store.as_ref() {
                    Some(store) => store.read(offset, length).await,
                    None => Err(PieceError::Unavailable.into()),
                };
                let _ = sender.send(result);
            }
            TorrentCommand::ConnectPeer(addr) => self.connect_peer(addr),
            TorrentCommand::Incoming(peer) => self.add_incoming(peer).await,
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self.state {
            TorrentState::Initialized => {}
            TorrentState::Started | TorrentState::Finished => return Ok(()),
            TorrentState::Stopped => return Err(TorrentError::Closed),
        }

        self.update_state(TorrentState::Started);
        if self.store.is_some() {
            self.inspect_cursor = Some(0);
        }
        self.update_progress().await;
        self.tracker_manager.start().await;
        Ok(())
    }

    async fn stop(&mut self) {
        if self.state == TorrentState::Stopped {
            return;
        }

        self.update_progress().await;
        self.tracker_manager.stop().await;
        self.swarm.close();
        for (_, entry) in self.peers.drain() {
            if entry.connected {
                self.callbacks
                    .invoke(TorrentEvent::PeerDisconnected(entry.info));
            }
        }
        self.dialing.clear();
        self.requested.clear();
        self.inspect_cursor = None;
        self.update_state(TorrentState::Stopped);
    }

    fn update_state(&mut self, state: TorrentState) {
        if self.state == state {
            return;
        }

        info!("Torrent {} state changed from {} to {}", self, self.state, state);
        self.state = state;
        self.callbacks.invoke(TorrentEvent::StateChanged(state));
    }

    /// Move the torrent between the started and finished state based on the remaining bytes.
    async fn update_finished_state(&mut self) {
        if self.inspect_cursor.is_some() {
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };

        let done = store.left_until_done() == 0;
        match (self.state, done) {
            (TorrentState::Started, true) => {
                self.update_state(TorrentState::Finished);
                self.tracker_manager.completed().await;
            }
            (TorrentState::Finished, false) => self.update_state(TorrentState::Started),
            _ => {}
        }
    }

    async fn update_progress(&self) {
        let left = self
            .store
            .as_ref()
            .map(|e| e.left_until_done() as u64)
            .unwrap_or(0);

        self.tracker_manager
            .update_progress(TransferProgress {
                uploaded: self.uploaded,
                downloaded: self.downloaded,
                left,
            })
            .await;
    }

    fn stats(&self) -> TorrentStats {
        let mut stats = TorrentStats {
            state: self.state,
            percent_done: 0.0,
            peers: self.swarm.peer_count(),
            pieces: 0,
            completed_pieces: 0,
            files: 0,
            bytes_left: 0,
        };

        if let Some(store) = self.store.as_ref() {
            let store_stats = store.stats();
            let wanted: usize = store
                .files()
                .iter()
                .filter(|e| e.wanted)
                .map(|e| e.length)
                .sum();
            let left = store.left_until_done();

            stats.pieces = store_stats.total;
            stats.completed_pieces = store_stats.have;
            stats.files = store.files().len();
            stats.bytes_left = left;
            stats.percent_done = if wanted == 0 {
                100.0
            } else {
                wanted.saturating_sub(left) as f32 / wanted as f32 * 100.0
            };
        }

        stats
    }

    async fn set_file_wanted(&mut self, file: FileIndex, wanted: bool) -> Result<()> {
        let store = self
            .store
            .as_mut()
            .ok_or(TorrentError::Piece(PieceError::Unavailable))?;

        store.set_file_wanted(file, wanted)?;
        debug!("Torrent {} updated file {} wanted to {}", self, file, wanted);
        self.update_finished_state().await;
        Ok(())
    }

    /// Create the piece store when the info dictionary of the torrent is known.
    fn create_store(&mut self) -> Result<()> {
        if self.store.is_some() {
            return Ok(());
        }
        let Some(info) = self.metadata.info.as_ref() else {
            return Ok(());
        };

        let storage = self
            .storage
            .take()
            .unwrap_or_else(|| Box::new(DiskStorage::new(self.config.path())));
        let store = PieceStore::from_info(info, storage)?;

        self.swarm.set_piece_layout(PieceLayout {
            piece_count: store.piece_count(),
            piece_length: store.nominal_piece_length(),
            total_length: store.total_length(),
        });
        if let Some(size) = self.metadata.metadata_size() {
            self.swarm.set_metadata_size(size);
        }

        debug!(
            "Torrent {} created piece store with {} pieces and {} files",
            self,
            store.piece_count(),
            store.files().len()
        );
        self.store = Some(store);
        if self.state.is_active() {
            self.inspect_cursor = Some(0);
        }
        Ok(())
    }

    /// Inspect the stored data of the next piece.
    async fn inspect_next(&mut self) {
        let Some(piece) = self.inspect_cursor else {
            return;
        };
        let Some(store) = self.store.as_mut() else {
            self.inspect_cursor = None;
            return;
        };

        let result = store.inspect_piece(piece).await;
        let piece_count = store.piece_count();
        match result {
            Ok(true) => self.swarm.have_piece(piece),
            Ok(false) => {}
            Err(e) => debug!("Torrent {} failed to inspect piece {}, {}", self, piece, e),
        }

        if piece + 1 < piece_count {
            self.inspect_cursor = Some(piece + 1);
            return;
        }

        self.inspect_cursor = None;
        if let Some(store) = self.store.as_ref() {
            info!(
                "Torrent {} inspected {} pieces, {} are valid",
                self,
                piece_count,
                store.good_pieces().count_ones()
            );
        }
        self.update_progress().await;
        self.update_finished_state().await;
    }

    async fn tick(&mut self) {
        if !self.state.is_active() {
            return;
        }

        let now = Instant::now();
        if let Some(loader) = self.magnet_loader.as_mut() {
            loader.request_pieces(&mut self.swarm, now);
        }

        self.serve_requests().await;
        self.request_fragments(now);
        self.update_progress().await;
    }

    /// Request the missing fragments of the rarest pieces from the swarm.
    fn request_fragments(&mut self, now: Instant) {
        if self.inspect_cursor.is_some() {
            return;
        }
        let Some(store) = self.store.as_ref() else {
            return;
        };

        let request_timeout = self.config.request_timeout;
        self.requested
            .retain(|_, (_, requested_at)| now.duration_since(*requested_at) < request_timeout);

        let available = self.swarm.available();
        let fragments: Vec<PieceFragment> = store
            .missing_pieces()
            .into_iter()
            .filter(|e| available.contains_key(e))
            .sorted_by_key(|e| (available.get(e).cloned().unwrap_or(0), *e))
            .take(self.config.max_pieces_per_tick)
            .flat_map(|e| store.missing_fragments(e))
            .filter(|e| !self.requested.contains_key(e))
            .collect();

        let mut requests = 0;
        for fragment in fragments {
            if let Some(handle) = self.swarm.request_piece_fragment(&fragment) {
                self.requested.insert(fragment, (handle, now));
                requests += 1;
            }
        }

        if requests > 0 {
            trace!("Torrent {} requested {} fragments", self, requests);
        }
    }

    /// Serve the pending requests of the peers which we're not choking.
    async fn serve_requests(&mut self) {
        let requests = self.swarm.take_pending_requests();
        let Some(store) = self.store.as_ref() else {
            return;
        };

        for (handle, request) in requests {
            if !store.have_piece(request.index) {
                trace!(
                    "Torrent {} is unable to serve request {:?}, piece is not available",
                    self.tag,
                    request
                );
                continue;
            }

            match store
                .read_piece_part(request.index, request.begin, request.length)
                .await
            {
                Ok(data) => {
                    self.uploaded += data.len() as u64;
                    self.swarm.send_piece(
                        handle,
                        peer::Piece {
                            index: request.index,
                            begin: request.begin,
                            data,
                        },
                    );
                }
                Err(e) => debug!(
                    "Torrent {} failed to read request {:?}, {}",
                    self.tag, request, e
                ),
            }
        }
    }

    fn on_tracker_event(&mut self, event: &TrackerManagerEvent) {
        match event {
            TrackerManagerEvent::PeersDiscovered(peers) => {
                trace!("Torrent {} discovered {} peers", self, peers.len());
                for peer in peers {
                    self.connect_peer(peer.addr());
                }
            }
            TrackerManagerEvent::TrackerAdded(handle) => {
                debug!("Torrent {} added tracker {}", self, handle)
            }
        }
    }

    /// Get the number of connections which can still be established.
    fn connection_slots(&self) -> usize {
        self.config
            .max_connections
            .saturating_sub(self.swarm.connection_count() + self.dialing.len())
    }

    fn connect_peer(&mut self, addr: SocketAddr) {
        if !self.state.is_active() {
            trace!("Torrent {} is not active, ignoring peer {}", self, addr);
            return;
        }
        if self.swarm.knows(&addr) || self.dialing.contains(&addr) {
            return;
        }
        if self.connection_slots() == 0 {
            trace!("Torrent {} reached the max connections, ignoring peer {}", self, addr);
            return;
        }

        self.dialing.insert(addr);
        let timeout = self.config.peer_connection_timeout;
        let sender = self.dial_sender.clone();
        let cancellation_token = self.cancellation_token.child_token();
        tokio::spawn(async move {
            let result = select! {
                _ = cancellation_token.cancelled() => return,
                result = time::timeout(timeout, TcpStream::connect(addr)) => result,
            };

            let result = match result {
                Ok(Ok(stream)) => DialResult::Connected(addr, stream),
                Ok(Err(e)) => {
                    debug!("Failed to connect to peer {}, {}", addr, e);
                    DialResult::Failed(addr)
                }
                Err(_) => {
                    debug!("Connection to peer {} timed out", addr);
                    DialResult::Failed(addr)
                }
            };
            let _ = sender.send(result);
        });
    }

    async fn on_dial_result(&mut self, result: DialResult) {
        match result {
            DialResult::Connected(addr, stream) => {
                self.dialing.remove(&addr);
                if !self.state.is_active() || self.swarm.knows(&addr) {
                    return;
                }

                self.add_stream(addr, stream, ConnectionType::Outbound, None)
                    .await;
            }
            DialResult::Failed(addr) => {
                self.dialing.remove(&addr);
            }
        }
    }

    async fn add_incoming(&mut self, peer: IncomingPeer) {
        if peer.info_hash != self.info_hash {
            warn!(
                "Torrent {} received incoming peer {} for another torrent {}",
                self, peer.addr, peer.info_hash
            );
            return;
        }
        if !self.state.is_active() || self.connection_slots() == 0 {
            debug!("Torrent {} rejected incoming peer {}", self, peer.addr);
            return;
        }

        self.add_stream(
            peer.addr,
            peer.stream,
            ConnectionType::Inbound,
            Some(peer.handshake),
        )
        .await;
    }

    /// Add a new peer connection over the given socket.
    /// The handshake bytes which have already been read from the socket are processed immediately.
    async fn add_stream(
        &mut self,
        addr: SocketAddr,
        stream: TcpStream,
        connection_type: ConnectionType,
        handshake: Option<Vec<u8>>,
    ) {
        let handle = PeerHandle::new();
        let sender = spawn_peer_stream(
            handle,
            addr,
            stream,
            self.stream_sender.clone(),
            &self.cancellation_token,
        );

        self.add_connection(handle, addr, sender, connection_type);
        if let Some(bytes) = handshake {
            self.on_peer_data(handle, &bytes).await;
        }
    }

    fn add_connection(
        &mut self,
        handle: PeerHandle,
        addr: SocketAddr,
        sender: UnboundedSender<PeerCommand>,
        connection_type: ConnectionType,
    ) {
        let mut connection = PeerConnection::new(
            handle,
            addr,
            self.info_hash,
            self.peer_id,
            &self.extensions,
            sender,
        );
        if let Err(e) = connection.start() {
            debug!("Torrent {} failed to start peer {}, {}", self, addr, e);
            connection.close();
            return;
        }

        self.swarm.add_connection(connection);
        self.peers.insert(
            handle,
            PeerEntry {
                info: PeerInfo {
                    handle,
                    addr,
                    connection_type,
                },
                connected: false,
            },
        );
    }

    async fn on_stream_event(&mut self, event: PeerStreamEvent) {
        match event {
            PeerStreamEvent::Data(handle, data) => self.on_peer_data(handle, &data).await,
            PeerStreamEvent::Closed(handle) => self.remove_peer(handle),
        }
    }

    async fn on_peer_data(&mut self, handle: PeerHandle, data: &[u8]) {
        let events = self.swarm.receive(handle, data);
        if self.swarm.connection(handle).is_none() {
            self.on_peer_removed(handle);
            return;
        }

        for event in events {
            self.on_peer_event(handle, event).await;
        }
    }

    async fn on_peer_event(&mut self, handle: PeerHandle, event: PeerEvent) {
        match event {
            PeerEvent::HandshakeCompleted(_) => {
                if let Some(entry) = self.peers.get_mut(&handle) {
                    entry.connected = true;
                    self.callbacks
                        .invoke(TorrentEvent::PeerConnected(entry.info.clone()));
                }
            }
            PeerEvent::Fragment(piece) => self.on_fragment(handle, piece).await,
            PeerEvent::MetadataSize(size) => {
                if let Some(loader) = self.magnet_loader.as_mut() {
                    if loader.on_metadata_size(size) {
                        loader.request_pieces(&mut self.swarm, Instant::now());
                    }
                }
            }
            PeerEvent::MetadataPiece {
                piece,
                total_size,
                data,
            } => self.on_metadata_piece(handle, piece, total_size, &data),
            PeerEvent::MetadataRequest(piece) => {
                self.swarm
                    .send_metadata(handle, piece, self.metadata.info_bytes());
            }
            PeerEvent::MetadataReject(piece) => {
                if let Some(loader) = self.magnet_loader.as_ref() {
                    loader.on_reject(piece);
                }
            }
            _ => trace!("Torrent {} received {} from peer {}", self, event, handle),
        }
    }

    async fn on_fragment(&mut self, handle: PeerHandle, piece: peer::Piece) {
        let fragment = PieceFragment {
            piece: piece.index,
            begin: piece.begin,
            length: piece.data.len(),
        };
        self.requested.remove(&fragment);

        let Some(store) = self.store.as_mut() else {
            trace!("Torrent {} received fragment before the metadata is known", self.tag);
            return;
        };

        let len = piece.data.len() as u64;
        match store.add_fragment(piece.index, piece.begin, &piece.data).await {
            Ok(FragmentResult::Completed) => {
                self.downloaded += len;
                self.on_piece_completed(piece.index).await;
            }
            Ok(FragmentResult::Incomplete) => self.downloaded += len,
            Ok(FragmentResult::Corrupted) => {
                self.downloaded += len;
                debug!(
                    "Torrent {} piece {} failed verification and will be requested again",
                    self, piece.index
                );
            }
            Ok(FragmentResult::Ignored) => {}
            Err(TorrentError::Piece(e)) => {
                warn!("Torrent {} received invalid fragment from peer {}, {}", self, handle, e);
                self.remove_peer(handle);
            }
            Err(e) => warn!(
                "Torrent {} failed to store fragment {:?}, {}",
                self, fragment, e
            ),
        }
    }

    async fn on_piece_completed(&mut self, piece: PieceIndex) {
        debug!("Torrent {} completed piece {}", self, piece);
        self.swarm.have_piece(piece);
        self.callbacks.invoke(TorrentEvent::PieceCompleted(piece));

        let completed_files: Vec<FileIndex> = self
            .store
            .as_ref()
            .map(|store| {
                store
                    .files()
                    .iter()
                    .filter(|e| e.pieces.contains(&piece))
                    .filter(|e| store.is_file_completed(e.index))
                    .map(|e| e.index)
                    .collect()
            })
            .unwrap_or_default();
        for file in completed_files {
            info!("Torrent {} completed file {}", self, file);
            self.callbacks.invoke(TorrentEvent::FileCompleted(file));
        }

        self.update_progress().await;
        self.update_finished_state().await;
    }

    fn on_metadata_piece(
        &mut self,
        handle: PeerHandle,
        piece: usize,
        total_size: usize,
        data: &[u8],
    ) {
        let Some(loader) = self.magnet_loader.as_mut() else {
            return;
        };

        match loader.on_piece(piece, total_size, data) {
            Ok(Some(info)) => self.on_metadata_retrieved(&info),
            Ok(None) => {}
            Err(e) => warn!(
                "Torrent {} received invalid metadata piece {} from peer {}, {}",
                self, piece, handle, e
            ),
        }
    }

    fn on_metadata_retrieved(&mut self, info: &[u8]) {
        if let Err(e) = self.metadata.update_info(info) {
            warn!("Torrent {} failed to update the metadata, {}", self, e);
            return;
        }

        info!(
            "Torrent {} retrieved the metadata of {}",
            self,
            self.metadata.name().unwrap_or_default()
        );
        self.magnet_loader = None;
        if let Err(e) = self.create_store() {
            error!("Torrent {} failed to create the piece store, {}", self, e);
            return;
        }

        self.callbacks.invoke(TorrentEvent::MetadataChanged);
    }

    /// Remove the peer of the given handle from the torrent.
    fn remove_peer(&mut self, handle: PeerHandle) {
        self.swarm.remove(handle);
        self.on_peer_removed(handle);
    }

    fn on_peer_removed(&mut self, handle: PeerHandle) {
        self.requested.retain(|_, (peer, _)| *peer != handle);

        if let Some(entry) = self.peers.remove(&handle) {
            debug!("Torrent {} removed peer {}", self, entry.info);
            if entry.connected {
                self.callbacks
                    .invoke(TorrentEvent::PeerDisconnected(entry.info));
            }
        }
    }
}
