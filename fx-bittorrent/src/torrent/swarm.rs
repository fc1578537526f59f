use crate::torrent::peer::extension::metadata::EXTENSION_NAME_METADATA;
use crate::torrent::peer::{PeerConnection, PeerEvent, PeerHandle, PeerId, PieceLayout, Request};
use crate::torrent::{peer, Bitfield, InfoHash, PieceFragment, PieceIndex};
use derive_more::Display;
use log::{debug, trace, warn};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;

/// The number of peers which are asked for a single metadata piece.
const METADATA_REQUEST_PEERS: usize = 2;

/// The set of peer connections of a single torrent.
///
/// The swarm keeps track of the piece availability within the connected peers,
/// where `available[i]` always equals the number of connected peers which have piece `i`.
#[derive(Debug, Display)]
#[display("{}", tag)]
pub struct Swarm {
    tag: String,
    /// The connections which are still awaiting the handshake of the remote peer
    handshaking: HashMap<SocketAddr, PeerConnection>,
    /// The connections which completed the handshake
    peers: HashMap<PeerId, PeerConnection>,
    /// The number of connected peers which have a piece
    available: HashMap<PieceIndex, usize>,
    layout: Option<PieceLayout>,
    metadata_size: Option<usize>,
    local_pieces: Bitfield,
}

impl Swarm {
    pub fn new(info_hash: &InfoHash) -> Self {
        Self {
            tag: info_hash.tag(),
            handshaking: HashMap::new(),
            peers: HashMap::new(),
            available: HashMap::new(),
            layout: None,
            metadata_size: None,
            local_pieces: Bitfield::default(),
        }
    }

    /// Get the number of connections, including the ones still awaiting a handshake.
    pub fn connection_count(&self) -> usize {
        self.handshaking.len() + self.peers.len()
    }

    /// Get the number of peers which completed the handshake.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Check if the swarm has a connection with the given address.
    pub fn knows(&self, addr: &SocketAddr) -> bool {
        self.handshaking.contains_key(addr) || self.peers.values().any(|e| e.addr() == *addr)
    }

    /// Get the connected peers.
    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    /// Get the connection of the given handle.
    pub fn connection(&self, handle: PeerHandle) -> Option<&PeerConnection> {
        self.handshaking
            .values()
            .chain(self.peers.values())
            .find(|e| e.handle() == handle)
    }

    /// Get the piece availability within the connected peers.
    pub fn available(&self) -> &HashMap<PieceIndex, usize> {
        &self.available
    }

    /// Get the number of connected peers which have the given piece.
    pub fn availability(&self, piece: PieceIndex) -> usize {
        self.available.get(&piece).cloned().unwrap_or(0)
    }

    /// Update the piece layout of the torrent.
    /// The remote bitfields are truncated to the piece count, which drops the availability of
    /// the pieces beyond the end of the torrent.
    pub fn set_piece_layout(&mut self, layout: PieceLayout) {
        self.layout = Some(layout);
        self.local_pieces = Bitfield::create(layout.piece_count, &self.local_pieces.to_wire());

        let mut dropped = Vec::new();
        for connection in self.peers.values_mut() {
            dropped.extend(
                connection
                    .remote_pieces()
                    .iter_ones()
                    .filter(|e| *e >= layout.piece_count),
            );
        }
        for connection in self.handshaking.values_mut().chain(self.peers.values_mut()) {
            connection.set_piece_layout(layout);
            connection.set_local_pieces(self.local_pieces.clone());
        }

        for piece in dropped {
            self.decrease_availability(piece);
        }
    }

    /// Update the metadata size which is announced to new connections.
    pub fn set_metadata_size(&mut self, size: usize) {
        self.metadata_size = Some(size);
        for connection in self.handshaking.values_mut() {
            connection.set_metadata_size(Some(size));
        }
    }

    /// Update the pieces which we have.
    pub fn set_local_pieces(&mut self, pieces: Bitfield) {
        for connection in self.handshaking.values_mut() {
            connection.set_local_pieces(pieces.clone());
        }
        self.local_pieces = pieces;
    }

    /// Add a new connection which is awaiting the handshake of the remote peer.
    /// An existing connection with the same address is closed.
    pub fn add_connection(&mut self, mut connection: PeerConnection) {
        if let Some(layout) = self.layout {
            connection.set_piece_layout(layout);
        }
        connection.set_metadata_size(self.metadata_size);
        connection.set_local_pieces(self.local_pieces.clone());

        trace!("Swarm {} is adding connection {}", self, connection);
        if let Some(mut existing) = self.handshaking.insert(connection.addr(), connection) {
            debug!("Swarm {} replaced handshaking connection {}", self, existing);
            existing.close();
        }
    }

    /// Process the bytes which have been received for the given connection.
    ///
    /// # Returns
    ///
    /// It returns the events of the connection.
    /// When the connection violated the protocol, it's removed from the swarm and no events are returned.
    pub fn receive(&mut self, handle: PeerHandle, data: &[u8]) -> Vec<PeerEvent> {
        if let Some(addr) = self
            .handshaking
            .values()
            .find(|e| e.handle() == handle)
            .map(|e| e.addr())
        {
            return self.receive_handshaking(addr, data);
        }

        let Some(peer_id) = self.peer_id(handle) else {
            trace!("Swarm {} received data for unknown connection {}", self, handle);
            return Vec::new();
        };
        let Some(connection) = self.peers.get_mut(&peer_id) else {
            return Vec::new();
        };

        let before = connection.remote_pieces().clone();
        match connection.receive(data) {
            Ok(events) => {
                self.on_events(&peer_id, &before, &events);
                events
            }
            Err(_) => {
                self.remove_peer(&peer_id);
                Vec::new()
            }
        }
    }

    /// Remove the connection with the given handle from the swarm.
    /// The availability of the peer pieces is removed.
    pub fn remove(&mut self, handle: PeerHandle) -> Option<PeerConnection> {
        if let Some(addr) = self
            .handshaking
            .values()
            .find(|e| e.handle() == handle)
            .map(|e| e.addr())
        {
            let mut connection = self.handshaking.remove(&addr)?;
            connection.close();
            return Some(connection);
        }

        let peer_id = self.peer_id(handle)?;
        self.remove_peer(&peer_id)
    }

    /// Request the given fragment from a random peer which has the piece and isn't choking us.
    /// Peers which have the piece but are choking us are marked as interested.
    ///
    /// # Returns
    ///
    /// It returns the handle of the peer to which the request was sent.
    pub fn request_piece_fragment(&mut self, fragment: &PieceFragment) -> Option<PeerHandle> {
        let mut candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.has_piece(fragment.piece) && !e.is_peer_choking())
            .map(|(id, _)| *id)
            .collect();

        if candidates.is_empty() {
            let choking: Vec<PeerId> = self
                .peers
                .iter()
                .filter(|(_, e)| e.has_piece(fragment.piece) && !e.is_interested())
                .map(|(id, _)| *id)
                .collect();
            for peer_id in choking {
                self.with_peer(&peer_id, |e| e.set_interested(true));
            }
            return None;
        }

        candidates.shuffle(&mut rand::rng());
        let peer_id = candidates[0];
        let request = Request::from(fragment);
        let sent = self.with_peer(&peer_id, |e| {
            e.set_interested(true)?;
            e.set_choked(false)?;
            e.send_request(request)
        });

        if sent {
            self.peers.get(&peer_id).map(|e| e.handle())
        } else {
            None
        }
    }

    /// Cancel the given request at the peer of the given handle.
    pub fn cancel_request(&mut self, handle: PeerHandle, request: Request) {
        if let Some(peer_id) = self.peer_id(handle) {
            self.with_peer(&peer_id, |e| e.send_cancel(request));
        }
    }

    /// Request the given metadata piece from random peers which support the metadata extension.
    ///
    /// # Returns
    ///
    /// It returns the number of peers to which the request was sent.
    pub fn request_metadata_piece(&mut self, piece: usize) -> usize {
        let mut candidates: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| e.supports_extension(EXTENSION_NAME_METADATA))
            .map(|(id, _)| *id)
            .collect();
        candidates.shuffle(&mut rand::rng());

        candidates
            .into_iter()
            .take(METADATA_REQUEST_PEERS)
            .filter(|peer_id| self.with_peer(peer_id, |e| e.request_metadata(piece)))
            .count()
    }

    /// Send the given metadata piece, or a reject when the metadata is unknown, to the given peer.
    pub fn send_metadata(&mut self, handle: PeerHandle, piece: usize, metadata: Option<&[u8]>) {
        if let Some(peer_id) = self.peer_id(handle) {
            self.with_peer(&peer_id, |e| e.send_metadata(piece, metadata));
        }
    }

    /// Announce the given piece to all peers.
    pub fn have_piece(&mut self, piece: PieceIndex) {
        self.local_pieces.set(piece, true);

        for connection in self.handshaking.values_mut() {
            let _ = connection.send_have(piece);
        }
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in peers {
            self.with_peer(&peer_id, |e| e.send_have(piece));
        }
    }

    /// Send a keep-alive to all peers.
    pub fn send_keepalives(&mut self) {
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer_id in peers {
            self.with_peer(&peer_id, |e| e.send_keepalive());
        }
    }

    /// Take the pending requests of all peers which we're not choking.
    pub fn take_pending_requests(&mut self) -> Vec<(PeerHandle, Request)> {
        self.peers
            .values_mut()
            .filter(|e| !e.is_choked())
            .flat_map(|e| {
                let handle = e.handle();
                e.take_pending_requests()
                    .into_iter()
                    .map(move |request| (handle, request))
            })
            .collect()
    }

    /// Send the given piece data to the peer of the given handle.
    pub fn send_piece(&mut self, handle: PeerHandle, piece: peer::Piece) {
        if let Some(peer_id) = self.peer_id(handle) {
            self.with_peer(&peer_id, |e| e.send_piece(piece));
        }
    }

    /// Close all connections of the swarm.
    pub fn close(&mut self) {
        for (_, mut connection) in self.handshaking.drain() {
            connection.close();
        }
        for (_, mut connection) in self.peers.drain() {
            connection.close();
        }
        self.available.clear();
    }

    fn receive_handshaking(&mut self, addr: SocketAddr, data: &[u8]) -> Vec<PeerEvent> {
        let Some(connection) = self.handshaking.get_mut(&addr) else {
            return Vec::new();
        };

        let before = connection.remote_pieces().clone();
        let events = match connection.receive(data) {
            Ok(events) => events,
            Err(e) => {
                debug!("Swarm {} failed to complete handshake with {}, {}", self, addr, e);
                self.handshaking.remove(&addr);
                return Vec::new();
            }
        };

        if !connection.is_ready() {
            return events;
        }

        let Some(connection) = self.handshaking.remove(&addr) else {
            return events;
        };
        let Some(peer_id) = connection.remote_id() else {
            return events;
        };

        if self.peers.contains_key(&peer_id) {
            debug!("Swarm {} replacing duplicate peer {:?}", self, peer_id);
            self.remove_peer(&peer_id);
        }

        debug!("Swarm {} connected with peer {}", self, connection);
        self.peers.insert(peer_id, connection);
        self.on_events(&peer_id, &before, &events);
        events
    }

    fn on_events(&mut self, peer_id: &PeerId, before: &Bitfield, events: &[PeerEvent]) {
        let availability_changed = events
            .iter()
            .any(|e| matches!(e, PeerEvent::Have(_) | PeerEvent::Bitfield));
        if availability_changed {
            if let Some(after) = self.peers.get(peer_id).map(|e| e.remote_pieces().clone()) {
                self.update_availability(before, &after);
            }
        }

        if events.iter().any(|e| *e == PeerEvent::Interested) {
            self.with_peer(peer_id, |e| e.set_choked(false));
        }
    }

    fn update_availability(&mut self, before: &Bitfield, after: &Bitfield) {
        for piece in before.iter_ones().filter(|e| !after.has(*e)) {
            self.decrease_availability(piece);
        }
        for piece in after.iter_ones().filter(|e| !before.has(*e)) {
            *self.available.entry(piece).or_insert(0) += 1;
        }
    }

    fn decrease_availability(&mut self, piece: PieceIndex) {
        if let Some(count) = self.available.get_mut(&piece) {
            *count -= 1;
            if *count == 0 {
                self.available.remove(&piece);
            }
        }
    }

    fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerConnection> {
        let mut connection = self.peers.remove(peer_id)?;
        connection.close();

        for piece in connection.remote_pieces().iter_ones() {
            self.decrease_availability(piece);
        }

        debug!("Swarm {} removed peer {}", self, connection);
        Some(connection)
    }

    fn peer_id(&self, handle: PeerHandle) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(_, e)| e.handle() == handle)
            .map(|(id, _)| *id)
    }

    /// Execute the given write operation on the peer.
    /// The peer is removed from the swarm when the operation fails.
    fn with_peer<F>(&mut self, peer_id: &PeerId, operation: F) -> bool
    where
        F: FnOnce(&mut PeerConnection) -> peer::Result<()>,
    {
        let result = match self.peers.get_mut(peer_id) {
            Some(connection) => operation(connection),
            None => return false,
        };

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("Swarm {} failed to write to peer {}, {}", self, peer_id, e);
                self.remove_peer(peer_id);
                false
            }
        }
    }
}
