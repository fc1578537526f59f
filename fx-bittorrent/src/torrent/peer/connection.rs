use crate::torrent::peer::extension::metadata::{MetadataMessage, EXTENSION_NAME_METADATA};
use crate::torrent::peer::extension::{
    Extension, ExtensionName, ExtensionNumber, ExtensionRegistry, Extensions,
};
use crate::torrent::peer::{
    extension, Error, ExtendedHandshake, Handshake, Message, MessageType, PeerId, Piece,
    ProtocolExtensionFlags, Request, Result, HANDSHAKE_LEN, MAX_BITFIELD_LEN, MAX_MESSAGE_LEN,
};
use crate::torrent::{Bitfield, InfoHash, PieceIndex, MAX_FRAGMENT_SIZE};
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use derive_more::Display;
use fx_handle::Handle;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;

/// The client name and version which is announced in the extended handshake.
const CLIENT_NAME: &str = concat!("FX ", env!("CARGO_PKG_VERSION"));
/// The number of outstanding requests we accept from a remote peer.
const MAX_REMOTE_REQUESTS: u32 = 250;

/// The peer's unique identifier handle.
pub type PeerHandle = Handle;

/// The commands which are sent to the writer of the peer socket.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    /// Write the given bytes to the socket.
    Write(Vec<u8>),
    /// Close the socket.
    Close,
}

/// The states of a [PeerConnection].
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    #[display("awaiting handshake")]
    AwaitingHandshake,
    #[display("ready")]
    Ready,
    #[display("closed")]
    Closed,
}

/// The piece layout of the torrent which is shared with the remote peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PieceLayout {
    /// The total number of pieces
    pub piece_count: usize,
    /// The nominal length of a piece
    pub piece_length: usize,
    /// The total number of bytes of the torrent
    pub total_length: usize,
}

impl PieceLayout {
    /// Get the length of the given piece, which is only different for the last piece.
    pub fn piece_length(&self, piece: PieceIndex) -> Option<usize> {
        if piece >= self.piece_count {
            return None;
        }

        let offset = piece * self.piece_length;
        Some(self.piece_length.min(self.total_length - offset))
    }
}

/// The events which are produced by a [PeerConnection] while processing the received bytes.
#[derive(Debug, Display, Clone, PartialEq)]
pub enum PeerEvent {
    #[display("handshake completed with {}", _0)]
    HandshakeCompleted(PeerId),
    #[display("choked")]
    Choked,
    #[display("unchoked")]
    Unchoked,
    #[display("interested")]
    Interested,
    #[display("not interested")]
    NotInterested,
    #[display("have piece {}", _0)]
    Have(PieceIndex),
    /// The remote bitfield has been replaced
    #[display("bitfield")]
    Bitfield,
    #[display("received fragment {:?}", _0)]
    Fragment(Piece),
    #[display("extension {} enabled", _0)]
    ExtensionEnabled(ExtensionName),
    #[display("metadata size {}", _0)]
    MetadataSize(usize),
    #[display("metadata piece {}", piece)]
    MetadataPiece {
        piece: usize,
        total_size: usize,
        data: Vec<u8>,
    },
    #[display("metadata request {}", _0)]
    MetadataRequest(usize),
    #[display("metadata reject {}", _0)]
    MetadataReject(usize),
}

/// The wire protocol state machine of a single remote peer.
///
/// The connection doesn't own the socket, the received bytes are fed through
/// [PeerConnection::receive] and outgoing messages are sent as [PeerCommand]'s to the socket writer.
#[derive(Debug, Display)]
#[display("{}", addr)]
pub struct PeerConnection {
    handle: PeerHandle,
    addr: SocketAddr,
    info_hash: InfoHash,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    remote_extensions: ProtocolExtensionFlags,
    client_name: Option<String>,
    state: ConnectionState,
    handshake_sent: bool,
    buffer: BytesMut,
    remote_pieces: Bitfield,
    /// The pieces which we have, announced to the remote peer after the handshake
    local_pieces: Bitfield,
    layout: Option<PieceLayout>,
    metadata_size: Option<usize>,
    /// Indicates if we're choking the remote peer
    choked: bool,
    /// Indicates if we're interested in the remote peer
    interested: bool,
    /// Indicates if the remote peer is choking us
    peer_choking: bool,
    /// Indicates if the remote peer is interested in us
    peer_interested: bool,
    /// The requests of the remote peer which still need to be served
    pending_requests: Vec<Request>,
    /// The extension numbers of the remote peer
    remote_registry: ExtensionRegistry,
    /// The supported extensions, by local extension number
    extensions: HashMap<ExtensionNumber, Box<dyn Extension>>,
    sender: UnboundedSender<PeerCommand>,
}

impl PeerConnection {
    /// Create a new connection for the remote peer at the given address.
    ///
    /// # Arguments
    ///
    /// * `handle` - The handle of the underlying socket.
    /// * `addr` - The address of the remote peer.
    /// * `info_hash` - The info hash of the torrent, which must match the remote handshake.
    /// * `local_id` - Our own peer id.
    /// * `extensions` - The extensions which are supported by the connection.
    /// * `sender` - The command sender of the socket writer.
    pub fn new(
        handle: PeerHandle,
        addr: SocketAddr,
        info_hash: InfoHash,
        local_id: PeerId,
        extensions: &Extensions,
        sender: UnboundedSender<PeerCommand>,
    ) -> Self {
        Self {
            handle,
            addr,
            info_hash,
            local_id,
            remote_id: None,
            remote_extensions: ProtocolExtensionFlags::none(),
            client_name: None,
            state: ConnectionState::AwaitingHandshake,
            handshake_sent: false,
            buffer: BytesMut::new(),
            remote_pieces: Bitfield::default(),
            local_pieces: Bitfield::default(),
            layout: None,
            metadata_size: None,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            pending_requests: Vec::new(),
            remote_registry: ExtensionRegistry::new(),
            extensions: extensions
                .iter()
                .map(|e| (e.number(), e.clone_boxed()))
                .collect(),
            sender,
        }
    }

    /// Get the handle of the connection.
    pub fn handle(&self) -> PeerHandle {
        self.handle
    }

    /// Get the address of the remote peer.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the peer id of the remote peer, which is known once the handshake completed.
    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    /// Get the client name of the remote peer, when announced in the extended handshake.
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Get the current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the handshake with the remote peer has been completed.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    /// Get the pieces which are available at the remote peer.
    pub fn remote_pieces(&self) -> &Bitfield {
        &self.remote_pieces
    }

    /// Check if the remote peer has the given piece.
    pub fn has_piece(&self, piece: PieceIndex) -> bool {
        self.remote_pieces.has(piece)
    }

    /// Check if we're choking the remote peer.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Check if we're interested in the remote peer.
    pub fn is_interested(&self) -> bool {
        self.interested
    }

    /// Check if the remote peer is choking us.
    pub fn is_peer_choking(&self) -> bool {
        self.peer_choking
    }

    /// Check if the remote peer is interested in us.
    pub fn is_peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Get the requests of the remote peer which haven't been served yet.
    pub fn pending_requests(&self) -> &[Request] {
        self.pending_requests.as_slice()
    }

    /// Take the requests of the remote peer which haven't been served yet.
    pub fn take_pending_requests(&mut self) -> Vec<Request> {
        mem::take(&mut self.pending_requests)
    }

    /// Check if the remote peer supports the given extension.
    pub fn supports_extension(&self, name: &str) -> bool {
        self.remote_registry.contains_key(name)
    }

    /// Update the piece layout of the torrent.
    /// The remote bitfield is resized to the number of pieces.
    pub fn set_piece_layout(&mut self, layout: PieceLayout) {
        self.remote_pieces = Bitfield::create(layout.piece_count, &self.remote_pieces.to_wire());
        self.layout = Some(layout);
    }

    /// Update the pieces which we have.
    /// They're announced as bitfield once the handshake completes.
    pub fn set_local_pieces(&mut self, pieces: Bitfield) {
        self.local_pieces = pieces;
    }

    /// Update the metadata size which is announced in the extended handshake.
    pub fn set_metadata_size(&mut self, size: Option<usize>) {
        self.metadata_size = size;
    }

    /// Send our handshake to the remote peer, if not already sent.
    pub fn start(&mut self) -> Result<()> {
        if self.handshake_sent {
            return Ok(());
        }

        let handshake = Handshake::new(self.info_hash, self.local_id, ProtocolExtensionFlags::LTEP);
        self.send_bytes(handshake.to_bytes()?)?;
        self.handshake_sent = true;
        Ok(())
    }

    /// Process the given bytes which have been received from the remote peer.
    /// Received bytes are buffered until a complete handshake or message is available.
    ///
    /// # Returns
    ///
    /// It returns the ordered events produced by the received bytes.
    /// It returns an error when the remote peer violated the protocol, in which case the
    /// connection has been closed.
    pub fn receive(&mut self, data: &[u8]) -> Result<Vec<PeerEvent>> {
        if self.state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        self.buffer.extend_from_slice(data);
        let mut events = Vec::new();

        match self.process(&mut events) {
            Ok(_) => Ok(events),
            Err(e) => {
                warn!("Peer {} failed to process incoming data, {}", self, e);
                self.close();
                Err(e)
            }
        }
    }

    /// Update whether we're choking the remote peer.
    /// The message is only sent when the state changes.
    pub fn set_choked(&mut self, choked: bool) -> Result<()> {
        if self.choked == choked {
            return Ok(());
        }

        self.choked = choked;
        if choked {
            self.pending_requests.clear();
            self.write(Message::Choke)
        } else {
            self.write(Message::Unchoke)
        }
    }

    /// Update whether we're interested in the remote peer.
    /// The message is only sent when the state changes.
    pub fn set_interested(&mut self, interested: bool) -> Result<()> {
        if self.interested == interested {
            return Ok(());
        }

        self.interested = interested;
        if interested {
            self.write(Message::Interested)
        } else {
            self.write(Message::NotInterested)
        }
    }

    /// Announce that we have the given piece.
    /// The remote peer is only notified once the handshake has been completed.
    pub fn send_have(&mut self, piece: PieceIndex) -> Result<()> {
        self.local_pieces.set(piece, true);
        if !self.is_ready() {
            return Ok(());
        }

        self.write(Message::Have(piece as u32))
    }

    /// Send our pieces as bitfield to the remote peer.
    pub fn send_bitfield(&self) -> Result<()> {
        self.write(Message::Bitfield(self.local_pieces.to_wire()))
    }

    pub fn send_request(&self, request: Request) -> Result<()> {
        self.write(Message::Request(request))
    }

    pub fn send_cancel(&self, request: Request) -> Result<()> {
        self.write(Message::Cancel(request))
    }

    pub fn send_piece(&self, piece: Piece) -> Result<()> {
        self.write(Message::Piece(piece))
    }

    pub fn send_keepalive(&self) -> Result<()> {
        self.write(Message::KeepAlive)
    }

    /// Send the given payload of the extension to the remote peer.
    ///
    /// # Returns
    ///
    /// It returns an error when the remote peer doesn't support the extension.
    pub fn send_extended(&self, name: &str, payload: Vec<u8>) -> Result<()> {
        let number = self
            .remote_registry
            .get(name)
            .cloned()
            .ok_or_else(|| extension::Error::NotSupported(name.to_string()))?;

        self.write(Message::ExtendedPayload(number, payload))
    }

    /// Request the given metadata piece from the remote peer.
    pub fn request_metadata(&self, piece: usize) -> Result<()> {
        let payload = MetadataMessage::request(piece).to_bytes()?;
        self.send_extended(EXTENSION_NAME_METADATA, payload)
    }

    /// Send the given metadata piece to the remote peer.
    /// When the metadata is unknown or the piece is out of range, a reject is sent instead.
    pub fn send_metadata(&self, piece: usize, metadata: Option<&[u8]>) -> Result<()> {
        let message = metadata
            .and_then(|e| MetadataMessage::data(piece, e))
            .unwrap_or_else(|| MetadataMessage::reject(piece));

        trace!("Peer {} sending metadata message {:?}", self, message);
        self.send_extended(EXTENSION_NAME_METADATA, message.to_bytes()?)
    }

    /// Close the connection.
    /// Any pending requests of the remote peer are dropped.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        debug!("Peer {} is closing the connection", self);
        self.state = ConnectionState::Closed;
        self.pending_requests.clear();
        self.buffer.clear();
        let _ = self.sender.send(PeerCommand::Close);
    }

    fn process(&mut self, events: &mut Vec<PeerEvent>) -> Result<()> {
        loop {
            match self.state {
                ConnectionState::AwaitingHandshake => {
                    if self.buffer.len() < HANDSHAKE_LEN {
                        return Ok(());
                    }

                    let bytes = self.buffer.split_to(HANDSHAKE_LEN);
                    self.on_handshake(&bytes, events)?;
                }
                ConnectionState::Ready => match self.next_message()? {
                    Some(message) => self.on_message(message, events)?,
                    None => return Ok(()),
                },
                ConnectionState::Closed => return Err(Error::Closed),
            }
        }
    }

    /// Try to extract the next message frame from the buffer.
    fn next_message(&mut self) -> Result<Option<Message>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let length = BigEndian::read_u32(&self.buffer[..4]) as usize;
        let max_bitfield_len = 1 + self.max_bitfield_len();
        let max_len = match self.buffer.get(4) {
            Some(id) if *id == MessageType::Bitfield as u8 => max_bitfield_len,
            Some(_) => MAX_MESSAGE_LEN,
            None => MAX_MESSAGE_LEN.max(max_bitfield_len),
        };
        if length > max_len {
            return Err(Error::TooLarge(max_len));
        }

        if self.buffer.len() < 4 + length {
            return Ok(None);
        }

        let frame = self.buffer.split_to(4 + length);
        Message::try_from(&frame[4..]).map(Some)
    }

    fn max_bitfield_len(&self) -> usize {
        self.layout
            .map(|e| e.piece_count.div_ceil(8))
            .unwrap_or(MAX_BITFIELD_LEN)
    }

    fn on_handshake(&mut self, bytes: &[u8], events: &mut Vec<PeerEvent>) -> Result<()> {
        let handshake = Handshake::from_bytes(&self.addr, bytes)?;
        trace!("Peer {} received handshake {:?}", self, handshake);

        if handshake.info_hash != self.info_hash {
            return Err(Error::Handshake(
                self.addr,
                format!(
                    "expected info hash {}, but got {}",
                    self.info_hash, handshake.info_hash
                ),
            ));
        }
        if handshake.peer_id == self.local_id {
            return Err(Error::Handshake(
                self.addr,
                "connected to ourselves".to_string(),
            ));
        }

        self.remote_id = Some(handshake.peer_id);
        self.remote_extensions = handshake.supported_extensions;
        self.state = ConnectionState::Ready;
        self.start()?;
        debug!(
            "Peer {} completed the handshake, remote id {:?}, extensions {}",
            self, handshake.peer_id, handshake.supported_extensions
        );
        events.push(PeerEvent::HandshakeCompleted(handshake.peer_id));

        if self.local_pieces.count_ones() > 0 {
            self.send_bitfield()?;
        }
        if self.remote_extensions.contains(ProtocolExtensionFlags::LTEP) {
            self.send_extended_handshake()?;
        }

        Ok(())
    }

    fn send_extended_handshake(&self) -> Result<()> {
        let handshake = ExtendedHandshake {
            m: self
                .extensions
                .iter()
                .map(|(number, e)| (e.name().to_string(), *number))
                .collect(),
            client: Some(CLIENT_NAME.to_string()),
            port: None,
            reqq: Some(MAX_REMOTE_REQUESTS),
            metadata_size: self.metadata_size.map(|e| e as u32),
        };

        self.write(Message::ExtendedHandshake(handshake))
    }

    fn on_message(&mut self, message: Message, events: &mut Vec<PeerEvent>) -> Result<()> {
        trace!("Peer {} received message {:?}", self, message);
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                events.push(PeerEvent::Choked);
            }
            Message::Unchoke => {
                self.peer_choking = false;
                events.push(PeerEvent::Unchoked);
            }
            Message::Interested => {
                self.peer_interested = true;
                events.push(PeerEvent::Interested);
            }
            Message::NotInterested => {
                self.peer_interested = false;
                events.push(PeerEvent::NotInterested);
            }
            Message::Have(piece) => {
                let piece = piece as PieceIndex;
                self.validate_piece(piece)?;

                if !self.remote_pieces.has(piece) {
                    self.remote_pieces.set(piece, true);
                    events.push(PeerEvent::Have(piece));
                }
            }
            Message::Bitfield(bytes) => {
                let len = match self.layout {
                    Some(layout) => {
                        let expected = layout.piece_count.div_ceil(8);
                        if bytes.len() != expected {
                            return Err(Error::InvalidLength(expected as u32, bytes.len() as u32));
                        }
                        layout.piece_count
                    }
                    None => bytes.len() * 8,
                };

                self.remote_pieces = Bitfield::create(len, &bytes);
                events.push(PeerEvent::Bitfield);
            }
            Message::Request(request) => self.on_request(request)?,
            Message::Piece(piece) => {
                self.validate_piece(piece.index)?;
                events.push(PeerEvent::Fragment(piece));
            }
            Message::Cancel(request) => {
                self.pending_requests.retain(|e| *e != request);
            }
            Message::Port(port) => {
                trace!("Peer {} announced DHT port {}, ignoring", self, port);
            }
            Message::ExtendedHandshake(handshake) => self.on_extended_handshake(handshake, events),
            Message::ExtendedPayload(number, payload) => match self.extensions.get(&number) {
                Some(extension) => events.extend(extension.handle(&payload)?),
                None => warn!(
                    "Peer {} received payload for unknown extension number {}",
                    self, number
                ),
            },
        }

        Ok(())
    }

    fn on_request(&mut self, request: Request) -> Result<()> {
        if request.length == 0 || request.length > MAX_FRAGMENT_SIZE {
            warn!(
                "Peer {} requested an invalid fragment length {}, ignoring request",
                self, request.length
            );
            return Ok(());
        }

        if let Some(layout) = self.layout {
            let piece_length = layout
                .piece_length(request.index)
                .ok_or(Error::InvalidPiece(request.index))?;

            if request.begin + request.length > piece_length {
                return Err(Error::InvalidRequest(format!(
                    "fragment {}..{} exceeds the length {} of piece {}",
                    request.begin,
                    request.begin + request.length,
                    piece_length,
                    request.index
                )));
            }
        }

        if !self.pending_requests.contains(&request) {
            self.pending_requests.push(request);
        }

        Ok(())
    }

    fn on_extended_handshake(&mut self, handshake: ExtendedHandshake, events: &mut Vec<PeerEvent>) {
        for (name, number) in handshake.m.iter() {
            if *number == 0 {
                self.remote_registry.remove(name);
            } else {
                self.remote_registry.insert(name.clone(), *number);
            }
        }
        if handshake.client.is_some() {
            self.client_name = handshake.client.clone();
        }

        for extension in self.extensions.values() {
            if self.remote_registry.contains_key(extension.name()) {
                debug!("Peer {} enabled extension {}", self, extension.name());
                events.push(PeerEvent::ExtensionEnabled(extension.name().to_string()));
                events.extend(extension.on_handshake(&handshake));
            }
        }
    }

    /// Verify that the piece index is within the torrent.
    /// Without a known layout, the index is bounded by the largest bitfield which is accepted.
    fn validate_piece(&self, piece: PieceIndex) -> Result<()> {
        let piece_count = self
            .layout
            .map(|e| e.piece_count)
            .unwrap_or(MAX_BITFIELD_LEN * 8);

        if piece >= piece_count {
            return Err(Error::InvalidPiece(piece));
        }
        Ok(())
    }

    fn write(&self, message: Message) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(Error::Closed);
        }

        trace!("Peer {} sending {:?}", self, message);
        self.send_bytes(message.to_frame()?)
    }

    fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender
            .send(PeerCommand::Write(bytes))
            .map_err(|_| Error::Closed)
    }
}
