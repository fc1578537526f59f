use crate::torrent::peer::{Handshake, Result, HANDSHAKE_LEN};
use crate::torrent::InfoHash;
use async_trait::async_trait;
use derive_more::Display;
use log::{debug, trace, warn};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// An incoming peer connection of which the handshake has been received.
#[derive(Debug, Display)]
#[display("{}", addr)]
pub struct IncomingPeer {
    /// The address of the remote peer
    pub addr: SocketAddr,
    /// The info hash of the torrent which is requested by the remote peer
    pub info_hash: InfoHash,
    /// The raw handshake bytes of the remote peer
    pub handshake: Vec<u8>,
    /// The underlying tcp stream of the peer
    pub stream: TcpStream,
}

/// The peer listener accepts incoming peer connections.
/// It listens on a [PeerListener::port] and only delivers connections which sent a valid handshake,
/// so they can be dispatched to the torrent by info hash.
///
/// # Notice
///
/// Every implementation of the peer listener should correctly stop listening when dropped.
#[async_trait]
pub trait PeerListener: Debug + Send + Sync {
    /// Get the port this peer listener is listening on.
    fn port(&self) -> u16;

    /// Receive the next incoming peer from the listener.
    ///
    /// # Returns
    ///
    /// Returns [None] when the listener has been closed.
    async fn recv(&mut self) -> Option<IncomingPeer>;

    /// Close the peer listener.
    /// This will prevent any new incoming connections from being received.
    fn close(&self);
}

#[derive(Debug, Display)]
#[display("tcp listener [{}]", port)]
pub struct TcpPeerListener {
    port: u16,
    receiver: UnboundedReceiver<IncomingPeer>,
    cancellation_token: CancellationToken,
}

impl TcpPeerListener {
    /// Create a new peer listener on the given port.
    /// When the port is `0`, a random available port is assigned by the system.
    ///
    /// # Arguments
    ///
    /// * `port` - The port to listen on.
    /// * `handshake_timeout` - The max time to wait for the handshake of an incoming connection.
    pub async fn new(port: u16, handshake_timeout: Duration) -> Result<Self> {
        trace!("Trying to create new peer listener on port {}", port);
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let port = listener.local_addr()?.port();
        let cancellation_token = CancellationToken::new();
        let (sender, receiver) = unbounded_channel();

        let listener_cancellation = cancellation_token.clone();
        tokio::spawn(async move {
            Self::start(listener, sender, handshake_timeout, listener_cancellation).await
        });

        debug!("Created new peer listener on port {}", port);
        Ok(Self {
            port,
            receiver,
            cancellation_token,
        })
    }

    async fn start(
        listener: TcpListener,
        sender: UnboundedSender<IncomingPeer>,
        handshake_timeout: Duration,
        cancellation_token: CancellationToken,
    ) {
        loop {
            select! {
                _ = cancellation_token.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        trace!("Received incoming peer connection {}", addr);
                        let sender = sender.clone();
                        tokio::spawn(async move {
                            Self::accept_incoming_connection(stream, addr, handshake_timeout, sender).await
                        });
                    }
                    Err(e) => warn!("Peer listener failed to accept connection, {}", e),
                },
            }
        }

        debug!("Peer listener has stopped");
    }

    async fn accept_incoming_connection(
        mut stream: TcpStream,
        addr: SocketAddr,
        handshake_timeout: Duration,
        sender: UnboundedSender<IncomingPeer>,
    ) {
        let mut handshake = vec![0u8; HANDSHAKE_LEN];
        match tokio::time::timeout(handshake_timeout, stream.read_exact(&mut handshake)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("Incoming peer {} failed to send handshake, {}", addr, e);
                return;
            }
            Err(_) => {
                debug!("Incoming peer {} handshake timed out", addr);
                return;
            }
        }

        match Handshake::from_bytes(&addr, &handshake) {
            Ok(value) => {
                let _ = sender.send(IncomingPeer {
                    addr,
                    info_hash: value.info_hash,
                    handshake,
                    stream,
                });
            }
            Err(e) => debug!("Incoming peer {} sent an invalid handshake, {}", addr, e),
        }
    }
}

#[async_trait]
impl PeerListener for TcpPeerListener {
    fn port(&self) -> u16 {
        self.port
    }

    async fn recv(&mut self) -> Option<IncomingPeer> {
        self.receiver.recv().await
    }

    fn close(&self) {
        trace!("Peer listener (port {}) is being closed", self.port);
        self.cancellation_token.cancel();
    }
}

impl Drop for TcpPeerListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use crate::torrent::peer::{PeerId, ProtocolExtensionFlags};
    use std::str::FromStr;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_tcp_peer_listener_recv() {
        init_logger!();
        let info_hash = InfoHash::from_str("EADAF0EFEA39406914414D359E0EA16416409BD7").unwrap();
        let handshake = Handshake::new(info_hash, PeerId::new(), ProtocolExtensionFlags::LTEP)
            .to_bytes()
            .unwrap();
        let mut listener = TcpPeerListener::new(0, Duration::from_secs(2)).await.unwrap();

        let mut stream = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], listener.port())))
            .await
            .unwrap();
        stream.write_all(&handshake).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), listener.recv())
            .await
            .expect("expected an incoming peer")
            .unwrap();
        assert_eq!(info_hash, result.info_hash);
        assert_eq!(handshake, result.handshake);
    }

    #[tokio::test]
    async fn test_tcp_peer_listener_invalid_handshake() {
        init_logger!();
        let mut listener = TcpPeerListener::new(0, Duration::from_secs(2)).await.unwrap();

        let mut stream = TcpStream::connect(SocketAddr::from(([127, 0, 0, 1], listener.port())))
            .await
            .unwrap();
        stream.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(300), listener.recv()).await;
        assert!(result.is_err(), "expected the invalid handshake to be dropped");
    }
}
