use crate::torrent::peer::{PeerCommand, PeerHandle};
use derive_more::Display;
use log::{debug, trace, warn};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// The size of the read buffer of a peer socket.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// The raw socket events of a peer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerStreamEvent {
    /// Bytes have been received from the remote peer.
    Data(PeerHandle, Vec<u8>),
    /// The socket has been closed.
    Closed(PeerHandle),
}

/// Spawn the reader and writer loops of the given peer socket.
///
/// The received bytes are forwarded as [PeerStreamEvent]'s to the given sender,
/// while the returned sender accepts the [PeerCommand]'s which should be written to the socket.
/// Both loops are stopped when the parent cancellation token is cancelled.
pub fn spawn_peer_stream<S>(
    handle: PeerHandle,
    addr: SocketAddr,
    stream: S,
    sender: UnboundedSender<PeerStreamEvent>,
    parent_token: &CancellationToken,
) -> UnboundedSender<PeerCommand>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (command_sender, command_receiver) = unbounded_channel();
    let cancellation_token = parent_token.child_token();
    let (reader, writer) = tokio::io::split(stream);

    let mut reader = PeerReader {
        handle,
        addr,
        reader: BufReader::new(reader),
        sender,
        cancellation_token: cancellation_token.clone(),
    };
    let mut writer = PeerWriter {
        handle,
        addr,
        writer,
        receiver: command_receiver,
        cancellation_token,
    };

    tokio::spawn(async move { reader.start_read_loop().await });
    tokio::spawn(async move { writer.start_write_loop().await });

    command_sender
}

/// The buffered reader of a peer socket.
#[derive(Debug, Display)]
#[display("{}[{}]", handle, addr)]
struct PeerReader<S>
where
    S: AsyncRead,
{
    handle: PeerHandle,
    addr: SocketAddr,
    reader: BufReader<ReadHalf<S>>,
    sender: UnboundedSender<PeerStreamEvent>,
    cancellation_token: CancellationToken,
}

impl<S> PeerReader<S>
where
    S: AsyncRead,
{
    async fn start_read_loop(&mut self) {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                read_result = self.reader.read(&mut buffer) => {
                    match read_result {
                        Ok(0) => {
                            trace!("Peer {} reader received EOF", self);
                            break;
                        }
                        Ok(len) => {
                            if self
                                .sender
                                .send(PeerStreamEvent::Data(self.handle, buffer[..len].to_vec()))
                                .is_err()
                            {
                                debug!("Peer {} stream event receiver has been dropped", self);
                                break;
                            }
                        }
                        Err(e) => {
                            if e.kind() != io::ErrorKind::UnexpectedEof {
                                warn!("Peer {} reader encountered an error, {}", self, e);
                            }
                            break;
                        }
                    }
                }
            }
        }

        trace!("Peer {} main reader loop ended", self);
        self.cancellation_token.cancel();
        let _ = self.sender.send(PeerStreamEvent::Closed(self.handle));
    }
}

/// The writer of a peer socket.
#[derive(Debug, Display)]
#[display("{}[{}]", handle, addr)]
struct PeerWriter<S>
where
    S: AsyncWrite,
{
    handle: PeerHandle,
    addr: SocketAddr,
    writer: WriteHalf<S>,
    receiver: UnboundedReceiver<PeerCommand>,
    cancellation_token: CancellationToken,
}

impl<S> PeerWriter<S>
where
    S: AsyncWrite,
{
    async fn start_write_loop(&mut self) {
        loop {
            select! {
                _ = self.cancellation_token.cancelled() => break,
                command = self.receiver.recv() => {
                    match command {
                        Some(PeerCommand::Write(bytes)) => {
                            if let Err(e) = self.write(&bytes).await {
                                debug!("Peer {} failed to write {} bytes, {}", self, bytes.len(), e);
                                break;
                            }
                        }
                        Some(PeerCommand::Close) | None => break,
                    }
                }
            }
        }

        trace!("Peer {} main writer loop ended", self);
        let _ = self.writer.shutdown().await;
        self.cancellation_token.cancel();
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{init_logger, recv_timeout};
    use std::time::Duration;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_spawn_peer_stream_read() {
        init_logger!();
        let handle = PeerHandle::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 6881));
        let (local, mut remote) = duplex(1024);
        let (sender, mut receiver) = unbounded_channel();
        let token = CancellationToken::new();

        let _commands = spawn_peer_stream(handle, addr, local, sender, &token);
        remote.write_all(b"lorem ipsum").await.unwrap();

        let result = recv_timeout!(&mut receiver, Duration::from_millis(500));
        assert_eq!(PeerStreamEvent::Data(handle, b"lorem ipsum".to_vec()), result);

        drop(remote);
        let result = recv_timeout!(&mut receiver, Duration::from_millis(500));
        assert_eq!(PeerStreamEvent::Closed(handle), result);
    }

    #[tokio::test]
    async fn test_spawn_peer_stream_write() {
        init_logger!();
        let handle = PeerHandle::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 6881));
        let (local, mut remote) = duplex(1024);
        let (sender, _receiver) = unbounded_channel();
        let token = CancellationToken::new();
        let mut buffer = [0u8; 5];

        let commands = spawn_peer_stream(handle, addr, local, sender, &token);
        commands.send(PeerCommand::Write(vec![0, 0, 0, 1, 2])).unwrap();

        remote.read_exact(&mut buffer).await.unwrap();
        assert_eq!([0, 0, 0, 1, 2], buffer);
    }

    #[tokio::test]
    async fn test_spawn_peer_stream_close() {
        init_logger!();
        let handle = PeerHandle::new();
        let addr = SocketAddr::from(([127, 0, 0, 1], 6881));
        let (local, mut remote) = duplex(1024);
        let (sender, mut receiver) = unbounded_channel();
        let token = CancellationToken::new();
        let mut buffer = Vec::new();

        let commands = spawn_peer_stream(handle, addr, local, sender, &token);
        commands.send(PeerCommand::Close).unwrap();

        let result = recv_timeout!(&mut receiver, Duration::from_millis(500));
        assert_eq!(PeerStreamEvent::Closed(handle), result);
        let len = remote.read_to_end(&mut buffer).await.unwrap();
        assert_eq!(0, len, "expected the socket to have been shutdown");
    }
}
