use crate::torrent::tracker::{AnnounceResponse, Announcement, Result, TrackerClient, TrackerError};
use crate::torrent::compact::{COMPACT_IPV4_ADDR_LEN, COMPACT_IPV6_ADDR_LEN};
use crate::torrent::CompactPeer;
use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use derive_more::Display;
use log::{debug, trace, warn};
use std::io::{Cursor, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use url::Url;

/// The magic protocol id which is used by the connect request.
const PROTOCOL_ID: u64 = 0x41727101980;
/// The max number of times a request is retried before giving up.
const MAX_RETRIES: u32 = 8;
/// The max lifetime of a connection id.
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);
/// The max size of a received datagram.
const MAX_PACKET_SIZE: usize = 16 * 1024;

/// The UDP tracker client.
#[derive(Debug, Display)]
#[display("{}", url)]
pub struct UdpTracker {
    url: Url,
    /// The initial timeout of a request, which is doubled on every retry
    timeout: Duration,
    max_retries: u32,
    /// The random key which identifies this client in every announce
    key: u32,
    session: Mutex<Option<UdpSession>>,
}

impl UdpTracker {
    pub fn new(url: Url, timeout: Duration) -> Result<Self> {
        if url.host_str().is_none() || url.port().is_none() {
            return Err(TrackerError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            url,
            timeout,
            max_retries: MAX_RETRIES,
            key: rand::random::<u32>(),
            session: Default::default(),
        })
    }

    /// Create a new udp session with the tracker.
    /// This resolves the tracker address and binds a new local socket.
    async fn create_session(&self) -> Result<UdpSession> {
        let host = self
            .url
            .host_str()
            .ok_or_else(|| TrackerError::InvalidUrl(self.url.to_string()))?;
        let port = self
            .url
            .port()
            .ok_or_else(|| TrackerError::InvalidUrl(self.url.to_string()))?;
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| TrackerError::Connection(format!("failed to resolve {}", host)))?;
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        trace!("Udp tracker {} resolved to {}", self, addr);
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;

        Ok(UdpSession {
            socket,
            peer_addr_len: if addr.is_ipv4() {
                COMPACT_IPV4_ADDR_LEN
            } else {
                COMPACT_IPV6_ADDR_LEN
            },
            connection_id: None,
        })
    }

    /// Get the connection id of the session, or request a new one if it's unknown or expired.
    async fn connection_id(&self, session: &mut UdpSession) -> Result<u64> {
        if let Some((connection_id, created_at)) = session.connection_id {
            if created_at.elapsed() < CONNECTION_ID_LIFETIME {
                return Ok(connection_id);
            }
        }

        let request = RequestMessage::Connect;
        let response = self.send_with_retry(session, PROTOCOL_ID, &request).await?;
        match response {
            ResponseMessage::Connect(connection_id) => {
                debug!("Udp tracker {} received connection id {}", self, connection_id);
                session.connection_id = Some((connection_id, Instant::now()));
                Ok(connection_id)
            }
            _ => Err(TrackerError::Parse(format!(
                "expected connect response, got {:?} instead",
                response
            ))),
        }
    }

    /// Send the given request to the tracker and wait for the matching response.
    /// The request is retried with a doubled timeout when no response is received in time.
    async fn send_with_retry(
        &self,
        session: &UdpSession,
        connection_id: u64,
        request: &RequestMessage,
    ) -> Result<ResponseMessage> {
        let mut timeout = self.timeout;

        for attempt in 0..=self.max_retries {
            let transaction_id = Self::generate_transaction_id();
            let bytes = request.to_bytes(connection_id, transaction_id, self.key)?;

            trace!(
                "Udp tracker {} is sending {} request (attempt {})",
                self,
                request.action(),
                attempt + 1
            );
            session.socket.send(&bytes).await?;

            match tokio::time::timeout(timeout, Self::recv(&session.socket)).await {
                Ok(Ok(buffer)) => {
                    return ResponseMessage::from_bytes(
                        &buffer,
                        request.action(),
                        transaction_id,
                        session.peer_addr_len,
                    )
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(
                        "Udp tracker {} {} request timed out after {}ms",
                        self,
                        request.action(),
                        timeout.as_millis()
                    );
                    timeout *= 2;
                }
            }
        }

        warn!(
            "Udp tracker {} failed to respond after {} retries",
            self, self.max_retries
        );
        Err(TrackerError::Timeout)
    }

    async fn recv(socket: &UdpSocket) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let len = socket.recv(&mut buffer).await?;
        buffer.truncate(len);
        Ok(buffer)
    }

    fn generate_transaction_id() -> u32 {
        rand::random::<u32>()
    }
}

#[async_trait]
impl TrackerClient for UdpTracker {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn announce(&self, announcement: Announcement) -> Result<AnnounceResponse> {
        let mut mutex = self.session.lock().await;
        if mutex.is_none() {
            *mutex = Some(self.create_session().await?);
        }
        let session = mutex
            .as_mut()
            .ok_or_else(|| TrackerError::Connection("udp session unavailable".to_string()))?;

        let connection_id = self.connection_id(session).await?;
        let request = RequestMessage::Announce(announcement);
        match self.send_with_retry(session, connection_id, &request).await {
            Ok(ResponseMessage::Announce(response)) => {
                debug!(
                    "Udp tracker {} received announce response {:?}",
                    self, response
                );
                Ok(response)
            }
            Ok(response) => Err(TrackerError::Parse(format!(
                "expected announce response, got {:?} instead",
                response
            ))),
            Err(e) => {
                // a failed announce might be caused by an expired connection id
                session.connection_id = None;
                Err(e)
            }
        }
    }
}

#[derive(Debug)]
struct UdpSession {
    socket: UdpSocket,
    /// The compact peer length of the address family which the tracker is reached on
    peer_addr_len: usize,
    connection_id: Option<(u64, Instant)>,
}

#[repr(u32)]
#[derive(Debug, Display, Copy, Clone, PartialEq)]
enum Action {
    #[display("connect")]
    Connect = 0,
    #[display("announce")]
    Announce = 1,
    #[display("error")]
    Error = 3,
}

impl TryFrom<u32> for Action {
    type Error = TrackerError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Action::Connect),
            1 => Ok(Action::Announce),
            3 => Ok(Action::Error),
            _ => Err(TrackerError::Parse(format!("unsupported action {}", value))),
        }
    }
}

/// The UDP request message to send to a tracker.
#[derive(Debug)]
enum RequestMessage {
    Connect,
    Announce(Announcement),
}

impl RequestMessage {
    fn action(&self) -> Action {
        match self {
            RequestMessage::Connect => Action::Connect,
            RequestMessage::Announce(_) => Action::Announce,
        }
    }

    fn to_bytes(&self, connection_id: u64, transaction_id: u32, key: u32) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(98);

        buffer.write_u64::<BigEndian>(connection_id)?;
        buffer.write_u32::<BigEndian>(self.action() as u32)?;
        buffer.write_u32::<BigEndian>(transaction_id)?;

        if let RequestMessage::Announce(e) = self {
            buffer.write_all(e.info_hash.as_bytes())?;
            buffer.write_all(&e.peer_id.value())?;
            buffer.write_u64::<BigEndian>(e.downloaded)?;
            buffer.write_u64::<BigEndian>(e.left)?;
            buffer.write_u64::<BigEndian>(e.uploaded)?;
            buffer.write_u32::<BigEndian>(e.event as u32)?;
            // ip address
            buffer.write_u32::<BigEndian>(0)?;
            buffer.write_u32::<BigEndian>(key)?;
            buffer.write_u32::<BigEndian>(e.num_want)?;
            buffer.write_u16::<BigEndian>(e.port)?;
        }

        Ok(buffer)
    }
}

/// The UDP response message received from a tracker.
#[derive(Debug)]
enum ResponseMessage {
    Connect(u64),
    Announce(AnnounceResponse),
}

impl ResponseMessage {
    /// Parse the given datagram as the response of a request with the given action.
    /// A response with another transaction id, or an unexpected action, is rejected.
    ///
    /// The `peer_addr_len` is the compact peer length of the socket address family, as announce
    /// responses only contain peers of the family over which the tracker has been reached.
    fn from_bytes(
        bytes: &[u8],
        expected: Action,
        transaction_id: u32,
        peer_addr_len: usize,
    ) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let action = Action::try_from(cursor.read_u32::<BigEndian>()?)?;
        let received_transaction_id = cursor.read_u32::<BigEndian>()?;

        if received_transaction_id != transaction_id {
            return Err(TrackerError::Parse(format!(
                "expected transaction id {}, got {} instead",
                transaction_id, received_transaction_id
            )));
        }

        match action {
            Action::Error => {
                let mut message = String::new();
                cursor.read_to_string(&mut message)?;
                Err(TrackerError::Tracker(message))
            }
            action if action != expected => Err(TrackerError::Parse(format!(
                "expected {} response, got {} instead",
                expected, action
            ))),
            Action::Connect => Ok(Self::Connect(cursor.read_u64::<BigEndian>()?)),
            Action::Announce => {
                let interval = cursor.read_u32::<BigEndian>()?;
                let leechers = cursor.read_u32::<BigEndian>()?;
                let seeders = cursor.read_u32::<BigEndian>()?;
                let position = cursor.position() as usize;
                let peers = Self::parse_peers(&bytes[position..], peer_addr_len)?;

                Ok(Self::Announce(AnnounceResponse {
                    interval: Duration::from_secs(interval as u64),
                    leechers,
                    seeders,
                    peers,
                }))
            }
        }
    }

    fn parse_peers(bytes: &[u8], addr_len: usize) -> Result<Vec<CompactPeer>> {
        if bytes.len() % addr_len != 0 {
            return Err(TrackerError::Parse(format!(
                "expected a multiple of {} peer bytes, got {} instead",
                addr_len,
                bytes.len()
            )));
        }

        bytes
            .chunks(addr_len)
            .map(|chunk| {
                CompactPeer::try_from(chunk).map_err(|e| TrackerError::Parse(e.to_string()))
            })
            .collect()
    }
}
