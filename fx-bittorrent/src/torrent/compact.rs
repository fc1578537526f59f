use itertools::Itertools;
use log::warn;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub(crate) const COMPACT_IPV4_ADDR_LEN: usize = 6;
pub(crate) const COMPACT_IPV6_ADDR_LEN: usize = 18;

#[derive(Debug, Error, PartialEq)]
pub enum CompactError {
    #[error("invalid compact ip address byte slice")]
    InvalidLength,
    #[error("failed to parse compact ip address, {0}")]
    AddressParse(String),
}

pub type CompactResult<T> = Result<T, CompactError>;

/// A peer address in its compact wire form.
/// IPv4 peers are 6 bytes (4 address + 2 port), IPv6 peers are 18 bytes (16 address + 2 port).
/// The port is always stored in network byte order.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum CompactPeer {
    V4([u8; COMPACT_IPV4_ADDR_LEN]),
    V6([u8; COMPACT_IPV6_ADDR_LEN]),
}

impl CompactPeer {
    /// Get the raw compact bytes of the peer.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            CompactPeer::V4(bytes) => bytes.as_slice(),
            CompactPeer::V6(bytes) => bytes.as_slice(),
        }
    }

    /// Decode the socket address of the peer.
    pub fn addr(&self) -> SocketAddr {
        match self {
            CompactPeer::V4(bytes) => {
                let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
                let port = u16::from_be_bytes([bytes[4], bytes[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            }
            CompactPeer::V6(bytes) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&bytes[..16]);
                let port = u16::from_be_bytes([bytes[16], bytes[17]]);
                SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
            }
        }
    }

    /// Split the given byte slice into compact peers of `addr_len` bytes each.
    fn parse_many(bytes: &[u8], addr_len: usize) -> CompactResult<Vec<CompactPeer>> {
        if bytes.len() % addr_len != 0 {
            return Err(CompactError::InvalidLength);
        }

        Ok(bytes
            .chunks_exact(addr_len)
            .filter_map(|chunk| match CompactPeer::try_from(chunk) {
                Ok(peer) => Some(peer),
                Err(e) => {
                    warn!("Failed to parse compact address, {}", e);
                    None
                }
            })
            .collect())
    }
}

impl TryFrom<&[u8]> for CompactPeer {
    type Error = CompactError;

    fn try_from(bytes: &[u8]) -> CompactResult<Self> {
        match bytes.len() {
            COMPACT_IPV4_ADDR_LEN => {
                let mut addr = [0u8; COMPACT_IPV4_ADDR_LEN];
                addr.copy_from_slice(bytes);
                Ok(CompactPeer::V4(addr))
            }
            COMPACT_IPV6_ADDR_LEN => {
                let mut addr = [0u8; COMPACT_IPV6_ADDR_LEN];
                addr.copy_from_slice(bytes);
                Ok(CompactPeer::V6(addr))
            }
            _ => Err(CompactError::InvalidLength),
        }
    }
}

impl From<SocketAddr> for CompactPeer {
    fn from(addr: SocketAddr) -> Self {
        let port = addr.port().to_be_bytes();

        match addr.ip() {
            IpAddr::V4(ip) => {
                let mut bytes = [0u8; COMPACT_IPV4_ADDR_LEN];
                bytes[0..4].copy_from_slice(&ip.octets());
                bytes[4..].copy_from_slice(&port);
                CompactPeer::V4(bytes)
            }
            IpAddr::V6(ip) => {
                let mut bytes = [0u8; COMPACT_IPV6_ADDR_LEN];
                bytes[0..16].copy_from_slice(&ip.octets());
                bytes[16..].copy_from_slice(&port);
                CompactPeer::V6(bytes)
            }
        }
    }
}

impl Display for CompactPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr())
    }
}

impl Debug for CompactPeer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompactPeer({})", self.addr())
    }
}

/// A list of compact peers as returned by trackers.
///
/// Trackers return peers either as a single compact byte string or as a list of dictionaries
/// containing an `ip` and `port` entry. Both forms are accepted when deserializing.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompactPeers(Vec<CompactPeer>);

impl CompactPeers {
    /// Returns true if there are no peers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of peers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns an iterator over the compact peers.
    pub fn iter(&self) -> impl Iterator<Item = &CompactPeer> {
        self.0.iter()
    }

    /// Try to parse the given compact IPv4 peers byte string.
    pub fn from_ipv4_bytes(bytes: &[u8]) -> CompactResult<Self> {
        CompactPeer::parse_many(bytes, COMPACT_IPV4_ADDR_LEN).map(Self)
    }

    /// Try to parse the given compact IPv6 peers byte string.
    pub fn from_ipv6_bytes(bytes: &[u8]) -> CompactResult<Self> {
        CompactPeer::parse_many(bytes, COMPACT_IPV6_ADDR_LEN).map(Self)
    }
}

impl IntoIterator for CompactPeers {
    type Item = CompactPeer;
    type IntoIter = std::vec::IntoIter<CompactPeer>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Vec<CompactPeer>> for CompactPeers {
    fn from(peers: Vec<CompactPeer>) -> Self {
        Self(peers)
    }
}

impl Serialize for CompactPeers {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes: Vec<u8> = self.0.iter().map(|e| e.as_bytes().to_vec()).concat();
        serializer.serialize_bytes(bytes.as_slice())
    }
}

impl<'de> Deserialize<'de> for CompactPeers {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(CompactPeersVisitor {
            addr_len: COMPACT_IPV4_ADDR_LEN,
        })
    }
}

/// Deserialize a compact IPv6 peers byte string, as used by the `peers6` tracker field.
pub(crate) mod compact_ipv6 {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<CompactPeers, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(CompactPeersVisitor {
            addr_len: COMPACT_IPV6_ADDR_LEN,
        })
    }
}

struct CompactPeersVisitor {
    addr_len: usize,
}

impl<'de> Visitor<'de> for CompactPeersVisitor {
    type Value = CompactPeers;

    fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "expected a byte string or sequence of peer dictionaries"
        )
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        CompactPeer::parse_many(v, self.addr_len)
            .map(CompactPeers)
            .map_err(|e| serde::de::Error::custom(e.to_string()))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_bytes(v.as_bytes())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut peers = Vec::new();

        while let Some(entry) = seq.next_element::<PeerEntry>()? {
            match entry.ip.parse::<IpAddr>() {
                Ok(ip) => peers.push(CompactPeer::from(SocketAddr::new(ip, entry.port))),
                Err(e) => warn!("Failed to parse peer address {}, {}", entry.ip, e),
            }
        }

        Ok(CompactPeers(peers))
    }
}

/// The non-compact dictionary form of a tracker peer.
#[derive(Debug)]
struct PeerEntry {
    ip: String,
    port: u16,
}

impl<'de> Deserialize<'de> for PeerEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PeerEntryVisitor;
        impl<'de> Visitor<'de> for PeerEntryVisitor {
            type Value = PeerEntry;

            fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
                write!(f, "expected a peer dictionary")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut ip = None;
                let mut port = None;

                while let Some(key) = map.next_key::<serde_bytes::ByteBuf>()? {
                    match key.as_slice() {
                        b"ip" => {
                            let value = map.next_value::<serde_bytes::ByteBuf>()?;
                            ip = Some(String::from_utf8_lossy(value.as_slice()).to_string());
                        }
                        b"port" => port = Some(map.next_value::<u16>()?),
                        _ => {
                            let _ = map.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }

                Ok(PeerEntry {
                    ip: ip.ok_or_else(|| serde::de::Error::missing_field("ip"))?,
                    port: port.ok_or_else(|| serde::de::Error::missing_field("port"))?,
                })
            }
        }

        deserializer.deserialize_map(PeerEntryVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Response {
        #[serde(default)]
        peers: CompactPeers,
        #[serde(default, deserialize_with = "compact_ipv6::deserialize")]
        peers6: CompactPeers,
    }

    #[test]
    fn test_compact_peer_v4() {
        let peer = CompactPeer::try_from([127u8, 0, 0, 1, 0x1A, 0xE1].as_slice()).unwrap();

        let result = peer.addr();

        assert_eq!(SocketAddr::from(([127, 0, 0, 1], 6881)), result);
        assert_eq!(&[127u8, 0, 0, 1, 0x1A, 0xE1], peer.as_bytes());
    }

    #[test]
    fn test_compact_peer_v6() {
        let addr: SocketAddr = "[::1]:6882".parse().unwrap();
        let peer = CompactPeer::from(addr);

        assert_eq!(COMPACT_IPV6_ADDR_LEN, peer.as_bytes().len());
        assert_eq!(addr, peer.addr());
    }

    #[test]
    fn test_compact_peer_invalid_length() {
        let result = CompactPeer::try_from([1u8, 2, 3].as_slice());

        assert_eq!(Err(CompactError::InvalidLength), result);
    }

    #[test]
    fn test_deserialize_compact_bytes() {
        let mut payload = b"d5:peers12:".to_vec();
        payload.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
        payload.extend_from_slice(b"e");

        let result = serde_bencode::from_bytes::<Response>(&payload).unwrap();

        assert_eq!(2, result.peers.len());
        assert_eq!(
            SocketAddr::from(([10, 0, 0, 2], 6882)),
            result.peers.iter().nth(1).unwrap().addr()
        );
        assert!(result.peers6.is_empty());
    }

    #[test]
    fn test_deserialize_peer_dictionaries() {
        let payload = b"d5:peersld2:ip9:127.0.0.17:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti6881eeee";

        let result = serde_bencode::from_bytes::<Response>(payload).unwrap();

        assert_eq!(1, result.peers.len());
        assert_eq!(
            SocketAddr::from(([127, 0, 0, 1], 6881)),
            result.peers.iter().next().unwrap().addr()
        );
    }
}
