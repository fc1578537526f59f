use crate::torrent::peer::extension::{ExtensionNumber, ExtensionRegistry};
use crate::torrent::peer::{Error, PeerId, Result};
use crate::torrent::{InfoHash, PieceFragment, PieceIndex, MAX_FRAGMENT_SIZE};
use bitmask_enum::bitmask;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;
use std::ops::Range;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// The length of the handshake message, `1 + 19 + 8 + 20 + 20`.
pub const HANDSHAKE_LEN: usize = 68;
/// The maximum length of a non-bitfield message, which is a maximum size fragment with its
/// message header.
pub const MAX_MESSAGE_LEN: usize = MAX_FRAGMENT_SIZE + 13;
/// The maximum length of a bitfield payload while the number of pieces is still unknown.
pub const MAX_BITFIELD_LEN: usize = 256 * 1024;

const HANDSHAKE_RESERVED: Range<usize> = 20..28;
const HANDSHAKE_INFO_HASH: Range<usize> = 28..48;
const HANDSHAKE_PEER_ID: Range<usize> = 48..68;
/// The extended handshake id within an extended message.
const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// The protocol extensions which are announced within the reserved bytes of the handshake.
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum ProtocolExtensionFlags {
    /// The extension protocol of BEP10
    LTEP,
    Dht,
    Fast,
}

impl ProtocolExtensionFlags {
    /// The reserved byte and bit of each extension within the handshake.
    const RESERVED_BITS: [(ProtocolExtensionFlags, usize, u8, &'static str); 3] = [
        (ProtocolExtensionFlags::LTEP, 5, 0x10, "LTEP"),
        (ProtocolExtensionFlags::Dht, 7, 0x01, "DHT"),
        (ProtocolExtensionFlags::Fast, 7, 0x04, "Fast"),
    ];
}

impl Display for ProtocolExtensionFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = Self::RESERVED_BITS
            .iter()
            .filter(|(flag, _, _, _)| self.contains(*flag))
            .map(|(_, _, _, name)| *name)
            .collect();

        write!(f, "{}", names.join(" | "))
    }
}

impl From<ProtocolExtensionFlags> for [u8; 8] {
    fn from(flags: ProtocolExtensionFlags) -> Self {
        let mut reserved = [0u8; 8];
        for (flag, byte, bit, _) in ProtocolExtensionFlags::RESERVED_BITS {
            if flags.contains(flag) {
                reserved[byte] |= bit;
            }
        }
        reserved
    }
}

impl From<[u8; 8]> for ProtocolExtensionFlags {
    fn from(reserved: [u8; 8]) -> Self {
        Self::RESERVED_BITS
            .iter()
            .filter(|(_, byte, bit, _)| reserved[*byte] & bit != 0)
            .fold(Self::none(), |flags, (flag, _, _, _)| flags | *flag)
    }
}

/// The id of a wire message, which is the first byte after the length prefix.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MessageType {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// The DHT port of BEP5, which is accepted but not used
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        let message_type = match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            20 => Self::Extended,
            _ => return Err(Error::UnknownMessage(value)),
        };
        Ok(message_type)
    }
}

/// The handshake which opens every peer connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub supported_extensions: ProtocolExtensionFlags,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        supported_extensions: ProtocolExtensionFlags,
    ) -> Self {
        Self {
            supported_extensions,
            info_hash,
            peer_id,
        }
    }

    /// Parse the handshake of the remote peer at the given address.
    /// Only the first [HANDSHAKE_LEN] bytes are read.
    ///
    /// # Returns
    ///
    /// It returns [Error::Handshake] when the bytes don't start with the protocol header.
    pub fn from_bytes(addr: &SocketAddr, bytes: &[u8]) -> Result<Self> {
        let invalid = |reason: String| Error::Handshake(*addr, reason);

        if bytes.len() < HANDSHAKE_LEN {
            return Err(invalid(format!(
                "expected {} bytes, but got {}",
                HANDSHAKE_LEN,
                bytes.len()
            )));
        }
        if bytes[0] as usize != PROTOCOL.len() || &bytes[1..=PROTOCOL.len()] != PROTOCOL {
            return Err(invalid(format!(
                "unknown protocol header {}",
                String::from_utf8_lossy(&bytes[..=PROTOCOL.len()])
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[HANDSHAKE_RESERVED]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[HANDSHAKE_INFO_HASH]);

        Ok(Self {
            supported_extensions: ProtocolExtensionFlags::from(reserved),
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::try_from(&bytes[HANDSHAKE_PEER_ID])?,
        })
    }

    /// Convert the handshake into its wire representation of [HANDSHAKE_LEN] bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let reserved: [u8; 8] = self.supported_extensions.into();
        let mut bytes = Vec::with_capacity(HANDSHAKE_LEN);

        bytes.push(PROTOCOL.len() as u8);
        bytes.extend_from_slice(PROTOCOL);
        bytes.extend_from_slice(&reserved);
        bytes.extend_from_slice(self.info_hash.as_bytes());
        bytes.extend_from_slice(&self.peer_id.value());
        Ok(bytes)
    }
}

/// A length prefixed message of the peer wire protocol.
#[derive(Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// The raw wire bytes of the remote bitfield
    Bitfield(Vec<u8>),
    Request(Request),
    Piece(Piece),
    Cancel(Request),
    Port(u16),
    ExtendedHandshake(ExtendedHandshake),
    ExtendedPayload(ExtensionNumber, Vec<u8>),
}

impl Message {
    /// Get the message id, which is absent for keep-alives.
    pub fn message_type(&self) -> Option<MessageType> {
        let message_type = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageType::Choke,
            Message::Unchoke => MessageType::Unchoke,
            Message::Interested => MessageType::Interested,
            Message::NotInterested => MessageType::NotInterested,
            Message::Have(_) => MessageType::Have,
            Message::Bitfield(_) => MessageType::Bitfield,
            Message::Request(_) => MessageType::Request,
            Message::Piece(_) => MessageType::Piece,
            Message::Cancel(_) => MessageType::Cancel,
            Message::Port(_) => MessageType::Port,
            Message::ExtendedHandshake(_) | Message::ExtendedPayload(_, _) => {
                MessageType::Extended
            }
        };
        Some(message_type)
    }

    /// Convert the message into its payload, without the length prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut frame = self.to_frame()?;
        frame.drain(..4);
        Ok(frame)
    }

    /// Convert the message into a length prefixed wire frame.
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; 4];

        if let Some(message_type) = self.message_type() {
            frame.push(message_type as u8);
        }
        match self {
            Message::Have(piece) => push_u32(&mut frame, *piece),
            Message::Bitfield(bytes) => frame.extend_from_slice(bytes),
            Message::Request(request) | Message::Cancel(request) => {
                push_u32(&mut frame, request.index as u32);
                push_u32(&mut frame, request.begin as u32);
                push_u32(&mut frame, request.length as u32);
            }
            Message::Piece(piece) => {
                push_u32(&mut frame, piece.index as u32);
                push_u32(&mut frame, piece.begin as u32);
                frame.extend_from_slice(&piece.data);
            }
            Message::Port(port) => frame.extend_from_slice(&port.to_be_bytes()),
            Message::ExtendedHandshake(handshake) => {
                frame.push(EXTENDED_HANDSHAKE_ID);
                frame.extend_from_slice(&serde_bencode::to_bytes(handshake)?);
            }
            Message::ExtendedPayload(number, payload) => {
                frame.push(*number);
                frame.extend_from_slice(payload);
            }
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
        }

        let len = frame.len() - 4;
        BigEndian::write_u32(&mut frame[..4], len as u32);
        Ok(frame)
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = Error;

    /// Parse the message payload of a frame, without its length prefix.
    /// An empty payload is a keep-alive.
    fn try_from(bytes: &[u8]) -> Result<Self> {
        let Some((id, payload)) = bytes.split_first() else {
            return Ok(Message::KeepAlive);
        };

        let message = match MessageType::try_from(*id)? {
            MessageType::Choke => Message::Choke,
            MessageType::Unchoke => Message::Unchoke,
            MessageType::Interested => Message::Interested,
            MessageType::NotInterested => Message::NotInterested,
            MessageType::Have => {
                expect_len(payload, 4)?;
                Message::Have(BigEndian::read_u32(payload))
            }
            MessageType::Bitfield => Message::Bitfield(payload.to_vec()),
            MessageType::Request => Message::Request(Request::try_from(payload)?),
            MessageType::Cancel => Message::Cancel(Request::try_from(payload)?),
            MessageType::Piece => Message::Piece(Piece::try_from(payload)?),
            MessageType::Port => {
                expect_len(payload, 2)?;
                Message::Port(BigEndian::read_u16(payload))
            }
            MessageType::Extended => match payload.split_first() {
                Some((&EXTENDED_HANDSHAKE_ID, handshake)) => {
                    let handshake = serde_bencode::from_bytes(handshake).map_err(|e| {
                        Error::Malformed(format!("failed to parse extended handshake, {}", e))
                    })?;
                    Message::ExtendedHandshake(handshake)
                }
                Some((number, extension_payload)) => {
                    Message::ExtendedPayload(*number, extension_payload.to_vec())
                }
                None => return Err(Error::InvalidLength(1, 0)),
            },
        };

        Ok(message)
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Have(piece) => write!(f, "Have({})", piece),
            Message::Bitfield(bytes) => write!(f, "Bitfield([{} bytes])", bytes.len()),
            Message::Request(request) => write!(f, "Request({:?})", request),
            Message::Piece(piece) => write!(f, "Piece({:?})", piece),
            Message::Cancel(request) => write!(f, "Cancel({:?})", request),
            Message::Port(port) => write!(f, "Port({})", port),
            Message::ExtendedHandshake(handshake) => write!(f, "ExtendedHandshake({:?})", handshake),
            Message::ExtendedPayload(number, payload) => {
                write!(f, "ExtendedPayload({}, [{} bytes])", number, payload.len())
            }
            Message::KeepAlive => f.write_str("KeepAlive"),
            Message::Choke => f.write_str("Choke"),
            Message::Unchoke => f.write_str("Unchoke"),
            Message::Interested => f.write_str("Interested"),
            Message::NotInterested => f.write_str("NotInterested"),
        }
    }
}

/// The bencoded dictionary of an extended handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtendedHandshake {
    /// The extension names mapped to the message id the sender expects for them.
    /// An id of 0 disables the extension.
    #[serde(default)]
    pub m: ExtensionRegistry,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    /// The size of the info dictionary in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u32>,
}

/// A block request, also used by the cancel message.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub index: PieceIndex,
    /// The byte offset within the piece
    pub begin: usize,
    pub length: usize,
}

impl TryFrom<&[u8]> for Request {
    type Error = Error;

    fn try_from(payload: &[u8]) -> Result<Self> {
        expect_len(payload, 12)?;

        Ok(Self {
            index: BigEndian::read_u32(&payload[0..4]) as PieceIndex,
            begin: BigEndian::read_u32(&payload[4..8]) as usize,
            length: BigEndian::read_u32(&payload[8..12]) as usize,
        })
    }
}

impl From<&PieceFragment> for Request {
    fn from(value: &PieceFragment) -> Self {
        Self {
            index: value.piece,
            begin: value.begin,
            length: value.length,
        }
    }
}

/// A block of piece data.
#[derive(Clone, PartialEq)]
pub struct Piece {
    pub index: PieceIndex,
    /// The byte offset within the piece
    pub begin: usize,
    pub data: Vec<u8>,
}

impl Piece {
    /// Get the request which is answered by this block.
    pub fn request(&self) -> Request {
        Request {
            index: self.index,
            begin: self.begin,
            length: self.data.len(),
        }
    }
}

impl TryFrom<&[u8]> for Piece {
    type Error = Error;

    fn try_from(payload: &[u8]) -> Result<Self> {
        if payload.len() < 8 {
            return Err(Error::InvalidLength(8, payload.len() as u32));
        }

        Ok(Self {
            index: BigEndian::read_u32(&payload[0..4]) as PieceIndex,
            begin: BigEndian::read_u32(&payload[4..8]) as usize,
            data: payload[8..].to_vec(),
        })
    }
}

impl Debug for Piece {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Piece {{ index: {}, begin: {}, length: {} }}",
            self.index,
            self.begin,
            self.data.len()
        )
    }
}

fn push_u32(buffer: &mut Vec<u8>, value: u32) {
    buffer.extend_from_slice(&value.to_be_bytes());
}

fn expect_len(payload: &[u8], len: usize) -> Result<()> {
    if payload.len() != len {
        return Err(Error::InvalidLength(len as u32, payload.len() as u32));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::init_logger;
    use std::str::FromStr;

    #[test]
    fn test_protocol_extension_flags_reserved_bytes() {
        let reserved: [u8; 8] = ProtocolExtensionFlags::LTEP.into();
        assert_eq!([0, 0, 0, 0, 0, 0x10, 0, 0], reserved);
        assert_eq!(ProtocolExtensionFlags::LTEP, ProtocolExtensionFlags::from(reserved));

        let flags = ProtocolExtensionFlags::LTEP | ProtocolExtensionFlags::Fast;
        let reserved: [u8; 8] = flags.into();
        assert_eq!([0, 0, 0, 0, 0, 0x10, 0, 0x04], reserved);
        assert_eq!(flags, ProtocolExtensionFlags::from(reserved));
        assert_eq!("LTEP | Fast", flags.to_string());

        assert!(ProtocolExtensionFlags::from([0u8; 8]).is_none());
    }

    #[test]
    fn test_handshake_to_bytes() {
        let info_hash = InfoHash::from_str("EADAF0EFEA39406914414D359E0EA16416409BD7").unwrap();
        let handshake = Handshake::new(info_hash, PeerId::new(), ProtocolExtensionFlags::LTEP);

        let result = handshake.to_bytes().unwrap();

        assert_eq!(HANDSHAKE_LEN, result.len());
        assert_eq!(b"\x13BitTorrent protocol".as_slice(), &result[..20]);
        assert_eq!([0u8, 0, 0, 0, 0, 0x10, 0, 0].as_slice(), &result[20..28]);

        let result = Handshake::from_bytes(&([127, 0, 0, 1], 6881).into(), &result).unwrap();
        assert_eq!(handshake, result);
    }

    #[test]
    fn test_handshake_from_bytes_invalid_protocol() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 6881));
        let mut bytes = vec![19u8];
        bytes.extend_from_slice(b"BitTorrent protocoX");
        bytes.extend_from_slice(&[0u8; 48]);

        let result = Handshake::from_bytes(&addr, &bytes);
        assert_eq!(Err(Error::Handshake(addr, String::new())), result);

        let result = Handshake::from_bytes(&addr, &bytes[..40]);
        assert_eq!(Err(Error::Handshake(addr, String::new())), result);
    }

    #[test]
    fn test_message_extended_handshake() {
        init_logger!();
        let mut bytes: Vec<u8> = vec![20, 0];
        bytes.extend_from_slice(b"d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei304838e1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Transmission 3.00e");
        let expected_result = Message::ExtendedHandshake(ExtendedHandshake {
            m: vec![("ut_pex".to_string(), 1), ("ut_metadata".to_string(), 3)]
                .into_iter()
                .collect(),
            client: Some("Transmission 3.00".to_string()),
            port: Some(51413),
            reqq: Some(512),
            metadata_size: Some(304838),
        });

        let result = Message::try_from(bytes.as_slice()).unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_message_type_try_from() {
        assert_eq!(Ok(MessageType::Choke), MessageType::try_from(0));
        assert_eq!(Ok(MessageType::Port), MessageType::try_from(9));
        assert_eq!(Ok(MessageType::Extended), MessageType::try_from(20));
        assert_eq!(Err(Error::UnknownMessage(97)), MessageType::try_from(97));
    }

    #[test]
    fn test_message_to_frame() {
        assert_eq!(vec![0u8; 4], Message::KeepAlive.to_frame().unwrap());
        assert_eq!(vec![0, 0, 0, 1, 2], Message::Interested.to_frame().unwrap());

        let message = Message::Request(Request {
            index: 2,
            begin: 16384,
            length: 16384,
        });
        assert_eq!(
            vec![0, 0, 0, 13, 6, 0, 0, 0, 2, 0, 0, 64, 0, 0, 0, 64, 0],
            message.to_frame().unwrap()
        );

        let message = Message::Bitfield(vec![0b1010_0000]);
        assert_eq!(vec![5, 0b1010_0000], message.to_bytes().unwrap());
    }

    #[test]
    fn test_message_piece_try_from() {
        let bytes = vec![7u8, 0, 0, 0, 1, 0, 0, 0, 4, 10, 11, 12];
        let expected_result = Message::Piece(Piece {
            index: 1,
            begin: 4,
            data: vec![10, 11, 12],
        });

        let result = Message::try_from(bytes.as_slice()).unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_message_invalid_payload_length() {
        let result = Message::try_from([4u8, 0, 0, 1].as_slice());
        assert_eq!(Err(Error::InvalidLength(4, 3)), result);

        let result = Message::try_from([6u8, 0, 0, 0, 1, 0, 0, 0, 0].as_slice());
        assert_eq!(Err(Error::InvalidLength(12, 8)), result);

        let result = Message::try_from([20u8].as_slice());
        assert_eq!(Err(Error::InvalidLength(1, 0)), result);
    }
}
