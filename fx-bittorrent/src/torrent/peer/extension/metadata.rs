use crate::torrent::peer::extension::{Extension, ExtensionNumber, Result};
use crate::torrent::peer::{extension, ExtendedHandshake, PeerEvent};
use log::trace;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Debug, Formatter};
use std::io::Cursor;

/// The name of the metadata exchange extension, see BEP9.
pub const EXTENSION_NAME_METADATA: &str = "ut_metadata";
/// The local extension number of the metadata exchange extension.
pub const EXTENSION_NUMBER_METADATA: ExtensionNumber = 2;
/// The size of a metadata piece, only the last piece might be smaller.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

/// The metadata action type of the message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetadataMessageType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

/// The BEP9 extension protocol message for the metadata extension.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataMessage {
    #[serde(
        serialize_with = "serialize_metadata_type",
        deserialize_with = "deserialize_metadata_type"
    )]
    pub msg_type: MetadataMessageType,
    /// Indicates which part of the metadata this message refers to
    pub piece: usize,
    /// The total size of the metadata, only present for data messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<usize>,
    /// The raw metadata bytes which trail the bencoded dictionary of a data message
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl MetadataMessage {
    /// Create a new request message for the given metadata piece.
    pub fn request(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Request,
            piece,
            total_size: None,
            data: vec![],
        }
    }

    /// Create a new reject message for the given metadata piece.
    pub fn reject(piece: usize) -> Self {
        Self {
            msg_type: MetadataMessageType::Reject,
            piece,
            total_size: None,
            data: vec![],
        }
    }

    /// Create a data message for the given piece out of the complete metadata.
    ///
    /// # Returns
    ///
    /// It returns [None] when the piece is beyond the end of the metadata.
    pub fn data(piece: usize, metadata: &[u8]) -> Option<Self> {
        let start = piece
            .checked_mul(METADATA_PIECE_SIZE)
            .filter(|e| *e < metadata.len())?;
        let end = (start + METADATA_PIECE_SIZE).min(metadata.len());

        Some(Self {
            msg_type: MetadataMessageType::Data,
            piece,
            total_size: Some(metadata.len()),
            data: metadata[start..end].to_vec(),
        })
    }

    /// Parse the given extension payload.
    /// The remaining bytes after the bencoded dictionary are stored as the message data.
    pub fn from_bytes(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        let mut deserializer = serde_bencode::de::Deserializer::new(&mut cursor);

        let mut message: MetadataMessage = Deserialize::deserialize(&mut deserializer)?;
        let position = cursor.position() as usize;
        message.data = payload[position..].to_vec();

        Ok(message)
    }

    /// Serialize the message into the extension payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut payload = serde_bencode::to_bytes(self)?;
        payload.extend_from_slice(&self.data);
        Ok(payload)
    }
}

impl Debug for MetadataMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataMessage")
            .field("msg_type", &self.msg_type)
            .field("piece", &self.piece)
            .field("total_size", &self.total_size)
            .field("data", &format!("[size {}]", self.data.len()))
            .finish()
    }
}

/// The metadata exchange extension, see BEP9.
///
/// It translates the received metadata messages into peer events, the exchange itself is driven
/// by the [crate::torrent::MagnetLoader] and the owning torrent.
#[derive(Debug, Default, Clone)]
pub struct MetadataExtension;

impl MetadataExtension {
    pub fn new() -> Self {
        Self
    }
}

impl Extension for MetadataExtension {
    fn name(&self) -> &str {
        EXTENSION_NAME_METADATA
    }

    fn number(&self) -> ExtensionNumber {
        EXTENSION_NUMBER_METADATA
    }

    fn on_handshake(&self, handshake: &ExtendedHandshake) -> Vec<PeerEvent> {
        handshake
            .metadata_size
            .filter(|e| *e > 0)
            .map(|e| vec![PeerEvent::MetadataSize(e as usize)])
            .unwrap_or_default()
    }

    fn handle(&self, payload: &[u8]) -> Result<Vec<PeerEvent>> {
        let message = MetadataMessage::from_bytes(payload)?;
        trace!("Received metadata message {:?}", message);

        let event = match message.msg_type {
            MetadataMessageType::Request => PeerEvent::MetadataRequest(message.piece),
            MetadataMessageType::Data => {
                let total_size = message.total_size.ok_or(extension::Error::InvalidPayload(
                    "expected the total size of the metadata to be present".to_string(),
                ))?;
                PeerEvent::MetadataPiece {
                    piece: message.piece,
                    total_size,
                    data: message.data,
                }
            }
            MetadataMessageType::Reject => PeerEvent::MetadataReject(message.piece),
        };

        Ok(vec![event])
    }

    fn clone_boxed(&self) -> Box<dyn Extension> {
        Box::new(self.clone())
    }
}

fn serialize_metadata_type<S>(
    message_type: &MetadataMessageType,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u8(*message_type as u8)
}

fn deserialize_metadata_type<'de, D>(
    deserializer: D,
) -> std::result::Result<MetadataMessageType, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u8::deserialize(deserializer)?;
    match value {
        0 => Ok(MetadataMessageType::Request),
        1 => Ok(MetadataMessageType::Data),
        2 => Ok(MetadataMessageType::Reject),
        _ => Err(de::Error::custom(format!(
            "invalid message type {} specified",
            value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize() {
        let message = MetadataMessage::request(0);
        let expected_result = "d8:msg_typei0e5:piecei0ee";

        let result = message.to_bytes().unwrap();

        assert_eq!(expected_result.as_bytes(), result.as_slice());
    }

    #[test]
    fn test_from_bytes_trailing_data() {
        let payload = b"d8:msg_typei1e5:piecei1e10:total_sizei20000ee0123456789";
        let expected_result = MetadataMessage {
            msg_type: MetadataMessageType::Data,
            piece: 1,
            total_size: Some(20000),
            data: b"0123456789".to_vec(),
        };

        let result = MetadataMessage::from_bytes(payload).unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_from_bytes_invalid_type() {
        let payload = b"d8:msg_typei7e5:piecei0ee";

        let result = MetadataMessage::from_bytes(payload);

        assert!(result.is_err(), "expected the message type to be rejected");
    }

    #[test]
    fn test_data_last_piece() {
        let metadata = vec![7u8; METADATA_PIECE_SIZE + 100];

        let result = MetadataMessage::data(1, &metadata).unwrap();
        assert_eq!(100, result.data.len());
        assert_eq!(Some(metadata.len()), result.total_size);

        let result = MetadataMessage::data(2, &metadata);
        assert_eq!(None, result, "expected no data beyond the metadata size");
    }

    #[test]
    fn test_data_piece_overflow() {
        let metadata = vec![7u8; 100];

        let result = MetadataMessage::data(1usize << 60, &metadata);

        assert_eq!(None, result);
    }

    #[test]
    fn test_extension_handle_data() {
        let extension = MetadataExtension::new();
        let payload = MetadataMessage::data(0, b"d4:name3:fooe")
            .unwrap()
            .to_bytes()
            .unwrap();

        let result = extension.handle(&payload).unwrap();

        assert_eq!(
            vec![PeerEvent::MetadataPiece {
                piece: 0,
                total_size: 13,
                data: b"d4:name3:fooe".to_vec(),
            }],
            result
        );
    }

    #[test]
    fn test_extension_on_handshake() {
        let extension = MetadataExtension::new();
        let handshake = ExtendedHandshake {
            metadata_size: Some(20000),
            ..Default::default()
        };

        let result = extension.on_handshake(&handshake);

        assert_eq!(vec![PeerEvent::MetadataSize(20000)], result);
    }
}
