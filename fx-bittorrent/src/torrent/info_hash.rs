use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use base32::Alphabet;
use base64::prelude::BASE64_STANDARD_NO_PAD;
use base64::Engine;
use hex::FromHex;
use log::{debug, trace};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::torrent::errors::Result;
use crate::torrent::TorrentError;

pub const V1_HASH_IDENTIFIER: &str = "btih";

/// Represent the v1 hash type of the BitTorrent protocol.
pub type Sha1Hash = [u8; 20];

/// The unique identifier of a torrent.
/// It's the SHA1 digest of the bencoded info dictionary of the torrent metadata.
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(Sha1Hash);

impl InfoHash {
    /// Create a new info hash from the given raw digest.
    pub fn new(hash: Sha1Hash) -> Self {
        Self(hash)
    }

    /// Get the raw 20-byte digest of the info hash.
    pub fn as_bytes(&self) -> &Sha1Hash {
        &self.0
    }

    /// Get the short tag of the info hash which is used to identify a torrent within logs.
    /// This is the base64 representation of the first 5 bytes.
    pub fn tag(&self) -> String {
        BASE64_STANDARD_NO_PAD.encode(&self.0[..5])
    }

    /// Try to parse the given hash bytes into an `InfoHash`.
    /// This is used by peer handshakes, which carry the raw 20-byte digest.
    ///
    /// # Returns
    ///
    /// Returns the info hash if the given bytes are exactly 20 bytes long.
    pub fn try_from_bytes<T>(bytes: T) -> Result<Self>
    where
        T: AsRef<[u8]>,
    {
        let bytes = bytes.as_ref();
        Sha1Hash::try_from(bytes).map(Self).map_err(|_| {
            TorrentError::InvalidInfoHash(format!("expected 20 bytes, got {}", bytes.len()))
        })
    }

    /// Create the info hash from the given bencoded info dictionary bytes.
    pub fn from_metadata<T>(bytes: T) -> Self
    where
        T: AsRef<[u8]>,
    {
        let digest = Sha1::digest(bytes.as_ref());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest[..20]);
        Self(hash)
    }

    /// Try to parse the given topic value into an `InfoHash`.
    /// The following formats are supported:
    /// * 40 characters hex encoded
    /// * 32 characters base32 encoded
    fn try_from_value(value: &str) -> Result<Self> {
        trace!("Trying to parse info hash from {}", value);
        let topic_bytes = match value.len() {
            40 => Vec::from_hex(value).map_err(|e| {
                debug!("Failed to parse info hash hex, {}", e);
                TorrentError::InvalidInfoHash("invalid hex value".to_string())
            })?,
            32 => base32::decode(Alphabet::Rfc4648 { padding: false }, &value.to_uppercase())
                .ok_or(TorrentError::InvalidInfoHash(
                    "invalid base32 value".to_string(),
                ))?,
            len => {
                return Err(TorrentError::InvalidInfoHash(format!(
                    "expected 40 hex or 32 base32 characters, got {}",
                    len
                )))
            }
        };

        Self::try_from_bytes(topic_bytes)
    }
}

impl Serialize for InfoHash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::try_from_bytes(bytes.as_ref()).map_err(serde::de::Error::custom)
    }
}

impl Debug for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InfoHash").field(&hex::encode(self.0)).finish()
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for InfoHash {
    type Err = TorrentError;

    /// Parses an `InfoHash` from a string representation.
    /// The expected format is `urn:btih:<info_hash>` or the `<info_hash>` value without any additions.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::str::FromStr;
    /// use fx_bittorrent::torrent::InfoHash;
    ///
    /// let info_hash = InfoHash::from_str("urn:btih:EADAF0EFEA39406914414D359E0EA16416409BD7").unwrap();
    /// let info_hash = InfoHash::from_str("EADAF0EFEA39406914414D359E0EA16416409BD7").unwrap();
    /// ```
    fn from_str(value: &str) -> Result<Self> {
        let segments: Vec<&str> = value.split(':').collect();

        match segments.as_slice() {
            [value] => Self::try_from_value(value),
            ["urn", identifier, value] if *identifier == V1_HASH_IDENTIFIER => {
                Self::try_from_value(value)
            }
            _ => Err(TorrentError::InvalidTopic(value.to_string())),
        }
    }
}

impl From<Sha1Hash> for InfoHash {
    fn from(hash: Sha1Hash) -> Self {
        Self(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_from_str_hex() {
        let expected_result =
            InfoHash::new(hex!("EADAF0EFEA39406914414D359E0EA16416409BD7"));

        let result = InfoHash::from_str("EADAF0EFEA39406914414D359E0EA16416409BD7").unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_from_str_urn() {
        let expected_result =
            InfoHash::new(hex!("EADAF0EFEA39406914414D359E0EA16416409BD7"));

        let result =
            InfoHash::from_str("urn:btih:eadaf0efea39406914414d359e0ea16416409bd7").unwrap();

        assert_eq!(expected_result, result);
    }

    #[test]
    fn test_from_str_base32() {
        let hash = hex!("EADAF0EFEA39406914414D359E0EA16416409BD7");
        let value = base32::encode(Alphabet::Rfc4648 { padding: false }, &hash);

        let result = InfoHash::from_str(&value).unwrap();

        assert_eq!(InfoHash::new(hash), result);
    }

    #[test]
    fn test_from_str_invalid() {
        let result = InfoHash::from_str("urn:btmh:1234");

        assert_eq!(
            Err(TorrentError::InvalidTopic("urn:btmh:1234".to_string())),
            result
        );
    }

    #[test]
    fn test_display() {
        let info_hash = InfoHash::new(hex!("EADAF0EFEA39406914414D359E0EA16416409BD7"));

        assert_eq!(
            "eadaf0efea39406914414d359e0ea16416409bd7",
            info_hash.to_string()
        );
    }

    #[test]
    fn test_tag() {
        let info_hash = InfoHash::new([0u8; 20]);

        assert_eq!("AAAAAAA", info_hash.tag());
    }

    #[test]
    fn test_from_metadata() {
        let digest = Sha1::digest(b"d4:name3:fooe");
        let mut expected_hash = [0u8; 20];
        expected_hash.copy_from_slice(&digest);

        let result = InfoHash::from_metadata(b"d4:name3:fooe");

        assert_eq!(InfoHash::new(expected_hash), result);
    }
}
