use crate::torrent::peer::{Error, Result};
use std::fmt::{Debug, Display, Formatter};

/// The Azureus-style client prefix of generated peer ids.
const PEER_ID_PREFIX: &[u8; 8] = b"-FX0001-";
const PEER_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// The unique 20-byte identifier of a peer client.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Generate a new random peer id for this client.
    pub fn new() -> Self {
        let mut value = [0u8; 20];
        value[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);

        for byte in value.iter_mut().skip(PEER_ID_PREFIX.len()) {
            *byte = PEER_ID_ALPHABET[rand::random_range(0..PEER_ID_ALPHABET.len())];
        }

        Self(value)
    }

    /// Get the raw bytes of the peer id.
    pub fn value(&self) -> [u8; 20] {
        self.0
    }

    /// Get the client name and version of an Azureus-style peer id, e.g. `-FX0001-`.
    pub fn client(&self) -> Option<String> {
        if self.0[0] != b'-' || self.0[7] != b'-' {
            return None;
        }

        std::str::from_utf8(&self.0[1..7])
            .ok()
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| e.to_string())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; 20] = value.try_into().map_err(|_| Error::InvalidPeerId)?;
        Ok(Self(bytes))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_new() {
        let result = PeerId::new();

        assert_eq!(PEER_ID_PREFIX, &result.value()[..8]);
        assert!(
            result.value()[8..].iter().all(|e| e.is_ascii_alphanumeric()),
            "expected the peer id suffix to be alphanumeric"
        );
        assert_ne!(result, PeerId::new(), "expected a unique peer id");
    }

    #[test]
    fn test_peer_id_client() {
        let peer_id = PeerId::new();
        assert_eq!(Some("FX0001".to_string()), peer_id.client());

        let peer_id = PeerId::try_from([b'M'; 20].as_slice()).unwrap();
        assert_eq!(None, peer_id.client());
    }

    #[test]
    fn test_peer_id_try_from_invalid_length() {
        let result = PeerId::try_from(b"-FX0001-abc".as_slice());

        assert_eq!(Err(Error::InvalidPeerId), result);
    }
}
