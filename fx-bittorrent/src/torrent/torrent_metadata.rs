use crate::torrent::errors::Result;
use crate::torrent::{InfoHash, Magnet, Sha1Hash, TorrentError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use url::Url;

const INFO_KEY: &[u8] = b"info";

/// The file information of a single file within the torrent info dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentFileInfo {
    /// Length of the file in bytes.
    pub length: u64,
    /// Path segments of the file within the torrent.
    /// This is never present in a single file torrent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
    /// The utf-8 representation of the path segments.
    #[serde(
        rename = "path.utf-8",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub path_utf8: Option<Vec<String>>,
}

impl TorrentFileInfo {
    /// Get the path segments of the file, preferring the utf-8 representation.
    /// The segments are empty for a single file torrent.
    pub fn path_segments(&self) -> Vec<String> {
        self.path_utf8
            .clone()
            .or_else(|| self.path.clone())
            .unwrap_or_default()
    }
}

/// The file layout of the torrent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TorrentFiles {
    Multiple {
        /// The files within the torrent directory.
        files: Vec<TorrentFileInfo>,
    },
    Single {
        #[serde(flatten)]
        file: TorrentFileInfo,
    },
}

/// The info dictionary of a torrent.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct TorrentMetadataInfo {
    /// Length of each piece in bytes.
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    /// The concatenated 20-byte SHA1 hashes of each piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    /// The name of the file, or of the directory for a multi file torrent.
    pub name: String,
    #[serde(
        rename = "name.utf-8",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub name_utf8: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private: Option<i64>,
    #[serde(flatten)]
    pub files: TorrentFiles,
}

impl TorrentMetadataInfo {
    /// Try to parse the given bencoded info dictionary.
    ///
    /// # Returns
    ///
    /// It returns the parsed info dictionary together with the info hash over the canonical
    /// bencoded form of the dictionary.
    pub fn try_from_bytes(bytes: &[u8]) -> Result<(Self, InfoHash)> {
        let value = serde_bencode::from_bytes::<Value>(bytes)?;
        let info_hash = InfoHash::from_metadata(serde_bencode::to_bytes(&value)?);
        let info = serde_bencode::from_bytes::<Self>(bytes)?;

        info.validate()?;
        Ok((info, info_hash))
    }

    /// Get the name of the torrent, preferring the utf-8 representation.
    pub fn name(&self) -> String {
        self.name_utf8.clone().unwrap_or(self.name.clone())
    }

    /// Get the expected SHA1 hash of each piece.
    pub fn sha1_pieces(&self) -> Vec<Sha1Hash> {
        self.pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// Get the total length of all files in bytes.
    pub fn len(&self) -> usize {
        match &self.files {
            TorrentFiles::Single { file } => file.length as usize,
            TorrentFiles::Multiple { files } => files.iter().map(|e| e.length as usize).sum(),
        }
    }

    /// Check if the torrent doesn't contain any data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the number of pieces of the torrent.
    pub fn total_pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Get the files of the torrent, in info dictionary order.
    pub fn files(&self) -> Vec<TorrentFileInfo> {
        match &self.files {
            TorrentFiles::Single { file } => vec![file.clone()],
            TorrentFiles::Multiple { files } => files.clone(),
        }
    }

    /// Get the relative path of the given file within the torrent.
    /// A single file torrent stores the file under its name, a multi file torrent stores the
    /// files within a directory with the torrent name.
    pub fn path(&self, file: &TorrentFileInfo) -> PathBuf {
        let mut path = PathBuf::from(self.name());
        for segment in file.path_segments() {
            path.push(segment);
        }
        path
    }

    /// Verify that the pieces of the info dictionary match the file layout.
    fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::InvalidMetadata(
                "piece length must be larger than 0".to_string(),
            ));
        }
        if self.pieces.len() % 20 != 0 {
            return Err(TorrentError::InvalidMetadata(format!(
                "pieces length {} is not a multiple of 20",
                self.pieces.len()
            )));
        }

        let piece_length = self.piece_length as usize;
        let expected_pieces = self.len().div_ceil(piece_length);
        if expected_pieces != self.total_pieces() {
            return Err(TorrentError::InvalidMetadata(format!(
                "expected {} pieces, but got {} instead",
                expected_pieces,
                self.total_pieces()
            )));
        }

        Ok(())
    }
}

impl Debug for TorrentMetadataInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentMetadataInfo")
            .field("piece_length", &self.piece_length)
            .field("pieces", &self.total_pieces())
            .field("name", &self.name)
            .field("files", &self.files)
            .finish()
    }
}

/// The metadata of a torrent, parsed from a `.torrent` descriptor or created from a magnet link.
///
/// The `info` dictionary is unknown for magnet links until it has been retrieved from the swarm
/// through the metadata extension.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TorrentMetadata {
    #[serde(skip)]
    name: Option<String>,
    /// The primary tracker url of the torrent.
    pub announce: Option<String>,
    /// The tiers of tracker urls of the torrent.
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    #[serde(rename = "created by")]
    pub created_by: Option<String>,
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,
    pub info: Option<TorrentMetadataInfo>,
    /// The canonical bencoded bytes of the info dictionary.
    #[serde(skip)]
    info_bytes: Option<Vec<u8>>,
    #[serde(skip)]
    pub info_hash: InfoHash,
}

impl TorrentMetadata {
    /// Get the display name of the torrent if known.
    pub fn name(&self) -> Option<String> {
        self.info
            .as_ref()
            .map(|e| e.name())
            .or_else(|| self.name.clone())
            .filter(|e| !e.is_empty())
    }

    /// Get the canonical bencoded info dictionary, if known.
    pub fn info_bytes(&self) -> Option<&[u8]> {
        self.info_bytes.as_deref()
    }

    /// Get the size of the bencoded info dictionary, if known.
    pub fn metadata_size(&self) -> Option<usize> {
        self.info_bytes.as_ref().map(|e| e.len())
    }

    /// Update the info dictionary of the torrent with the given bencoded bytes.
    /// The bytes are only accepted when their info hash matches the torrent.
    pub fn update_info(&mut self, bytes: &[u8]) -> Result<()> {
        let canonical = serde_bencode::to_bytes(&serde_bencode::from_bytes::<Value>(bytes)?)?;
        let (info, info_hash) = TorrentMetadataInfo::try_from_bytes(&canonical)?;

        if info_hash != self.info_hash {
            return Err(TorrentError::InvalidMetadata(format!(
                "info hash {} doesn't match the expected {}",
                info_hash, self.info_hash
            )));
        }

        self.info_bytes = Some(canonical);
        self.info = Some(info);
        Ok(())
    }

    /// Get the tracker urls of the torrent.
    /// The `announce` url comes first, followed by every tier of the `announce-list`.
    /// Duplicate and invalid urls are ignored.
    pub fn trackers(&self) -> Vec<Url> {
        let mut trackers: Vec<Url> = Vec::new();
        let tiers = self.announce_list.iter().flatten().flatten();

        for tracker in self.announce.iter().chain(tiers) {
            match Url::parse(tracker) {
                Ok(url) => {
                    if !trackers.contains(&url) {
                        trackers.push(url);
                    }
                }
                Err(e) => warn!("Failed to parse tracker url {}, {}", tracker, e),
            }
        }

        trackers
    }
}

impl TryFrom<&[u8]> for TorrentMetadata {
    type Error = TorrentError;

    /// Parse the bencoded `.torrent` descriptor.
    /// The info hash is calculated over the raw info value, so unknown info keys are retained.
    fn try_from(value: &[u8]) -> Result<Self> {
        let mut metadata = serde_bencode::from_bytes::<Self>(value)
            .map_err(|e| TorrentError::TorrentParse(e.to_string()))?;
        let info_value = match serde_bencode::from_bytes::<Value>(value)? {
            Value::Dict(mut dict) => dict.remove(INFO_KEY),
            _ => None,
        }
        .ok_or(TorrentError::InvalidMetadata(
            "info dictionary is missing".to_string(),
        ))?;

        let info_bytes = serde_bencode::to_bytes(&info_value)?;
        metadata.info_hash = InfoHash::from_metadata(&info_bytes);
        if let Some(info) = metadata.info.as_ref() {
            info.validate()?;
        }

        debug!("Parsed torrent metadata {}", metadata.info_hash);
        metadata.info_bytes = Some(info_bytes);
        Ok(metadata)
    }
}

impl TryFrom<Magnet> for TorrentMetadata {
    type Error = TorrentError;

    fn try_from(value: Magnet) -> Result<Self> {
        let info_hash = value.info_hash()?;
        let announce_list = if value.trackers().is_empty() {
            None
        } else {
            Some(vec![value.trackers().to_vec()])
        };

        Ok(Self {
            name: value.dn().map(|e| e.to_string()),
            announce: None,
            announce_list,
            comment: None,
            created_by: None,
            creation_date: None,
            info: None,
            info_bytes: None,
            info_hash,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::init_logger;
    use sha1::{Digest, Sha1};
    use std::str::FromStr;

    /// Create the bencoded info dictionary of a single file torrent for the given data.
    pub fn create_info_bytes(name: &str, data: &[u8], piece_length: usize) -> Vec<u8> {
        let pieces: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();
        let info = TorrentMetadataInfo {
            piece_length: piece_length as u64,
            pieces,
            name: name.to_string(),
            name_utf8: None,
            private: None,
            files: TorrentFiles::Single {
                file: TorrentFileInfo {
                    length: data.len() as u64,
                    path: None,
                    path_utf8: None,
                },
            },
        };

        serde_bencode::to_bytes(&info).unwrap()
    }

    /// Create a bencoded `.torrent` descriptor for the given data.
    pub fn create_torrent_bytes(name: &str, data: &[u8], piece_length: usize) -> Vec<u8> {
        let mut bytes = b"d8:announce30:http://localhost:6969/announce4:info".to_vec();
        bytes.extend(create_info_bytes(name, data, piece_length));
        bytes.extend(b"e");
        bytes
    }

    #[test]
    fn test_torrent_metadata_try_from_bytes() {
        init_logger!();
        let data = vec![7u8; 40000];
        let info_bytes = create_info_bytes("foo.txt", &data, 16384);
        let bytes = create_torrent_bytes("foo.txt", &data, 16384);

        let result = TorrentMetadata::try_from(bytes.as_slice()).unwrap();
        let info = result.info.as_ref().unwrap();

        assert_eq!(InfoHash::from_metadata(&info_bytes), result.info_hash);
        assert_eq!(Some("http://localhost:6969/announce".to_string()), result.announce);
        assert_eq!(3, info.total_pieces());
        assert_eq!(40000, info.len());
        assert_eq!(Some(info_bytes.len()), result.metadata_size());
        assert_eq!(Some("foo.txt".to_string()), result.name());
    }

    #[test]
    fn test_torrent_metadata_multiple_files() {
        init_logger!();
        let bytes = b"d4:infod5:filesld6:lengthi10e4:pathl1:a5:b.txteed6:lengthi6e4:pathl5:c.txteee4:name3:dir12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

        let result = TorrentMetadata::try_from(bytes.as_slice()).unwrap();
        let info = result.info.unwrap();
        let files = info.files();

        assert_eq!(2, files.len());
        assert_eq!(16, info.len());
        assert_eq!(PathBuf::from("dir").join("a").join("b.txt"), info.path(&files[0]));
        assert_eq!(PathBuf::from("dir").join("c.txt"), info.path(&files[1]));
    }

    #[test]
    fn test_torrent_metadata_invalid_pieces() {
        init_logger!();
        let bytes = b"d4:infod6:lengthi40e4:name3:foo12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

        let result = TorrentMetadata::try_from(bytes.as_slice());

        assert_eq!(
            Err(TorrentError::InvalidMetadata(
                "expected 3 pieces, but got 1 instead".to_string()
            )),
            result
        );
    }

    #[test]
    fn test_torrent_metadata_trackers() {
        init_logger!();
        let bytes = b"d8:announce21:udp://localhost:6969/13:announce-listll21:udp://localhost:6969/el20:http://localhost/annee4:infod6:lengthi1e4:name1:a12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaaee";

        let metadata = TorrentMetadata::try_from(bytes.as_slice()).unwrap();
        let result = metadata.trackers();

        assert_eq!(
            vec![
                Url::parse("udp://localhost:6969/").unwrap(),
                Url::parse("http://localhost/ann").unwrap()
            ],
            result
        );
    }

    #[test]
    fn test_torrent_metadata_from_magnet() {
        init_logger!();
        let data = vec![3u8; 100];
        let info_bytes = create_info_bytes("bar", &data, 64);
        let info_hash = InfoHash::from_metadata(&info_bytes);
        let magnet = Magnet::from_str(
            format!("magnet:?xt=urn:btih:{}&dn=bar&tr=udp%3A%2F%2Flocalhost%3A6969", info_hash)
                .as_str(),
        )
        .unwrap();

        let mut result = TorrentMetadata::try_from(magnet).unwrap();
        assert_eq!(info_hash, result.info_hash);
        assert_eq!(None, result.info);
        assert_eq!(1, result.trackers().len());

        result.update_info(&info_bytes).unwrap();
        assert_eq!(2, result.info.as_ref().unwrap().total_pieces());
        assert_eq!(Some(info_bytes.as_slice()), result.info_bytes());
    }

    #[test]
    fn test_torrent_metadata_update_info_mismatch() {
        init_logger!();
        let info_bytes = create_info_bytes("bar", &[1u8; 10], 64);
        let magnet = Magnet::from_str(
            "magnet:?xt=urn:btih:EADAF0EFEA39406914414D359E0EA16416409BD7&tr=udp%3A%2F%2Flocalhost%3A6969",
        )
        .unwrap();
        let mut metadata = TorrentMetadata::try_from(magnet).unwrap();

        let result = metadata.update_info(&info_bytes);

        assert!(
            matches!(result, Err(TorrentError::InvalidMetadata(_))),
            "expected an invalid metadata error, got {:?}",
            result
        );
        assert_eq!(None, metadata.info);
    }
}
