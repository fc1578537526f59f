use crate::torrent::errors::{MagnetError, MagnetResult};
use crate::torrent::{InfoHash, TorrentError, V1_HASH_IDENTIFIER};
use log::{trace, warn};
use std::str::FromStr;
use url::Url;

const MAGNET_SCHEME: &str = "magnet";

/// A parsed magnet link.
/// Only the parameters which are relevant for bootstrapping a torrent are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct Magnet {
    exact_topics: Vec<String>,
    display_name: Option<String>,
    exact_length: Option<u64>,
    trackers: Vec<String>,
}

impl Magnet {
    /// Create a new magnet builder.
    pub fn builder() -> MagnetBuilder {
        MagnetBuilder::default()
    }

    /// Gets the 'xt' (exact topic) values of the magnet link.
    pub fn xt(&self) -> Vec<&str> {
        self.exact_topics.iter().map(|e| e.as_str()).collect()
    }

    /// Gets the 'dn' (display name) value of the magnet link, if present.
    pub fn dn(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Gets the 'xl' (exact length) value of the magnet link, if present.
    pub fn xl(&self) -> Option<u64> {
        self.exact_length
    }

    /// Gets the 'tr' tracker values of the magnet link.
    pub fn trackers(&self) -> &[String] {
        self.trackers.as_slice()
    }

    /// Get the v1 info hash of the magnet link.
    /// This is the first exact topic which uses the `urn:btih:` namespace.
    pub fn info_hash(&self) -> Result<InfoHash, TorrentError> {
        let prefix = format!("urn:{}:", V1_HASH_IDENTIFIER);

        self.exact_topics
            .iter()
            .find(|e| e.to_lowercase().starts_with(prefix.as_str()))
            .ok_or_else(|| TorrentError::InvalidTopic(self.exact_topics.join(",")))
            .and_then(|topic| InfoHash::from_str(topic.as_str()))
    }
}

impl FromStr for Magnet {
    type Err = MagnetError;

    fn from_str(uri: &str) -> MagnetResult<Self> {
        // some sources html encode the ampersands within the uri
        let uri = uri.replace("&amp;", "&");
        let uri = Url::parse(&uri).map_err(|e| MagnetError::Parse(e.to_string()))?;
        let scheme = uri.scheme();

        if scheme != MAGNET_SCHEME {
            return Err(MagnetError::UnsupportedScheme(scheme.to_string()));
        }

        let mut builder = Magnet::builder();
        for (key, value) in uri.query_pairs() {
            match key.to_lowercase().as_str() {
                "xt" => {
                    builder.exact_topic(value);
                }
                "dn" => {
                    builder.display_name(value);
                }
                "xl" => {
                    builder.exact_length(u64::from_str(value.as_ref()).map_err(|_| {
                        trace!("Magnet value {} is not a valid number", value);
                        MagnetError::InvalidValue(value.to_string())
                    })?);
                }
                "tr" => {
                    builder.tracker(value);
                }
                key => warn!("Unsupported magnet parameter {}", key),
            }
        }

        builder.build()
    }
}

/// A builder for constructing a [Magnet].
#[derive(Debug, Default)]
pub struct MagnetBuilder {
    exact_topics: Vec<String>,
    display_name: Option<String>,
    exact_length: Option<u64>,
    trackers: Vec<String>,
}

impl MagnetBuilder {
    /// Add the given exact topic.
    pub fn exact_topic<S: Into<String>>(&mut self, topic: S) -> &mut Self {
        self.exact_topics.push(topic.into());
        self
    }

    /// Set the display name.
    pub fn display_name<S: Into<String>>(&mut self, name: S) -> &mut Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the exact length of the content.
    pub fn exact_length(&mut self, length: u64) -> &mut Self {
        self.exact_length = Some(length);
        self
    }

    /// Add the given tracker url.
    pub fn tracker<S: Into<String>>(&mut self, tracker: S) -> &mut Self {
        self.trackers.push(tracker.into());
        self
    }

    /// Build the magnet link.
    ///
    /// # Returns
    ///
    /// It returns [MagnetError::InvalidUri] when no exact topic has been set.
    pub fn build(&mut self) -> MagnetResult<Magnet> {
        if self.exact_topics.is_empty() {
            return Err(MagnetError::InvalidUri);
        }

        Ok(Magnet {
            exact_topics: std::mem::take(&mut self.exact_topics),
            display_name: self.display_name.take(),
            exact_length: self.exact_length.take(),
            trackers: std::mem::take(&mut self.trackers),
        })
    }
}
