use crate::torrent::peer::extension::errors::Result;
use crate::torrent::peer::{ExtendedHandshake, PeerEvent};
use std::collections::HashMap;
use std::fmt::Debug;

/// The extension unique name
pub type ExtensionName = String;
/// The extension unique identifier
pub type ExtensionNumber = u8;
/// The registry of the known extensions and their identifiers
pub type ExtensionRegistry = HashMap<ExtensionName, ExtensionNumber>;
/// The list type of enabled extensions
pub type Extensions = Vec<Box<dyn Extension>>;

/// A peer extension that is used within the BitTorrent protocol.
/// An extension can only be activated when the remote peer supports **BEP10**.
///
/// Extensions are registered at the [crate::torrent::TorrentManager] level and cloned through
/// [Extension::clone_boxed] for each peer connection.
/// An extension never writes to the peer itself, it translates the received payloads into
/// [PeerEvent]'s which are processed by the owning torrent.
pub trait Extension: Debug + Send + Sync {
    /// Get the unique extension protocol name.
    fn name(&self) -> &str;

    /// Get the local extension number under which the remote peer should send the messages of
    /// this extension.
    fn number(&self) -> ExtensionNumber;

    /// Invoked when the remote peer announced support for this extension within its extended
    /// handshake.
    ///
    /// # Returns
    ///
    /// It returns the events which should be raised for the peer.
    fn on_handshake(&self, handshake: &ExtendedHandshake) -> Vec<PeerEvent>;

    /// Handle the given extension message payload which has been received from the remote peer.
    ///
    /// # Returns
    ///
    /// It returns the events which should be raised for the peer, or an error when the payload
    /// is invalid.
    fn handle(&self, payload: &[u8]) -> Result<Vec<PeerEvent>>;

    /// Clone this extension into a new boxed instance.
    fn clone_boxed(&self) -> Box<dyn Extension>;
}

#[cfg(test)]
pub mod mock {
    use super::*;

    use mockall::mock;

    mock! {
        #[derive(Debug)]
        pub Extension {}

        impl Extension for Extension {
            fn name(&self) -> &str;
            fn number(&self) -> ExtensionNumber;
            fn on_handshake(&self, handshake: &ExtendedHandshake) -> Vec<PeerEvent>;
            fn handle(&self, payload: &[u8]) -> Result<Vec<PeerEvent>>;
            fn clone_boxed(&self) -> Box<dyn Extension>;
        }
    }
}
