pub use connection::*;
pub use errors::*;
pub use listener::*;
pub use peer_id::*;
pub use protocol::*;
pub use stream::*;

mod connection;
mod errors;
pub mod extension;
mod listener;
mod peer_id;
mod protocol;
mod stream;
