pub use errors::*;
pub use manager::*;
pub use tracker::*;

mod errors;
mod http;
mod manager;
mod tracker;
mod udp;
