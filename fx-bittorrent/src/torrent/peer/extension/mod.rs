pub use errors::*;
pub use extension::*;

mod errors;
mod extension;
pub mod metadata;
