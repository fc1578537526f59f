pub use disk::*;
pub use errors::*;
pub use memory::*;
pub use storage::*;

mod disk;
mod errors;
mod memory;
mod storage;
