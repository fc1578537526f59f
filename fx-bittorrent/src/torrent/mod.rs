pub use bitfield::*;
pub use compact::*;
pub use errors::*;
pub use file::*;
pub use info_hash::*;
pub use magnet::*;
pub use magnet_loader::*;
pub use manager::*;
pub use piece::*;
pub use piece_store::*;
use std::ops::Range;
pub use swarm::*;
pub use torrent::*;
pub use torrent_config::*;
pub use torrent_metadata::*;

mod bitfield;
mod compact;
mod errors;
mod file;
mod info_hash;
mod magnet;
mod magnet_loader;
mod manager;
pub mod peer;
mod piece;
mod piece_store;
pub mod storage;
mod swarm;
mod torrent;
mod torrent_config;
mod torrent_metadata;
pub mod tracker;

/// Get the overlapping part of the given ranges.
///
/// # Returns
///
/// It returns [None] when the ranges don't share at least 1 value.
pub(crate) fn overlapping_range(a: Range<usize>, b: &Range<usize>) -> Option<Range<usize>> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);

    if start < end {
        Some(start..end)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_range() {
        assert_eq!(Some(5..10), overlapping_range(0..10, &(5..20)));
        assert_eq!(Some(2..4), overlapping_range(0..10, &(2..4)));
        assert_eq!(None, overlapping_range(0..10, &(10..20)));
        assert_eq!(None, overlapping_range(5..5, &(0..10)));
    }
}
