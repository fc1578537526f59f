use crate::torrent::errors::{Result, TorrentError};
use bit_vec::BitVec;
use std::fmt::{Debug, Formatter};

/// A compact, growable bit-vector of piece availability.
///
/// Bits are stored MSB first within each byte, which matches the BitTorrent wire format.
/// Bit `i` lives in byte `i >> 3` at bit position `7 - (i & 7)`.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec,
}

impl Bitfield {
    /// Create a new bitfield of `len` bits, all unset.
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::from_elem(len, false),
        }
    }

    /// Create a bitfield of `len` bits from the given wire bytes.
    /// Missing bytes are treated as zero and any spare trailing bits are dropped.
    pub fn create(len: usize, wire: &[u8]) -> Self {
        let mut bits = BitVec::from_bytes(wire);

        if bits.len() < len {
            bits.grow(len - bits.len(), false);
        } else {
            bits.truncate(len);
        }

        Self { bits }
    }

    /// Get the number of bits within the bitfield.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Check if the bitfield doesn't contain any bits.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Get the value of bit `index`.
    ///
    /// # Returns
    ///
    /// It returns an error when the index is beyond the length of the bitfield.
    pub fn get(&self, index: usize) -> Result<bool> {
        self.bits
            .get(index)
            .ok_or(TorrentError::OutOfRange(index, self.bits.len()))
    }

    /// Check if the bit at `index` is set.
    /// Out-of-range indexes are reported as unset.
    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(false)
    }

    /// Set the value of bit `index`, growing the bitfield when needed.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.bits.len() {
            self.bits.grow(index + 1 - self.bits.len(), false);
        }

        self.bits.set(index, value);
    }

    /// Get the number of set bits.
    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|e| *e).count()
    }

    /// Check if every bit within the bitfield is set.
    pub fn all(&self) -> bool {
        self.bits.all()
    }

    /// Iterate over the indexes of the set bits.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, bit)| *bit)
            .map(|(index, _)| index)
    }

    /// Get the wire representation of the bitfield, which is `ceil(len / 8)` bytes.
    pub fn to_wire(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    /// Get the bitfield as a boolean array.
    pub fn to_bool_vec(&self) -> Vec<bool> {
        self.bits.iter().collect()
    }
}

impl From<Vec<bool>> for Bitfield {
    fn from(values: Vec<bool>) -> Self {
        Self {
            bits: values.into_iter().collect(),
        }
    }
}

impl Debug for Bitfield {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitfield({}/{})", self.count_ones(), self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_from_wire() {
        let bitfield = Bitfield::create(10, &[0b1010_0000, 0b0100_0000]);

        assert_eq!(10, bitfield.len());
        assert_eq!(Ok(true), bitfield.get(0));
        assert_eq!(Ok(false), bitfield.get(1));
        assert_eq!(Ok(true), bitfield.get(2));
        assert_eq!(Ok(true), bitfield.get(9));
        assert_eq!(3, bitfield.count_ones());
    }

    #[test]
    fn test_create_pads_missing_bytes() {
        let bitfield = Bitfield::create(20, &[0xFF]);

        assert_eq!(20, bitfield.len());
        assert_eq!(8, bitfield.count_ones());
        assert_eq!(Ok(false), bitfield.get(19));
    }

    #[test]
    fn test_get_out_of_range() {
        let bitfield = Bitfield::new(8);

        let result = bitfield.get(8);

        assert_eq!(Err(TorrentError::OutOfRange(8, 8)), result);
    }

    #[test]
    fn test_set_get() {
        let mut bitfield = Bitfield::new(16);

        bitfield.set(3, true);
        bitfield.set(15, true);
        bitfield.set(3, false);

        assert_eq!(Ok(false), bitfield.get(3));
        assert_eq!(Ok(true), bitfield.get(15));
        assert_eq!(vec![15], bitfield.iter_ones().collect::<Vec<_>>());
    }

    #[test]
    fn test_set_grows() {
        let mut bitfield = Bitfield::new(4);

        bitfield.set(12, true);

        assert_eq!(13, bitfield.len());
        assert_eq!(Ok(true), bitfield.get(12));
        assert_eq!(Ok(false), bitfield.get(11));
    }

    #[test]
    fn test_to_wire_msb_first() {
        let mut bitfield = Bitfield::new(9);
        bitfield.set(0, true);
        bitfield.set(7, true);
        bitfield.set(8, true);

        let result = bitfield.to_wire();

        assert_eq!(vec![0b1000_0001, 0b1000_0000], result);
    }

    #[test]
    fn test_wire_round_trip() {
        let values = vec![true, false, false, true, true, false, true, false, true, true, false];
        let bitfield = Bitfield::from(values.clone());

        let result = Bitfield::create(values.len(), &bitfield.to_wire());

        assert_eq!(values, result.to_bool_vec());
    }
}
