use bytes::Bytes;

/// Bit-per-piece ownership record.
///
/// Bits are numbered from the high bit of the first byte. The record only
/// grows: bits are set or merged in, never cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield from raw wire bytes, padding or truncating to `piece_count`.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bitfield = Self { bits, piece_count };
        bitfield.clear_spare_bits();
        bitfield
    }

    /// Creates a bitfield sized to cover every bit of a wire payload.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            bits: payload.to_vec(),
            piece_count: payload.len() * 8,
        }
    }

    pub fn full(piece_count: usize) -> Self {
        let mut bitfield = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bitfield.clear_spare_bits();
        bitfield
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        (self.bits[byte_index] >> bit_index) & 1 == 1
    }

    /// Sets the bit for `index`. Out of range indices are ignored.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.piece_count || self.has(index) {
            return false;
        }
        let byte_index = index / 8;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
        true
    }

    /// ORs `other` into this bitfield and returns the indices that were newly set.
    pub fn merge(&mut self, other: &Bitfield) -> Vec<usize> {
        let mut added = Vec::new();
        for index in 0..self.piece_count.min(other.piece_count) {
            if other.has(index) && self.set(index) {
                added.push(index);
            }
        }
        added
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 && spare < 8 {
            if let Some(last) = self.bits.last_mut() {
                *last &= 0xFFu8 << spare;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bitfield = Bitfield::new(10);
        assert!(bitfield.set(0));
        assert!(bitfield.set(9));
        assert!(!bitfield.set(9));
        assert!(!bitfield.set(10));

        assert!(bitfield.has(0));
        assert!(bitfield.has(9));
        assert!(!bitfield.has(1));
        assert_eq!(bitfield.count(), 2);
        assert_eq!(bitfield.as_bytes(), &[0x80, 0x40]);
    }

    #[test]
    fn test_from_bytes_clears_spare_bits() {
        let bitfield = Bitfield::from_bytes(&[0xFF, 0xFF], 12);
        assert_eq!(bitfield.count(), 12);
        assert_eq!(bitfield.as_bytes(), &[0xFF, 0xF0]);

        let short = Bitfield::from_bytes(&[0x20], 16);
        assert!(short.has(2));
        assert_eq!(short.as_bytes().len(), 2);
    }

    #[test]
    fn test_payload_covers_every_bit() {
        let bitfield = Bitfield::from_payload(&[0u8; 20]);
        assert_eq!(bitfield.len(), 160);
        assert!(bitfield.is_empty());
    }

    #[test]
    fn test_merge_never_clears() {
        let mut ours = Bitfield::new(8);
        ours.set(1);

        let mut theirs = Bitfield::new(8);
        theirs.set(3);

        let added = ours.merge(&theirs);
        assert_eq!(added, vec![3]);
        assert!(ours.has(1));
        assert!(ours.has(3));
    }

    #[test]
    fn test_full() {
        let bitfield = Bitfield::full(9);
        assert!(bitfield.is_complete());
        assert_eq!(bitfield.as_bytes(), &[0xFF, 0x80]);
    }
}
