//! # Peer Bitfield
//!
//! A compact record of the pieces a remote peer advertises.
//!
//! ```text
//! Byte 0: [piece 0, 1, 2, 3, 4, 5, 6, 7]   (MSB first)
//! Byte 1: [piece 8, 9, 10, 11, 12, 13, 14, 15]
//! ...
//! ```
//!
//! Peers only ever gain pieces during a session, so there is no way to clear
//! a bit once it is set.

/// Set of piece indices a peer claims to have.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl Bitfield {
    /// Build an empty bitfield.
    pub fn new() -> Self {
        Default::default()
    }

    /// Raw bytes, as sent in a BITFIELD message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Returns `true` if the peer has the piece.
    ///
    /// Indices past the end of the stored bytes are reported as missing.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.bits.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Mark a piece as available.
    ///
    /// A HAVE can name a piece beyond a short (or absent) BITFIELD, so the
    /// storage grows to fit the index. Callers bound `index` by the torrent's
    /// piece count first.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if byte_index >= self.bits.len() {
            self.bits.resize(byte_index + 1, 0);
        }

        self.bits[byte_index] |= 1 << (7 - offset);
    }

    /// Number of pieces advertised.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Self {
        Bitfield { bits }
    }
}
