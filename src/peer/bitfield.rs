/// A peer's per-piece availability, one slot per piece of the torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<bool>,
}

impl Bitfield {
    /// An empty view sized to `num_pieces`.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![false; num_pieces],
        }
    }

    /// Unpack a wire bitfield most-significant-bit first.
    ///
    /// Unpacking stops once `num_pieces` slots are filled; spare trailing
    /// bits and bytes are ignored.
    pub fn from_packed(packed: &[u8], num_pieces: usize) -> Self {
        let bits = packed
            .iter()
            .flat_map(|byte| (0..8).rev().map(move |shift| (byte >> shift) & 1 == 1))
            .chain(std::iter::repeat(false))
            .take(num_pieces)
            .collect();

        Self { bits }
    }

    /// Record that the peer has `index`; out-of-range indices are rejected.
    pub fn set(&mut self, index: usize) -> bool {
        match self.bits.get_mut(index) {
            Some(bit) => {
                *bit = true;
                true
            }
            None => false,
        }
    }

    pub fn has(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn count(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Pack back into wire format, padding the last byte with zeros.
    pub fn to_packed(&self) -> Vec<u8> {
        self.bits
            .chunks(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .enumerate()
                    .filter(|(_, &bit)| bit)
                    .fold(0u8, |byte, (i, _)| byte | (0x80 >> i))
            })
            .collect()
    }
}
