/// Fixed-length bit vector; bit `i` set means element `i` is allocated.
///
/// The length is fixed at creation. Indices are bitmap-relative, and only
/// checked against the total length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
}

impl Bitmap {
    pub fn new(bytes_len: usize) -> Self {
        Self {
            bits: vec![0u8; bytes_len],
        }
    }

    /// Wrap bytes loaded from disk.
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    pub fn bits_len(&self) -> usize {
        self.bits.len() * 8
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn test(&self, bit_idx: usize) -> bool {
        self.bits[bit_idx / 8] & (1 << (bit_idx % 8)) != 0
    }

    pub fn set(&mut self, bit_idx: usize, value: bool) {
        let mask = 1 << (bit_idx % 8);
        if value {
            self.bits[bit_idx / 8] |= mask;
        } else {
            self.bits[bit_idx / 8] &= !mask;
        }
    }

    /// Start of the first run of `cnt` free bits, or `None`.
    /// Whole bytes are skipped while full; the run never wraps past the end.
    pub fn scan(&self, cnt: usize) -> Option<usize> {
        if cnt == 0 {
            return None;
        }
        let byte_idx = self.bits.iter().position(|&byte| byte != 0xff)?;
        let start = byte_idx * 8 + (!self.bits[byte_idx]).trailing_zeros() as usize;
        if cnt == 1 {
            return Some(start);
        }

        let mut run = 0;
        for bit_idx in start..self.bits_len() {
            if self.test(bit_idx) {
                run = 0;
                continue;
            }
            run += 1;
            if run == cnt {
                return Some(bit_idx + 1 - cnt);
            }
        }
        None
    }

    pub fn count_free(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_zeros() as usize).sum()
    }
}
