
pub mod pagemap;

/// If `a` and `b` differ in exactly one bit, return the index of that bit.
pub fn differing_bit(a: usize, b: usize) -> Option<usize> {
    let c = a ^ b;
    if c != 0 && c.is_power_of_two() {
        Some(c.trailing_zeros() as usize)
    } else {
        None
    }
}

/// Returns true if bit `k` is set in `value`.
pub const fn bit_set(value: usize, k: usize) -> bool {
    (value >> k) & 1 != 0
}

/// Parity of the bits in `value` (ie. popcount mod 2).
pub const fn parity(value: usize) -> usize {
    (value.count_ones() & 1) as usize
}

/// Number of bits needed to represent every value in `0..=max`.
pub const fn bits_for(max: usize) -> usize {
    (usize::BITS - max.leading_zeros()) as usize
}

/// A power-of-two alignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Align(pub usize);
impl Align {
    pub const fn from_value(value: usize) -> Self {
        assert!(value.is_power_of_two());
        Self(value)
    }
    pub const fn from_bit(bit: usize) -> Self {
        assert!(bit <= 63);
        Self(1 << bit)
    }
    pub const fn offset_mask(&self) -> usize { self.0 - 1 }
    pub const fn index_mask(&self) -> usize { !self.offset_mask() }
    pub const fn value(&self) -> usize { self.0 }
    pub const fn align_down(&self, value: usize) -> usize {
        value & self.index_mask()
    }
}
