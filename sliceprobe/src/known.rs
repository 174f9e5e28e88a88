//! Published slice functions for specific parts.

use crate::model::*;
use crate::util::parity;

/// A slice function described by mask words and an optional master
/// sequence, along with some real observations from the part.
#[derive(Clone, Copy, Debug)]
pub struct KnownSliceHash {
    pub name: &'static str,
    /// One mask word per output bit of the reduced ID.
    pub masks: &'static [usize],
    /// Only present on parts without a power-of-two slice count.
    pub master: Option<&'static [SliceId]>,
    pub num_slices: usize,
    pub seq_len: usize,
    pub line_bits: usize,
    pub addr_bits: usize,
    /// Measured `(paddr, slice)` pairs.
    pub observations: &'static [(usize, SliceId)],
}

impl KnownSliceHash {
    pub fn reduction_map(&self) -> ReductionMap {
        ReductionMap::from_masks(self.masks, self.addr_bits)
    }

    pub fn master_sequence(&self) -> Option<MasterSequence> {
        self.master.map(|m| MasterSequence::from_entries(m, self.line_bits))
    }

    fn reduce(&self, paddr: usize) -> Option<usize> {
        if (paddr >> self.addr_bits) != 0 {
            return None;
        }
        Some(self.masks.iter().enumerate().fold(0, |acc, (i, mask)| {
            acc | (parity(paddr & mask) << i)
        }))
    }
}

impl SliceFunction for KnownSliceHash {
    fn slice(&self, paddr: usize) -> Option<SliceId> {
        let id = self.reduce(paddr)?;
        match self.master {
            Some(master) => {
                let offset = (paddr % (self.seq_len << self.line_bits))
                    >> self.line_bits;
                master.get(offset ^ id).copied()
            },
            None => SliceId::try_from(id).ok(),
        }
    }
}

/// Intel Core i7-6700K (Skylake, 4 slices).
pub const SKYLAKE_4C: KnownSliceHash = KnownSliceHash {
    name: "i7-6700K",
    masks: &[
        0x0000_0003_5f57_5440,
        0x0000_0006_b5fa_a880,
    ],
    master: None,
    num_slices: 4,
    seq_len: 128,
    line_bits: 6,
    addr_bits: 35,
    observations: &[
        (0x1_a708_7000, 0), (0x1_5889_f000, 3), (0x1_8182_b000, 0),
        (0x1_5f3d_5000, 0), (0x1_53ce_5000, 0), (0x2_1497_0000, 1),
        (0x1_e9ab_5000, 2), (0x1_25ae_5000, 3), (0x2_0f0e_e000, 2),
        (0x2_0f2e_d000, 3), (0x2_1c18_7000, 1), (0x1_5b4e_2000, 1),
        (0x1_0c36_d000, 2), (0x1_e939_4000, 1), (0x1_e8bc_3000, 2),
        (0x1_6a92_4000, 1),
    ],
};

/// Intel Core i7-9850H (Coffee Lake, 6 slices).
pub const COFFEELAKE_6C: KnownSliceHash = KnownSliceHash {
    name: "i7-9850H",
    masks: &[
        0x0000_0001_ae7b_e000,
        0x0000_0003_5cf7_c000,
        0x0000_0003_1794_6000,
        0x0000_0002_2f28_c000,
        0x0000_0000_5e51_8000,
        0x0000_0000_bca3_0000,
        0x0000_0000_d73d_e000,
    ],
    master: Some(&[
        0, 1, 2, 3, 1, 4, 3, 4, 1, 0, 3, 2, 0, 5, 2, 5,
        1, 0, 3, 2, 0, 5, 2, 5, 0, 5, 2, 5, 1, 4, 3, 4,
        0, 1, 2, 3, 5, 0, 5, 2, 5, 0, 5, 2, 4, 1, 4, 3,
        1, 0, 3, 2, 4, 1, 4, 3, 4, 1, 4, 3, 5, 0, 5, 2,
        2, 3, 0, 1, 5, 2, 5, 0, 3, 2, 1, 0, 4, 3, 4, 1,
        3, 2, 1, 0, 4, 3, 4, 1, 4, 3, 4, 1, 5, 2, 5, 0,
        2, 3, 0, 1, 3, 4, 1, 4, 3, 4, 1, 4, 2, 5, 0, 5,
        3, 2, 1, 0, 2, 5, 0, 5, 2, 5, 0, 5, 3, 4, 1, 4,
    ]),
    num_slices: 6,
    seq_len: 128,
    line_bits: 6,
    addr_bits: 35,
    observations: &[
        (0x2_7db0_d6b6, 0), (0x2_a2a8_cf87, 1), (0x3_40af_c41b, 3),
        (0x1_50e1_c464, 2), (0x1_5372_3bf5, 0), (0x0_7416_9861, 0),
        (0x2_5219_56ab, 5), (0x0_0fbb_e41c, 5), (0x2_62ba_15e7, 5),
        (0x3_a0dd_6690, 1), (0x0_19fb_5c5b, 3), (0x2_c47e_5490, 5),
        (0x0_0fe4_be1e, 2), (0x1_f9bb_b7e5, 5), (0x2_d716_8302, 2),
        (0x2_2bc5_c7a8, 4),
    ],
};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn observations() {
        for hash in [&SKYLAKE_4C, &COFFEELAKE_6C] {
            for (paddr, slice) in hash.observations {
                assert_eq!(hash.slice(*paddr), Some(*slice),
                    "{}: {:#x}", hash.name, paddr);
            }
        }
    }

    #[test]
    fn master_has_no_period() {
        let master = COFFEELAKE_6C.master.unwrap();
        for i in 1..master.len() {
            assert!((0..master.len()).any(|k| master[k] != master[k ^ i]));
        }
    }

    #[test]
    fn slices_in_range() {
        for hash in [&SKYLAKE_4C, &COFFEELAKE_6C] {
            for line in 0..0x4000usize {
                let slice = hash.slice(0x8765_4000 + (line << 6)).unwrap();
                assert!((slice as usize) < hash.num_slices);
            }
        }
    }
}
