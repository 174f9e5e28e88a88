//! Synthetic stand-ins for address translation and slice measurement.
//!
//! These let an entire inference run happen without privileges or hardware
//! support: [`SyntheticTranslation`] assigns made-up physical frames to the
//! pages of a real [`Arena`], and [`SyntheticOracle`] reports the slice that
//! some [`SliceFunction`] assigns to the resulting physical address.

use std::collections::HashSet;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::arena::Arena;
use crate::model::{ SliceFunction, SliceId };
use crate::oracle::{ SliceOracle, Translate };
use crate::{ Error, Result };

/// Maps each (synthetic) page of an arena onto a physical frame.
///
/// Pages are `1 << page_bits` bytes, counted from the base of the arena.
pub struct SyntheticTranslation {
    base: usize,
    len: usize,
    page_bits: usize,
    frames: Vec<usize>,
}
impl SyntheticTranslation {
    /// Use the given frame numbers for consecutive pages of the arena.
    pub fn from_frames(arena: &Arena, page_bits: usize, frames: Vec<usize>)
        -> Self
    {
        assert!(frames.len() >= arena.len().div_ceil(1 << page_bits));
        Self { base: arena.base(), len: arena.len(), page_bits, frames }
    }

    /// Physically contiguous memory starting at `phys_base`.
    pub fn contiguous(arena: &Arena, page_bits: usize, phys_base: usize)
        -> Self
    {
        let first = phys_base >> page_bits;
        let num_pages = arena.len().div_ceil(1 << page_bits);
        Self::from_frames(arena, page_bits, (first..first + num_pages).collect())
    }

    /// Randomly scattered frames below `1 << addr_bits`. For every bit from
    /// `page_bits` up to `addr_bits`, up to `per_bit` pairs of frames which
    /// only differ in that bit are included (as long as the arena has room
    /// for them).
    pub fn with_adjacent_frames(arena: &Arena, page_bits: usize,
        addr_bits: usize, per_bit: usize, rng: &mut impl Rng) -> Self
    {
        let num_pages = arena.len().div_ceil(1 << page_bits);
        let frame_bits = addr_bits - page_bits;
        let mut used = HashSet::new();
        let mut frames = Vec::with_capacity(num_pages);

        'planted: for _ in 0..per_bit {
            for bit in 0..frame_bits {
                if frames.len() + 2 > num_pages {
                    break 'planted;
                }
                loop {
                    let x = rng.gen_range(0..(1usize << frame_bits)) & !(1 << bit);
                    let y = x | (1 << bit);
                    if !used.contains(&x) && !used.contains(&y) {
                        used.insert(x);
                        used.insert(y);
                        frames.extend([x, y]);
                        break;
                    }
                }
            }
        }
        while frames.len() < num_pages {
            let x = rng.gen_range(0..(1usize << frame_bits));
            if used.insert(x) {
                frames.push(x);
            }
        }
        frames.shuffle(rng);
        Self::from_frames(arena, page_bits, frames)
    }

    pub fn frames(&self) -> &[usize] { &self.frames }
}

impl Translate for SyntheticTranslation {
    fn translate(&self, vaddr: usize) -> Result<usize> {
        if vaddr < self.base || vaddr >= self.base + self.len {
            return Err(Error::Translation {
                vaddr, reason: "address outside of the arena"
            });
        }
        let offset = vaddr - self.base;
        let frame = self.frames[offset >> self.page_bits];
        Ok((frame << self.page_bits) | (offset & ((1 << self.page_bits) - 1)))
    }
}

/// Reports the slice chosen by a [`SliceFunction`].
///
/// Optionally, a fixed fraction of physical addresses are reported as
/// inconclusive. Which addresses are affected only depends on the address
/// (and the seed), so repeated measurements agree.
pub struct SyntheticOracle<F: SliceFunction, T: Translate> {
    func: F,
    translator: T,
    unknown_rate: f64,
    seed: u64,
    measurements: usize,
}
impl<F: SliceFunction, T: Translate> SyntheticOracle<F, T> {
    pub fn new(func: F, translator: T) -> Self {
        Self { func, translator, unknown_rate: 0.0, seed: 0, measurements: 0 }
    }

    /// Report `rate` (between 0 and 1) of all addresses as inconclusive.
    pub fn unknown_rate(mut self, rate: f64, seed: u64) -> Self {
        self.unknown_rate = rate;
        self.seed = seed;
        self
    }

    /// Number of measurements taken so far.
    pub fn measurements(&self) -> usize { self.measurements }

    fn is_unknown(&self, paddr: usize) -> bool {
        if self.unknown_rate <= 0.0 {
            return false;
        }
        // splitmix64
        let mut z = (paddr as u64 ^ self.seed).wrapping_add(0x9e37_79b9_7f4a_7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        (z as f64 / u64::MAX as f64) < self.unknown_rate
    }
}

impl<F: SliceFunction, T: Translate> SliceOracle for SyntheticOracle<F, T> {
    fn measure(&mut self, arena: &Arena, offset: usize) -> Option<SliceId> {
        self.measurements += 1;
        let vaddr = arena.addr(offset)?;
        let paddr = self.translator.translate(vaddr).ok()?;
        if self.is_unknown(paddr) {
            return None;
        }
        self.func.slice(paddr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::known::SKYLAKE_4C;
    use crate::util::differing_bit;
    use rand::prelude::*;

    #[test]
    fn contiguous() {
        let arena = Arena::acquire(0x10000, false).unwrap();
        let xlat = SyntheticTranslation::contiguous(&arena, 14, 0x4000_0000);
        assert_eq!(xlat.translate(arena.base()).unwrap(), 0x4000_0000);
        assert_eq!(xlat.translate(arena.base() + 0xffff).unwrap(), 0x4000_ffff);
        assert!(xlat.translate(arena.base() + 0x10000).is_err());
    }

    #[test]
    fn adjacent_frames() {
        let mut rng = StdRng::seed_from_u64(4);
        let arena = Arena::acquire(0x40_0000, false).unwrap();
        let xlat = SyntheticTranslation::with_adjacent_frames(&arena, 14, 35,
            2, &mut rng);
        let frames = xlat.frames();
        assert_eq!(frames.len(), 256);
        let unique: HashSet<_> = frames.iter().collect();
        assert_eq!(unique.len(), frames.len());
        assert!(frames.iter().all(|f| (f << 14) < (1 << 35)));
        for bit in 0..21 {
            let count = frames.iter().filter(|x| {
                frames.iter().any(|y| differing_bit(**x, *y) == Some(bit))
            }).count();
            assert!(count >= 4, "bit {}", bit);
        }
    }

    #[test]
    fn oracle() {
        let arena = Arena::acquire(0x10000, false).unwrap();
        let xlat = SyntheticTranslation::contiguous(&arena, 14, 0x1_a708_4000);
        let mut oracle = SyntheticOracle::new(&SKYLAKE_4C, &xlat);
        assert_eq!(oracle.measure(&arena, 0x3000), Some(0));
        assert_eq!(oracle.measure(&arena, 0x10000), None);
        assert_eq!(oracle.measurements(), 2);

        let mut oracle = SyntheticOracle::new(&SKYLAKE_4C, &xlat)
            .unknown_rate(0.25, 7);
        let seq = oracle.measure_sequence(&arena, 0, 1024, 64);
        let unknown = seq.len() - seq.known();
        assert!(unknown > 128 && unknown < 384, "{} unknown", unknown);
        assert_eq!(oracle.measure_sequence(&arena, 0, 1024, 64), seq);
    }
}
