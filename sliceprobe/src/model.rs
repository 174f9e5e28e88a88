//! The recovered address-to-slice function.
//!
//! A slice function is modeled as a linear (XOR) reduction of the physical
//! address bits into an ID, optionally followed by a lookup into a periodic
//! "master sequence" when the number of slices isn't a power of two.

use crate::util::{ bit_set, bits_for, parity };

/// The index of a last-level cache slice.
pub type SliceId = u16;

/// Implemented by anything that can map a physical address onto a slice.
pub trait SliceFunction: Sync {
    /// Returns `None` when the slice can't be determined for `paddr`.
    fn slice(&self, paddr: usize) -> Option<SliceId>;
}

impl<F: SliceFunction + ?Sized> SliceFunction for &F {
    fn slice(&self, paddr: usize) -> Option<SliceId> {
        (**self).slice(paddr)
    }
}

/// Returns `None` if `paddr` has any bit set at or above `addr_bits`.
const fn in_range(paddr: usize, addr_bits: usize) -> bool {
    addr_bits >= usize::BITS as usize || (paddr >> addr_bits) == 0
}

/// The XOR contribution of each physical address bit to the slice ID.
///
/// Bits without any usable sample are "unknown". Unknown bits below
/// `first_bit` contribute nothing when reducing (they're either the offset
/// into a cache line, or absorbed by the master sequence). An address with
/// an unknown bit at or above `first_bit` can't be reduced at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReductionMap {
    values: Vec<Option<u32>>,
    first_bit: usize,
}
impl ReductionMap {
    /// A map where every bit is unknown.
    pub fn new(first_bit: usize, addr_bits: usize) -> Self {
        Self { values: vec![None; addr_bits], first_bit }
    }

    pub fn from_values(values: &[u32]) -> Self {
        Self { values: values.iter().map(|v| Some(*v)).collect(), first_bit: 0 }
    }

    /// Expand a set of mask words (one per output bit) into a map.
    pub fn from_masks(masks: &[usize], addr_bits: usize) -> Self {
        let values = (0..addr_bits).map(|bit| {
            let v = masks.iter().enumerate().fold(0, |acc, (i, mask)| {
                acc | ((bit_set(*mask, bit) as u32) << i)
            });
            Some(v)
        }).collect();
        Self { values, first_bit: 0 }
    }

    pub fn addr_bits(&self) -> usize { self.values.len() }

    /// The lowest bit which must be known for an address to be reduced.
    pub fn first_bit(&self) -> usize { self.first_bit }

    pub fn set(&mut self, bit: usize, value: Option<u32>) {
        self.values[bit] = value;
    }

    /// The value for `bit`, or `None` if it's unknown.
    pub fn value(&self, bit: usize) -> Option<u32> {
        self.values.get(bit).copied().flatten()
    }

    /// The value for `bit`. Unknown bits are reported as 0.
    pub fn get(&self, bit: usize) -> u32 {
        self.value(bit).unwrap_or(0)
    }

    pub fn is_known(&self, bit: usize) -> bool {
        self.value(bit).is_some()
    }

    /// Unknown bits at or above `first_bit`.
    pub fn unknown_bits(&self) -> impl Iterator<Item=usize> + '_ {
        self.values.iter().enumerate()
            .skip(self.first_bit)
            .filter(|(_, v)| v.is_none())
            .map(|(bit, _)| bit)
    }

    /// Mask of all bits reported by [`ReductionMap::unknown_bits`].
    pub fn unknown_mask(&self) -> usize {
        self.unknown_bits().fold(0, |mask, bit| mask | (1 << bit))
    }

    pub fn values(&self) -> &[Option<u32>] { &self.values }

    pub fn max_value(&self) -> u32 {
        self.values.iter().flatten().copied().max().unwrap_or(0)
    }

    /// XOR together the values for every bit set in `paddr`.
    ///
    /// Returns `None` if `paddr` has bits outside the modeled range, or
    /// sets any bit whose contribution is unknown.
    pub fn reduce(&self, paddr: usize) -> Option<u32> {
        if !in_range(paddr, self.addr_bits()) {
            return None;
        }
        if paddr & self.unknown_mask() != 0 {
            return None;
        }
        let id = (0..self.addr_bits())
            .filter(|bit| bit_set(paddr, *bit))
            .fold(0, |acc, bit| acc ^ self.get(bit));
        Some(id)
    }

    /// Convert into the equivalent set of mask words.
    pub fn to_mask(&self) -> ReductionMask {
        let num_masks = bits_for(self.max_value() as usize);
        let masks = (0..num_masks).map(|i| {
            (0..self.addr_bits()).fold(0usize, |mask, bit| {
                let set = (self.get(bit) >> i) & 1 != 0;
                mask | ((set as usize) << bit)
            })
        }).collect();
        ReductionMask {
            masks,
            unknown: self.unknown_mask(),
            addr_bits: self.addr_bits(),
        }
    }
}

/// Bit-parallel form of a [`ReductionMap`].
///
/// Output bit `i` of the ID is the parity of `paddr & masks[i]`. Addresses
/// with any bit in `unknown` set can't be reduced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReductionMask {
    masks: Vec<usize>,
    unknown: usize,
    addr_bits: usize,
}
impl ReductionMask {
    pub fn masks(&self) -> &[usize] { &self.masks }
    pub fn unknown(&self) -> usize { self.unknown }
    pub fn addr_bits(&self) -> usize { self.addr_bits }

    pub fn reduce(&self, paddr: usize) -> Option<u32> {
        if !in_range(paddr, self.addr_bits) || (paddr & self.unknown) != 0 {
            return None;
        }
        let id = self.masks.iter().enumerate().fold(0, |acc, (i, mask)| {
            acc | ((parity(paddr & mask) as u32) << i)
        });
        Some(id)
    }
}

/// The non-linear part of a slice function: a table indexed by
/// `line_offset ^ id`, where `line_offset` is the index of a cache line
/// within one period.
///
/// Entries which couldn't be resolved are `None`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterSequence {
    entries: Vec<Option<SliceId>>,
    line_bits: usize,
}
impl MasterSequence {
    /// A sequence of `seq_len` unresolved entries.
    pub fn new(seq_len: usize, line_bits: usize) -> Self {
        Self { entries: vec![None; seq_len], line_bits }
    }

    pub fn from_entries(entries: &[SliceId], line_bits: usize) -> Self {
        Self {
            entries: entries.iter().map(|e| Some(*e)).collect(),
            line_bits,
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn line_bits(&self) -> usize { self.line_bits }

    /// Size of one period in bytes.
    pub fn period_bytes(&self) -> usize {
        self.entries.len() << self.line_bits
    }

    pub fn get(&self, idx: usize) -> Option<SliceId> {
        self.entries.get(idx).copied().flatten()
    }

    pub fn set(&mut self, idx: usize, value: Option<SliceId>) {
        self.entries[idx] = value;
    }

    pub fn entries(&self) -> &[Option<SliceId>] { &self.entries }

    pub fn unresolved(&self) -> impl Iterator<Item=usize> + '_ {
        self.entries.iter().enumerate()
            .filter(|(_, e)| e.is_none())
            .map(|(idx, _)| idx)
    }

    pub fn is_resolved(&self) -> bool {
        self.entries.iter().all(Option::is_some)
    }

    /// Look up the slice for a physical address whose reduced ID is `id`.
    pub fn lookup(&self, paddr: usize, id: u32) -> Option<SliceId> {
        if self.entries.is_empty() {
            return None;
        }
        let offset = (paddr % self.period_bytes()) >> self.line_bits;
        self.get(offset ^ id as usize)
    }
}

/// Predict the slice for `paddr`.
///
/// Without a master sequence, the reduced ID is the slice. Returns `None`
/// when `paddr` is outside the modeled range, or when the master sequence
/// entry is unresolved.
pub fn predict_slice(paddr: usize, map: &ReductionMap,
    master: Option<&MasterSequence>) -> Option<SliceId>
{
    let id = map.reduce(paddr)?;
    match master {
        Some(master) => master.lookup(paddr, id),
        None => SliceId::try_from(id).ok(),
    }
}

/// A complete recovered slice function.
#[derive(Clone, Debug)]
pub struct SliceModel {
    map: ReductionMap,
    mask: ReductionMask,
    master: Option<MasterSequence>,
}
impl SliceModel {
    pub fn new(map: ReductionMap, master: Option<MasterSequence>) -> Self {
        let mask = map.to_mask();
        Self { map, mask, master }
    }

    pub fn map(&self) -> &ReductionMap { &self.map }
    pub fn mask(&self) -> &ReductionMask { &self.mask }
    pub fn master(&self) -> Option<&MasterSequence> { self.master.as_ref() }

    /// Predict using the per-bit table.
    pub fn predict(&self, paddr: usize) -> Option<SliceId> {
        predict_slice(paddr, &self.map, self.master.as_ref())
    }

    /// Predict using the mask words.
    pub fn predict_with_mask(&self, paddr: usize) -> Option<SliceId> {
        let id = self.mask.reduce(paddr)?;
        match &self.master {
            Some(master) => master.lookup(paddr, id),
            None => SliceId::try_from(id).ok(),
        }
    }
}

impl SliceFunction for SliceModel {
    fn slice(&self, paddr: usize) -> Option<SliceId> {
        self.predict(paddr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::known::{ SKYLAKE_4C, COFFEELAKE_6C };
    use rand::prelude::*;

    #[test]
    fn map_from_masks() {
        let map = SKYLAKE_4C.reduction_map();
        let expected: [u32; 35] = [
            0,0,0,0,0,0,1,2,0,0,1,2,1,2,1,2,1,3,
            1,2,3,2,3,2,3,1,3,1,3,2,1,2,1,3,2
        ];
        assert_eq!(map, ReductionMap::from_values(&expected));
        assert_eq!(map.max_value(), 3);
        assert_eq!(map.to_mask().masks(), SKYLAKE_4C.masks);
    }

    #[test]
    fn map_mask_equivalence() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for hash in [&SKYLAKE_4C, &COFFEELAKE_6C] {
            let model = SliceModel::new(hash.reduction_map(),
                hash.master_sequence());
            for _ in 0..10_000 {
                let paddr = rng.gen_range(0..(1usize << hash.addr_bits));
                assert_eq!(model.map().reduce(paddr), model.mask().reduce(paddr));
                assert_eq!(model.predict(paddr), model.predict_with_mask(paddr));
            }
        }
    }

    #[test]
    fn partial_map() {
        let mut map = ReductionMap::new(6, 10);
        map.set(6, Some(1));
        map.set(7, Some(2));
        map.set(8, Some(0));
        assert!(!map.is_known(0));
        assert_eq!(map.get(0), 0);
        assert_eq!(map.unknown_bits().collect::<Vec<_>>(), vec![9]);
        assert_eq!(map.unknown_mask(), 0x200);

        // Unknown bits below the first bit don't matter
        assert_eq!(map.reduce(0xc0), Some(3));
        assert_eq!(map.reduce(0x17f), Some(1));
        assert_eq!(map.reduce(0x400), None);

        // An unknown bit at or above the first bit does
        assert_eq!(map.reduce(0x200), None);
        assert_eq!(map.reduce(0x2c0), None);

        let mask = map.to_mask();
        assert_eq!(mask.masks(), &[0x40, 0x80]);
        assert_eq!(mask.unknown(), 0x200);
        assert_eq!(mask.reduce(0x17f), Some(1));
        assert_eq!(mask.reduce(0x2c0), None);
    }

    #[test]
    fn unknown_bits_predict_nothing() {
        let mut map = COFFEELAKE_6C.reduction_map();
        map.set(19, None);
        let model = SliceModel::new(map, COFFEELAKE_6C.master_sequence());
        let mut rng = StdRng::seed_from_u64(19);
        for _ in 0..10_000 {
            let paddr = rng.gen_range(0..(1usize << 35));
            let expected = match paddr & (1 << 19) {
                0 => COFFEELAKE_6C.slice(paddr),
                _ => None,
            };
            assert_eq!(model.predict(paddr), expected);
            assert_eq!(model.predict_with_mask(paddr), expected);
        }
    }

    #[test]
    fn known_observations() {
        for hash in [&SKYLAKE_4C, &COFFEELAKE_6C] {
            let model = SliceModel::new(hash.reduction_map(),
                hash.master_sequence());
            for (paddr, slice) in hash.observations {
                assert_eq!(model.predict(*paddr), Some(*slice),
                    "{}: {:#x}", hash.name, paddr);
            }
        }
    }

    #[test]
    fn out_of_range() {
        let model = SliceModel::new(COFFEELAKE_6C.reduction_map(),
            COFFEELAKE_6C.master_sequence());
        for bit in 35..48 {
            assert_eq!(model.predict(1 << bit), None);
            assert_eq!(model.predict_with_mask(0x1234_5678 | (1 << bit)), None);
        }
        let model = SliceModel::new(SKYLAKE_4C.reduction_map(), None);
        assert_eq!(model.predict(1 << 35), None);
    }

    #[test]
    fn periodic() {
        let model = SliceModel::new(COFFEELAKE_6C.reduction_map(),
            COFFEELAKE_6C.master_sequence());
        let period = COFFEELAKE_6C.seq_len << COFFEELAKE_6C.line_bits;

        // Addresses separated by whole periods, but which only differ in
        // bits that don't contribute to the ID.
        let map = model.map();
        let free_bits: Vec<usize> = (13..35).filter(|b| map.get(*b) == 0)
            .collect();
        assert!(!free_bits.is_empty());
        let base = 0x1_2345_6000 & !(period - 1);
        for offset in (0..period).step_by(64) {
            let expected = model.predict(base + offset);
            for bit in free_bits.iter() {
                assert_eq!(model.predict(base + offset + (1 << bit)), expected);
            }
        }
    }

    #[test]
    fn unresolved_entries() {
        let mut master = COFFEELAKE_6C.master_sequence().unwrap();
        master.set(5, None);
        assert!(!master.is_resolved());
        assert_eq!(master.unresolved().collect::<Vec<_>>(), vec![5]);
        let map = COFFEELAKE_6C.reduction_map();
        // 0x140 is line 5 of the first period, with an ID of zero
        assert_eq!(map.reduce(0x140), Some(0));
        assert_eq!(predict_slice(0x140, &map, Some(&master)), None);
        assert_eq!(predict_slice(0x100, &map, Some(&master)), Some(1));
    }
}
