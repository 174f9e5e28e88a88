//! Storage for adjacent physical address pairs.

use parking_lot::Mutex;
use crate::util::bit_set;

/// A location in the arena, along with its physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    /// Offset into the arena.
    pub offset: usize,
    pub paddr: usize,
}
impl Location {
    pub fn new(offset: usize, paddr: usize) -> Self {
        Self { offset, paddr }
    }
}

/// Two locations whose physical addresses differ only in `bit`.
///
/// Side `a` always has `bit` clear and side `b` always has it set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdjacentPair {
    pub bit: usize,
    pub a: Location,
    pub b: Location,
}
impl AdjacentPair {
    /// Create a pair from two locations in either order.
    ///
    /// Returns `None` unless the physical addresses differ in exactly `bit`.
    pub fn new(bit: usize, x: Location, y: Location) -> Option<Self> {
        if crate::util::differing_bit(x.paddr, y.paddr) != Some(bit) {
            return None;
        }
        if bit_set(x.paddr, bit) {
            Some(Self { bit, a: y, b: x })
        } else {
            Some(Self { bit, a: x, b: y })
        }
    }
}

struct TableState {
    slots: Vec<Option<AdjacentPair>>,
    counts: Vec<usize>,
}

/// A fixed-capacity table of adjacent pairs shared by search workers.
///
/// Each bit in `first_bit..addr_bits` has room for `quota` pairs. All
/// updates happen under a single lock, so concurrent inserts never put more
/// than `quota` pairs in any bit.
pub struct AdjacentPairTable {
    first_bit: usize,
    addr_bits: usize,
    quota: usize,
    state: Mutex<TableState>,
}
impl AdjacentPairTable {
    pub fn new(first_bit: usize, addr_bits: usize, quota: usize) -> Self {
        let num_bits = addr_bits.saturating_sub(first_bit);
        Self {
            first_bit,
            addr_bits,
            quota,
            state: Mutex::new(TableState {
                slots: vec![None; num_bits * quota],
                counts: vec![0; num_bits],
            }),
        }
    }

    pub fn quota(&self) -> usize { self.quota }

    fn index(&self, bit: usize) -> Option<usize> {
        (bit >= self.first_bit && bit < self.addr_bits)
            .then(|| bit - self.first_bit)
    }

    /// Number of pairs recorded for `bit`.
    pub fn count(&self, bit: usize) -> usize {
        let Some(idx) = self.index(bit) else { return 0 };
        self.state.lock().counts[idx]
    }

    pub fn is_saturated(&self, bit: usize) -> bool {
        self.count(bit) >= self.quota
    }

    /// Try to record a pair. Returns `false` if the bit is already
    /// saturated, or if the pair was already recorded.
    pub fn try_insert(&self, pair: AdjacentPair) -> bool {
        let Some(idx) = self.index(pair.bit) else { return false };
        let mut state = self.state.lock();
        let count = state.counts[idx];
        if count >= self.quota {
            return false;
        }
        let base = idx * self.quota;
        let dup = state.slots[base..base + count].iter().flatten()
            .any(|p| p.a.paddr == pair.a.paddr && p.b.paddr == pair.b.paddr);
        if dup {
            return false;
        }
        state.slots[base + count] = Some(pair);
        state.counts[idx] += 1;
        true
    }

    /// Consume the table, producing the immutable results.
    pub fn freeze(self) -> AdjacentPairSet {
        let state = self.state.into_inner();
        let pairs = state.counts.iter().enumerate().map(|(idx, count)| {
            let base = idx * self.quota;
            state.slots[base..base + count].iter().flatten().copied().collect()
        }).collect();
        AdjacentPairSet {
            first_bit: self.first_bit,
            addr_bits: self.addr_bits,
            quota: self.quota,
            pairs,
        }
    }
}

/// The adjacent pairs found during a search.
#[derive(Clone, Debug)]
pub struct AdjacentPairSet {
    first_bit: usize,
    addr_bits: usize,
    quota: usize,
    pairs: Vec<Vec<AdjacentPair>>,
}
impl AdjacentPairSet {
    /// A set with no pairs for any bit.
    pub fn empty(first_bit: usize, addr_bits: usize, quota: usize) -> Self {
        AdjacentPairTable::new(first_bit, addr_bits, quota).freeze()
    }

    pub fn first_bit(&self) -> usize { self.first_bit }
    pub fn addr_bits(&self) -> usize { self.addr_bits }
    pub fn quota(&self) -> usize { self.quota }

    /// The bits covered by this set.
    pub fn bits(&self) -> std::ops::Range<usize> {
        self.first_bit..self.addr_bits.max(self.first_bit)
    }

    /// Pairs recorded for `bit`.
    pub fn pairs(&self, bit: usize) -> &[AdjacentPair] {
        if bit < self.first_bit {
            return &[];
        }
        self.pairs.get(bit - self.first_bit).map(|p| p.as_slice())
            .unwrap_or(&[])
    }

    pub fn fill_count(&self, bit: usize) -> usize {
        self.pairs(bit).len()
    }

    /// Bits which didn't reach the quota.
    pub fn underfilled(&self) -> impl Iterator<Item=usize> + '_ {
        self.bits().filter(|bit| self.fill_count(*bit) < self.quota)
    }

    /// Total number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.iter().map(|p| p.len()).sum()
    }

    /// Iterate over all pairs, in order of increasing bit.
    pub fn iter(&self) -> impl Iterator<Item=&AdjacentPair> {
        self.pairs.iter().flatten()
    }
}
