//! Slice sequences measured around adjacent pairs.

use tracing::{ debug, info };

use crate::arena::Arena;
use crate::config::ProbeConfig;
use crate::env::ProbeEnv;
use crate::model::SliceId;
use crate::oracle::SliceOracle;
use crate::pairs::{ AdjacentPair, AdjacentPairSet, Location };
use crate::util::Align;
use crate::Result;

/// Slices measured for consecutive cache lines. Inconclusive measurements
/// are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceSequence(Vec<Option<SliceId>>);

impl SliceSequence {
    pub fn new(samples: Vec<Option<SliceId>>) -> Self {
        Self(samples)
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn samples(&self) -> &[Option<SliceId>] { &self.0 }

    /// The sample at `idx`, or `None` if it's unknown (or out of bounds).
    pub fn get(&self, idx: usize) -> Option<SliceId> {
        self.0.get(idx).copied().flatten()
    }

    /// Number of conclusive samples.
    pub fn known(&self) -> usize {
        self.0.iter().filter(|s| s.is_some()).count()
    }

    /// Find the smallest `i < limit` such that `self[k] == other[k ^ i]`
    /// for every position `k` where both samples are known.
    ///
    /// Samples that aren't a valid slice (at least `num_slices`) are
    /// ignored. Returns `None` if no offset matches, or if no position could
    /// be compared at all.
    pub fn xor_offset(&self, other: &SliceSequence, num_slices: usize,
        limit: usize) -> Option<u32>
    {
        (0..limit).find(|i| {
            let mut compared = 0;
            for (k, sample) in self.0.iter().enumerate() {
                let Some(x) = sample else { continue };
                if *x as usize >= num_slices {
                    continue;
                }
                let Some(y) = other.get(k ^ i) else { continue };
                if *x != y {
                    return false;
                }
                compared += 1;
            }
            compared > 0
        }).map(|i| i as u32)
    }

    /// Undo the XOR permutation applied by `id`: `aligned[k] = self[k ^ id]`.
    pub fn aligned(&self, id: usize) -> SliceSequence {
        (0..self.len()).map(|k| self.get(k ^ id)).collect()
    }
}

impl FromIterator<Option<SliceId>> for SliceSequence {
    fn from_iter<I: IntoIterator<Item=Option<SliceId>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A sequence measured at some location.
#[derive(Clone, Debug)]
pub struct SequenceData {
    /// Offset of the first line in the arena.
    pub offset: usize,
    pub vaddr: usize,
    pub paddr: usize,
    pub sequence: SliceSequence,
    /// XOR offset relative to a reference sequence, if one was found.
    pub xor_op: Option<u32>,
}

/// The sequences measured on both sides of an [`AdjacentPair`].
#[derive(Clone, Debug)]
pub struct SampledPair {
    pub pair: AdjacentPair,
    pub a: SequenceData,
    pub b: SequenceData,
}

/// All of the sampled pairs from a single run.
#[derive(Clone, Debug)]
pub struct SampledPairs {
    pairs: Vec<SampledPair>,
    seq_len: usize,
    num_slices: usize,
}

impl SampledPairs {
    pub fn new(pairs: Vec<SampledPair>, seq_len: usize, num_slices: usize)
        -> Self
    {
        Self { pairs, seq_len, num_slices }
    }

    pub fn len(&self) -> usize { self.pairs.len() }
    pub fn is_empty(&self) -> bool { self.pairs.is_empty() }
    pub fn seq_len(&self) -> usize { self.seq_len }

    pub fn iter(&self) -> impl Iterator<Item=&SampledPair> {
        self.pairs.iter()
    }

    /// Every sequence, in order of increasing bit and slot, with the a-side
    /// before the b-side.
    pub fn sequences(&self) -> impl Iterator<Item=&SequenceData> {
        self.pairs.iter().flat_map(|p| [&p.a, &p.b])
    }

    /// Compute the `xor_op` for every sequence.
    ///
    /// When the number of slices is a power of two, the a-side carries the
    /// XOR of the first pair of known samples, and the b-side carries zero.
    /// Otherwise, every sequence is aligned to the a-side of the first pair.
    pub fn align(&mut self) {
        if self.num_slices.is_power_of_two() {
            for sp in self.pairs.iter_mut() {
                let xor = sp.a.sequence.samples().iter()
                    .zip(sp.b.sequence.samples())
                    .find_map(|(x, y)| Some((*x)? ^ (*y)?))
                    .map(u32::from);
                sp.a.xor_op = xor;
                sp.b.xor_op = xor.map(|_| 0);
            }
            return;
        }

        let Some(reference) = self.pairs.first()
            .map(|sp| sp.a.sequence.clone()) else { return };
        for sp in self.pairs.iter_mut() {
            for data in [&mut sp.a, &mut sp.b] {
                data.xor_op = data.sequence.xor_offset(&reference,
                    self.num_slices, self.seq_len);
            }
            debug!("bit {:02}: xor_op a={:?} b={:?}", sp.pair.bit,
                sp.a.xor_op, sp.b.xor_op);
        }
    }
}

/// Measure a sequence on both sides of every pair in `set`, and align them.
///
/// Each sequence starts at the beginning of the period containing the
/// pair's location. The calling thread is pinned to the measurement core
/// for the duration.
pub fn sample_pair_sequences<O: SliceOracle>(set: &AdjacentPairSet,
    arena: &Arena, oracle: &mut O, cfg: &ProbeConfig) -> Result<SampledPairs>
{
    cfg.validate()?;
    let _pin = ProbeEnv::pin_scoped(cfg.measurement_core())?;
    let period = Align::from_value(cfg.period_bytes());

    info!("sampling {} sequences of {} lines", set.len() * 2, cfg.seq_len);
    let measure = |oracle: &mut O, loc: Location| {
        let offset = period.align_down(loc.offset);
        SequenceData {
            offset,
            vaddr: arena.base() + offset,
            paddr: period.align_down(loc.paddr),
            sequence: oracle.measure_sequence(arena, offset, cfg.seq_len,
                cfg.line_size()),
            xor_op: None,
        }
    };

    let pairs = set.iter().map(|pair| {
        SampledPair {
            pair: *pair,
            a: measure(oracle, pair.a),
            b: measure(oracle, pair.b),
        }
    }).collect();

    let mut sampled = SampledPairs::new(pairs, cfg.seq_len, cfg.num_slices);
    sampled.align();
    Ok(sampled)
}

#[cfg(test)]
mod test {
    use super::*;

    fn seq(samples: &[i32]) -> SliceSequence {
        samples.iter()
            .map(|s| (*s >= 0).then(|| *s as SliceId))
            .collect()
    }

    fn data(sequence: SliceSequence) -> SequenceData {
        SequenceData { offset: 0, vaddr: 0, paddr: 0, sequence, xor_op: None }
    }

    fn pair(bit: usize) -> AdjacentPair {
        AdjacentPair::new(bit, Location::new(0, 0), Location::new(0, 1 << bit))
            .unwrap()
    }

    #[test]
    fn xor_offset() {
        let r = seq(&[0, 1, 2, 3, 1, 4, 3, 4]);
        let s = r.aligned(5);
        assert_eq!(s, seq(&[4, 1, 4, 3, 1, 0, 3, 2]));
        assert_eq!(s.xor_offset(&r, 6, 8), Some(5));
        assert_eq!(r.xor_offset(&r, 6, 8), Some(0));

        // Unknown samples are skipped
        let t = seq(&[4, -1, 4, 3, -1, -1, 3, 2]);
        assert_eq!(t.xor_offset(&r, 6, 8), Some(5));

        // Out-of-range slices are skipped
        let u = seq(&[4, 1, 4, 3, 1, 9, 3, 2]);
        assert_eq!(u.xor_offset(&r, 6, 8), Some(5));

        assert_eq!(seq(&[5, 5, 5, 5, 5, 5, 5, 5]).xor_offset(&r, 6, 8), None);
        assert_eq!(seq(&[-1; 8]).xor_offset(&r, 6, 8), None);
    }

    #[test]
    fn align_power_of_two() {
        let mut sampled = SampledPairs::new(vec![
            SampledPair {
                pair: pair(13),
                a: data(seq(&[-1, 1, 2, 3])),
                b: data(seq(&[3, 2, 1, 0])),
            },
            SampledPair {
                pair: pair(14),
                a: data(seq(&[-1, 1, -1, 3])),
                b: data(seq(&[3, -1, 1, -1])),
            },
        ], 4, 4);
        sampled.align();
        let ops: Vec<_> = sampled.sequences().map(|d| d.xor_op).collect();
        assert_eq!(ops, vec![Some(3), Some(0), None, None]);
    }

    #[test]
    fn align_to_reference() {
        let r = seq(&[0, 1, 2, 3, 1, 4, 3, 4]);
        let mut sampled = SampledPairs::new(vec![
            SampledPair {
                pair: pair(13),
                a: data(r.clone()),
                b: data(r.aligned(3)),
            },
            SampledPair {
                pair: pair(14),
                a: data(r.aligned(6)),
                b: data(seq(&[5, 5, 5, 5, 5, 5, 5, 5])),
            },
        ], 8, 6);
        sampled.align();
        let ops: Vec<_> = sampled.sequences().map(|d| d.xor_op).collect();
        assert_eq!(ops, vec![Some(0), Some(3), Some(6), None]);
    }
}
