//! Recovering the linear part of the slice function.

use tracing::debug;

use crate::config::ProbeConfig;
use crate::model::ReductionMap;
use crate::sequence::SampledPairs;

/// Running totals for a single address bit.
#[derive(Clone, Copy, Debug, Default)]
struct BitSamples {
    total: u64,
    count: u64,
    /// Number of usable observations (including those which didn't differ).
    seen: u64,
}
impl BitSamples {
    /// Record one observation. Only differing values count towards the mean.
    fn add(&mut self, x: u32, y: u32) {
        self.seen += 1;
        if x != y {
            self.total += (x ^ y) as u64;
            self.count += 1;
        }
    }

    /// Rounded mean of all differing samples. A bit which was observed but
    /// never differed contributes zero; a bit which was never observed is
    /// unknown.
    fn value(&self) -> Option<u32> {
        if self.count == 0 {
            return (self.seen > 0).then_some(0);
        }
        Some((self.total as f64 / self.count as f64).round() as u32)
    }
}

/// Derive the XOR contribution of each address bit from aligned pair
/// sequences.
///
/// Since the two sides of a pair only differ in one bit, the difference
/// between their `xor_op` values is that bit's contribution. Bits without
/// any usable pair are left unknown, and any address which sets them can't
/// be reduced.
///
/// When the slice count is a power of two there's no master sequence, so
/// the bits indexing a line within the sequence period are recovered here
/// too, by comparing the first sample in each sequence against the sample
/// one bit away.
pub fn build_reduction_map(sampled: &SampledPairs, cfg: &ProbeConfig)
    -> ReductionMap
{
    let mut samples = vec![BitSamples::default(); cfg.addr_bits];

    for sp in sampled.iter() {
        let (Some(a), Some(b)) = (sp.a.xor_op, sp.b.xor_op) else {
            continue;
        };
        if sp.pair.bit < cfg.addr_bits {
            samples[sp.pair.bit].add(a, b);
        }
    }

    if cfg.slices_power_of_two() {
        for data in sampled.sequences() {
            let Some(first) = data.sequence.get(0) else { continue };
            for bit in cfg.line_bits..cfg.start_bit() {
                let idx = 1 << (bit - cfg.line_bits);
                if let Some(other) = data.sequence.get(idx) {
                    samples[bit].add(first as u32, other as u32);
                }
            }
        }
    }

    // Line bits are only recovered here when there's no master sequence
    let first_bit = if cfg.slices_power_of_two() {
        cfg.line_bits
    } else {
        cfg.start_bit()
    };
    let mut map = ReductionMap::new(first_bit, cfg.addr_bits);
    for (bit, s) in samples.iter().enumerate() {
        map.set(bit, s.value());
        if s.seen > 0 {
            debug!("bit {:02}: total={} count={}/{} value={:#x}", bit, s.total,
                s.count, s.seen, map.get(bit));
        }
    }
    map
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::SliceId;
    use crate::pairs::{ AdjacentPair, Location };
    use crate::sequence::*;

    fn data(samples: Vec<Option<SliceId>>, xor_op: Option<u32>) -> SequenceData {
        SequenceData {
            offset: 0, vaddr: 0, paddr: 0,
            sequence: SliceSequence::new(samples),
            xor_op,
        }
    }

    fn sampled(bit: usize, a: Option<u32>, b: Option<u32>) -> SampledPair {
        SampledPair {
            pair: AdjacentPair::new(bit, Location::new(0, 0),
                Location::new(0, 1 << bit)).unwrap(),
            a: data(vec![], a),
            b: data(vec![], b),
        }
    }

    #[test]
    fn averages() {
        let cfg = ProbeConfig::default_hugepage()
            .addr_bits(20).seq_len(128).num_slices(6);
        let sampled = SampledPairs::new(vec![
            sampled(13, Some(69), Some(0)),
            sampled(13, Some(1), Some(68)),
            sampled(14, Some(5), Some(5)),
            sampled(15, None, Some(5)),
            sampled(16, Some(12), Some(3)),
            sampled(16, Some(12), Some(4)),
        ], 128, 6);
        let map = build_reduction_map(&sampled, &cfg);
        assert_eq!(map.value(13), Some(69));
        // Measured, but never differed
        assert_eq!(map.value(14), Some(0));
        assert_eq!(map.value(15), None);
        // (15 + 8) / 2, rounded
        assert_eq!(map.value(16), Some(12));
        assert_eq!(map.first_bit(), 13);
        assert_eq!(map.unknown_bits().collect::<Vec<_>>(), vec![15, 17, 18, 19]);
        assert_eq!(map.reduce(1 << 14), Some(0));
        assert_eq!(map.reduce(1 << 15), None);
    }

    #[test]
    fn line_bits() {
        let cfg = ProbeConfig::default_hugepage()
            .addr_bits(16).seq_len(4).num_slices(4);
        assert_eq!(cfg.start_bit(), 8);
        let mut pair = sampled(9, Some(2), Some(0));
        pair.a.sequence = SliceSequence::new(vec![Some(1), Some(0), Some(3), Some(2)]);
        pair.b.sequence = SliceSequence::new(vec![Some(3), None, Some(1), Some(0)]);
        let sampled = SampledPairs::new(vec![pair], 4, 4);
        let map = build_reduction_map(&sampled, &cfg);
        assert_eq!(map.value(6), Some(1));
        assert_eq!(map.value(7), Some(2));
        assert_eq!(map.value(9), Some(2));
        assert_eq!(map.value(8), None);
        assert_eq!(map.first_bit(), 6);
        assert_eq!(map.reduce(0xc0), Some(3));
        assert_eq!(map.reduce(0x100), None);
    }
}
