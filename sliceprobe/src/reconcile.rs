//! Recovering the master sequence for parts where the number of slices isn't
//! a power of two.
//!
//! The reduced ID of a period-aligned address selects an entry in the master
//! sequence directly, so we first sample random period-aligned addresses and
//! vote on the slice for each ID. Any entries which are still unknown after
//! that are filled in from whichever pair sequence agrees most with the
//! entries we already have.

use rand::Rng;
use tracing::{ debug, info, trace, warn };

use crate::arena::Arena;
use crate::config::ProbeConfig;
use crate::env::ProbeEnv;
use crate::model::{ MasterSequence, ReductionMap, SliceId };
use crate::oracle::{ SliceOracle, Translate };
use crate::sequence::{ SampledPairs, SliceSequence };
use crate::Result;

/// Votes for the slice associated with a single ID.
#[derive(Clone, Copy, Debug, Default)]
struct Votes {
    first: Option<SliceId>,
    count: usize,
    agree: bool,
}
impl Votes {
    fn add(&mut self, slice: SliceId) {
        match self.first {
            None => {
                self.first = Some(slice);
                self.agree = true;
            },
            Some(first) => self.agree &= first == slice,
        }
        self.count += 1;
    }

    /// The slice, if every vote agreed.
    fn result(&self) -> Option<SliceId> {
        if self.agree { self.first } else { None }
    }
}

/// Reconstruct the master sequence.
///
/// `cfg.seq_len * cfg.samples_per_id` random period-aligned locations are
/// measured. Locations that fail to translate, reduce to an ID outside the
/// sequence, or produce an inconclusive measurement are skipped.
///
/// Entries that remain unresolved are reported as `None`.
pub fn reconstruct_master_sequence<T, O, R>(sampled: &SampledPairs,
    arena: &Arena, translator: &T, oracle: &mut O, map: &ReductionMap,
    cfg: &ProbeConfig, rng: &mut R) -> Result<MasterSequence>
    where T: Translate, O: SliceOracle, R: Rng
{
    cfg.validate()?;
    let mut master = MasterSequence::new(cfg.seq_len, cfg.line_bits);
    let period = cfg.period_bytes();
    let num_periods = arena.len() / period;
    let num_samples = cfg.seq_len * cfg.samples_per_id;

    if num_periods > 0 {
        let _pin = ProbeEnv::pin_scoped(cfg.measurement_core())?;
        info!("sampling {} random sequence-aligned addresses", num_samples);

        let mut votes = vec![Votes::default(); cfg.seq_len];
        for _ in 0..num_samples {
            let offset = rng.gen_range(0..num_periods) * period;
            let Some(vaddr) = arena.touch(offset) else { continue };
            let paddr = match translator.translate(vaddr) {
                Ok(paddr) => paddr,
                Err(e) => {
                    trace!("{}", e);
                    continue;
                },
            };
            let Some(id) = map.reduce(paddr) else { continue };
            let Some(entry) = votes.get_mut(id as usize) else {
                trace!("{:#x}: id {:#x} is outside the sequence", paddr, id);
                continue;
            };
            if let Some(slice) = oracle.measure(arena, offset) {
                entry.add(slice);
            }
        }

        for (id, v) in votes.iter().enumerate() {
            master.set(id, v.result());
            if v.count > 0 && !v.agree {
                debug!("id {:#04x}: {} votes disagree", id, v.count);
            }
        }
    }

    let unresolved = master.unresolved().count();
    if unresolved > 0 {
        info!("{} entries unresolved after sampling", unresolved);
        fill_from_pairs(&mut master, sampled, map);
    }

    let unresolved: Vec<usize> = master.unresolved().collect();
    if !unresolved.is_empty() {
        warn!("master sequence has {} unresolved entries: {:x?}",
            unresolved.len(), unresolved);
    }
    Ok(master)
}

/// Number of positions where `candidate` agrees with a resolved entry.
fn similarity(master: &MasterSequence, candidate: &SliceSequence) -> usize {
    (0..master.len()).filter(|k| {
        matches!((master.get(*k), candidate.get(*k)), (Some(x), Some(y)) if x == y)
    }).count()
}

/// Fill unresolved entries from the most similar pair sequence.
///
/// Each pair sequence is first aligned with the ID of its first line, so
/// that position `k` lines up with master sequence entry `k`. On ties, the
/// last candidate wins.
fn fill_from_pairs(master: &mut MasterSequence, sampled: &SampledPairs,
    map: &ReductionMap)
{
    let mut best: Option<(usize, SliceSequence)> = None;
    for data in sampled.sequences() {
        let Some(id) = map.reduce(data.paddr) else { continue };
        let aligned = data.sequence.aligned(id as usize);
        let score = similarity(master, &aligned);
        if best.as_ref().map_or(true, |(max, _)| score >= *max) {
            best = Some((score, aligned));
        }
    }

    let Some((score, best)) = best else {
        debug!("no pair sequences to fill from");
        return;
    };
    debug!("filling from sequence with similarity {}", score);
    let unresolved: Vec<usize> = master.unresolved().collect();
    for k in unresolved {
        master.set(k, best.get(k));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::known::COFFEELAKE_6C;
    use crate::model::SliceFunction;
    use crate::pairs::{ AdjacentPair, Location };
    use crate::sequence::{ SampledPair, SequenceData };
    use crate::sim::{ SyntheticOracle, SyntheticTranslation };
    use rand::prelude::*;

    fn cfg() -> ProbeConfig {
        ProbeConfig::default_hugepage()
            .page_bits(14)
            .addr_bits(35)
            .seq_len(128)
            .num_slices(6)
    }

    /// Sequences for a pair starting at `paddr`.
    fn sequences(paddr: usize) -> SampledPair {
        let measure = |paddr: usize| {
            let sequence = (0..128).map(|k| {
                COFFEELAKE_6C.slice(paddr + (k << 6))
            }).collect();
            SequenceData { offset: 0, vaddr: 0, paddr, sequence, xor_op: None }
        };
        SampledPair {
            pair: AdjacentPair::new(13, Location::new(0, paddr),
                Location::new(0x2000, paddr | 0x2000)).unwrap(),
            a: measure(paddr),
            b: measure(paddr | 0x2000),
        }
    }

    #[test]
    fn sampling_only() {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = cfg();
        let arena = Arena::acquire(0x80_0000, false).unwrap();
        let xlat = SyntheticTranslation::with_adjacent_frames(&arena,
            cfg.page_bits, cfg.addr_bits, 0, &mut rng);
        let mut oracle = SyntheticOracle::new(&COFFEELAKE_6C, &xlat);
        let map = COFFEELAKE_6C.reduction_map();
        let sampled = SampledPairs::new(vec![], 128, 6);
        let master = reconstruct_master_sequence(&sampled, &arena, &xlat,
            &mut oracle, &map, &cfg.samples_per_id(16), &mut rng).unwrap();

        // Every resolved entry must be right
        let expected = COFFEELAKE_6C.master_sequence().unwrap();
        for k in 0..128 {
            if let Some(slice) = master.get(k) {
                assert_eq!(Some(slice), expected.get(k));
            }
        }
        assert!(master.unresolved().count() < 64);
    }

    #[test]
    fn fill_gaps() {
        let map = COFFEELAKE_6C.reduction_map();
        let expected = COFFEELAKE_6C.master_sequence().unwrap();
        let mut master = expected.clone();
        for k in [0, 5, 17, 64, 127] {
            master.set(k, None);
        }
        let sampled = SampledPairs::new(vec![
            sequences(0x1_2345_0000),
            sequences(0x0_7654_c000),
        ], 128, 6);
        fill_from_pairs(&mut master, &sampled, &map);
        assert_eq!(master, expected);
    }

    #[test]
    fn last_max_wins() {
        let map = ReductionMap::new(13, 35);
        let mut master = MasterSequence::new(4, 6);
        master.set(0, Some(1));
        let data = |samples: [SliceId; 4]| SequenceData {
            offset: 0, vaddr: 0, paddr: 0,
            sequence: samples.iter().map(|s| Some(*s)).collect(),
            xor_op: None,
        };
        let pair = AdjacentPair::new(13, Location::new(0, 0),
            Location::new(0, 0x2000)).unwrap();
        let sampled = SampledPairs::new(vec![
            SampledPair { pair, a: data([1, 2, 2, 2]), b: data([1, 3, 3, 3]) },
            SampledPair { pair, a: data([0, 4, 4, 4]), b: data([5, 5, 5, 5]) },
        ], 4, 6);
        fill_from_pairs(&mut master, &sampled, &map);
        assert_eq!(master.entries(), &[Some(1), Some(3), Some(3), Some(3)]);
    }

    #[test]
    fn empty_arena() {
        let cfg = cfg();
        let arena = Arena::empty();
        let xlat = SyntheticTranslation::contiguous(&arena, cfg.page_bits, 0);
        let mut oracle = SyntheticOracle::new(&COFFEELAKE_6C, &xlat);
        let map = COFFEELAKE_6C.reduction_map();
        let sampled = SampledPairs::new(vec![], 128, 6);
        let master = reconstruct_master_sequence(&sampled, &arena, &xlat,
            &mut oracle, &map, &cfg, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(master.unresolved().count(), 128);
    }
}
