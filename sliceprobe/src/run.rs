//! A complete inference run.

use rand::Rng;
use tracing::{ info, warn };

use crate::arena::Arena;
use crate::config::ProbeConfig;
use crate::linear::build_reduction_map;
use crate::model::*;
use crate::oracle::{ SliceOracle, Translate };
use crate::pairs::AdjacentPairSet;
use crate::reconcile::reconstruct_master_sequence;
use crate::search::find_adjacent_pairs;
use crate::sequence::{ sample_pair_sequences, SampledPairs };
use crate::Result;

/// Drives the whole pipeline for a single configuration.
///
/// ```no_run
/// use sliceprobe::*;
/// use sliceprobe::sim::SyntheticOracle;
/// use sliceprobe::known::COFFEELAKE_6C;
///
/// let cfg = ProbeConfig::for_platform(TargetPlatform::CoffeeLake6)
///     .validate().unwrap();
/// let arena = Arena::acquire(1 << 30, true).unwrap();
/// let pagemap = PageMap::open_self().unwrap();
/// let mut oracle = SyntheticOracle::new(&COFFEELAKE_6C, &pagemap);
/// let res = SliceMapper::new(cfg)
///     .run(&arena, &pagemap, &mut oracle, &mut thread_rng())
///     .unwrap();
/// println!("{:?}", res.model().mask());
/// ```
pub struct SliceMapper {
    cfg: ProbeConfig,
}
impl SliceMapper {
    pub fn new(cfg: ProbeConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ProbeConfig { &self.cfg }

    /// Fails with [`Error::Config`](crate::Error::Config) if the
    /// configuration doesn't validate.
    pub fn run<T, O, R>(&self, arena: &Arena, translator: &T, oracle: &mut O,
        rng: &mut R) -> Result<Inference>
        where T: Translate, O: SliceOracle, R: Rng
    {
        let cfg = &self.cfg;
        cfg.validate()?;

        let pairs = find_adjacent_pairs(arena, translator, cfg)?;
        let sampled = sample_pair_sequences(&pairs, arena, oracle, cfg)?;
        let map = build_reduction_map(&sampled, cfg);
        let unknown: Vec<usize> = map.unknown_bits().collect();
        if unknown.is_empty() {
            info!("reduction map is complete");
        } else {
            warn!("no usable pairs for bits {:?}, addresses with these bits \
                set can't be predicted", unknown);
        }

        let master = if cfg.slices_power_of_two() {
            None
        } else {
            Some(reconstruct_master_sequence(&sampled, arena, translator,
                oracle, &map, cfg, rng)?)
        };

        Ok(Inference {
            pairs,
            sampled,
            model: SliceModel::new(map, master),
        })
    }
}

/// Everything recovered by a run.
#[derive(Clone, Debug)]
pub struct Inference {
    pairs: AdjacentPairSet,
    sampled: SampledPairs,
    model: SliceModel,
}
impl Inference {
    pub fn pairs(&self) -> &AdjacentPairSet { &self.pairs }
    pub fn sampled(&self) -> &SampledPairs { &self.sampled }
    pub fn model(&self) -> &SliceModel { &self.model }

    /// Per-bit fill counts from the pair search.
    pub fn fill_counts(&self) -> impl Iterator<Item=(usize, usize)> + '_ {
        self.pairs.bits().map(|bit| (bit, self.pairs.fill_count(bit)))
    }
}
