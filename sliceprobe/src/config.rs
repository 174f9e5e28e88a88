//! Run configuration.

use crate::known::KnownSliceHash;
use crate::env::ProbeEnv;
use crate::{ Error, Result };

/// Parts with a published slice function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetPlatform {
    /// Skylake client, 4 slices (i7-6700K)
    Skylake4,
    /// Coffee Lake client, 6 slices (i7-9850H)
    CoffeeLake6,
}
impl TargetPlatform {
    pub fn known_hash(&self) -> &'static KnownSliceHash {
        match self {
            Self::Skylake4 => &crate::known::SKYLAKE_4C,
            Self::CoffeeLake6 => &crate::known::COFFEELAKE_6C,
        }
    }
}

/// Parameters for a single inference run.
#[derive(Clone, Copy, Debug)]
pub struct ProbeConfig {
    /// Number of physical address bits considered by the model.
    pub addr_bits: usize,

    /// log2 of the last-level cache line size.
    pub line_bits: usize,

    /// log2 of the page size backing the arena.
    pub page_bits: usize,

    /// Length of the master sequence period (in cache lines).
    pub seq_len: usize,

    /// Number of adjacent pairs collected for each address bit.
    pub quota: usize,

    /// Number of workers used for the inter-page search.
    pub num_threads: usize,

    /// Number of last-level cache slices.
    pub num_slices: usize,

    /// Pin each search worker to a distinct CPU.
    pub pin_workers: bool,

    /// CPU used for slice measurements. Defaults to the first allowed CPU.
    pub measure_core: Option<usize>,

    /// Number of random samples (per sequence ID) taken when reconstructing
    /// the master sequence.
    pub samples_per_id: usize,

    /// Number of consecutive sequences compared during period discovery.
    pub num_sequences: usize,

    /// Upper bound for period discovery (in cache lines).
    pub max_period: usize,
}

impl ProbeConfig {
    const DEFAULT_ADDR_BITS: usize = 41;
    const DEFAULT_QUOTA: usize = 2;
    const DEFAULT_SAMPLES_PER_ID: usize = 8;
    const DEFAULT_NUM_SEQUENCES: usize = 16;
    const DEFAULT_MAX_PERIOD: usize = 32768;

    /// Defaults for an arena backed by 4KiB pages. Only a single-line
    /// sequence period fits in a page, so this is only useful on parts with
    /// a power-of-two slice count.
    pub fn default_4k() -> Self {
        Self {
            addr_bits: Self::DEFAULT_ADDR_BITS,
            line_bits: 6,
            page_bits: 12,
            seq_len: 1,
            quota: Self::DEFAULT_QUOTA,
            num_threads: ProbeEnv::online_cpus(),
            num_slices: 4,
            pin_workers: true,
            measure_core: None,
            samples_per_id: Self::DEFAULT_SAMPLES_PER_ID,
            num_sequences: Self::DEFAULT_NUM_SEQUENCES,
            max_period: Self::DEFAULT_MAX_PERIOD,
        }
    }

    /// Defaults for an arena backed by 2MiB pages.
    pub fn default_hugepage() -> Self {
        Self {
            addr_bits: Self::DEFAULT_ADDR_BITS,
            line_bits: 6,
            page_bits: 21,
            seq_len: 128,
            quota: Self::DEFAULT_QUOTA,
            num_threads: ProbeEnv::online_cpus(),
            num_slices: 6,
            pin_workers: true,
            measure_core: None,
            samples_per_id: Self::DEFAULT_SAMPLES_PER_ID,
            num_sequences: Self::DEFAULT_NUM_SEQUENCES,
            max_period: Self::DEFAULT_MAX_PERIOD,
        }
    }

    /// Defaults for one of the known parts.
    pub fn for_platform(p: TargetPlatform) -> Self {
        let hash = p.known_hash();
        Self::default_hugepage()
            .addr_bits(hash.addr_bits)
            .seq_len(hash.seq_len)
            .num_slices(hash.num_slices)
    }
}

impl ProbeConfig {
    pub fn addr_bits(mut self, x: usize) -> Self {
        self.addr_bits = x;
        self
    }
    pub fn line_bits(mut self, x: usize) -> Self {
        self.line_bits = x;
        self
    }
    pub fn page_bits(mut self, x: usize) -> Self {
        self.page_bits = x;
        self
    }
    pub fn seq_len(mut self, x: usize) -> Self {
        self.seq_len = x;
        self
    }
    pub fn quota(mut self, x: usize) -> Self {
        self.quota = x;
        self
    }
    pub fn num_threads(mut self, x: usize) -> Self {
        self.num_threads = x;
        self
    }
    pub fn num_slices(mut self, x: usize) -> Self {
        self.num_slices = x;
        self
    }
    pub fn pin_workers(mut self, x: bool) -> Self {
        self.pin_workers = x;
        self
    }
    pub fn measure_core(mut self, x: Option<usize>) -> Self {
        self.measure_core = x;
        self
    }
    pub fn samples_per_id(mut self, x: usize) -> Self {
        self.samples_per_id = x;
        self
    }
    pub fn num_sequences(mut self, x: usize) -> Self {
        self.num_sequences = x;
        self
    }
    pub fn max_period(mut self, x: usize) -> Self {
        self.max_period = x;
        self
    }
}

impl ProbeConfig {
    pub const fn line_size(&self) -> usize { 1 << self.line_bits }
    pub const fn page_size(&self) -> usize { 1 << self.page_bits }

    /// Size of one sequence period in bytes.
    pub const fn period_bytes(&self) -> usize {
        self.seq_len << self.line_bits
    }

    /// The first address bit above the sequence period. Lower bits are
    /// absorbed by the period and are never searched for.
    pub const fn start_bit(&self) -> usize {
        self.period_bytes().trailing_zeros() as usize
    }

    pub const fn slices_power_of_two(&self) -> bool {
        self.num_slices.is_power_of_two()
    }

    /// The core used for slice measurements.
    pub fn measurement_core(&self) -> usize {
        self.measure_core.unwrap_or_else(|| ProbeEnv::allowed_cpus()[0])
    }

    /// Check that this configuration is usable.
    pub fn validate(self) -> Result<Self> {
        if !self.seq_len.is_power_of_two() {
            return Err(Error::Config(format!(
                "sequence length {} isn't a power of two", self.seq_len
            )));
        }
        if self.addr_bits > 63 || self.start_bit() >= self.addr_bits {
            return Err(Error::Config(format!(
                "start bit {} must be below address width {} (at most 63)",
                self.start_bit(), self.addr_bits
            )));
        }
        if self.period_bytes() > self.page_size() {
            return Err(Error::Config(format!(
                "sequence period ({:#x} bytes) doesn't fit in a page ({:#x} bytes)",
                self.period_bytes(), self.page_size()
            )));
        }
        if self.num_threads == 0 || self.num_slices == 0 {
            return Err(Error::Config(
                "need at least one worker and one slice".to_string()
            ));
        }
        Ok(self)
    }
}
