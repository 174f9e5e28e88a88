//! Recovering the physical-address to last-level-cache slice mapping.
//!
//! The pipeline for a single run is:
//!
//! 1. [`search::find_adjacent_pairs`] collects physical addresses which
//!    differ in exactly one bit.
//! 2. [`sequence::sample_pair_sequences`] measures a slice sequence on both
//!    sides of every pair.
//! 3. [`linear::build_reduction_map`] derives the XOR contribution of each
//!    address bit.
//! 4. [`reconcile::reconstruct_master_sequence`] recovers the lookup table
//!    used on parts with a slice count that isn't a power of two.
//! 5. [`model::predict_slice`] combines the results.
//!
//! [`run::SliceMapper`] drives all of this for you.

pub mod arena;
pub mod config;
pub mod env;
pub mod known;
pub mod linear;
pub mod model;
pub mod oracle;
pub mod pairs;
pub mod period;
pub mod reconcile;
pub mod run;
pub mod search;
pub mod sequence;
pub mod sim;
pub mod util;

pub use rand::Rng;
pub use rand::prelude::*;

pub use crate::arena::Arena;
pub use crate::config::*;
pub use crate::env::{ ProbeEnv, AffinityGuard };
pub use crate::model::*;
pub use crate::oracle::{ SliceOracle, Translate };
pub use crate::pairs::{ AdjacentPair, AdjacentPairSet, AdjacentPairTable, Location };
pub use crate::run::{ SliceMapper, Inference };
pub use crate::sequence::{ SliceSequence, SequenceData, SampledPair, SampledPairs };
pub use crate::util::pagemap::PageMap;

/// Crate-level error type.
///
/// Inconclusive slice measurements, under-filled pair quotas and unresolved
/// master-sequence entries are *not* errors: they're carried through the
/// results as `None` samples, fill counts, and `None` table entries.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("couldn't translate virtual address {vaddr:#x}: {reason}")]
    Translation { vaddr: usize, reason: &'static str },

    #[error("couldn't map {len:#x}-byte arena: {errno}")]
    ArenaMap { len: usize, errno: nix::errno::Errno },

    #[error("couldn't spawn search worker {worker}: {source}")]
    WorkerSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("search worker panicked")]
    WorkerPanic,

    #[error("couldn't pin to cpu {cpu}: {errno}")]
    Affinity { cpu: usize, errno: nix::errno::Errno },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
