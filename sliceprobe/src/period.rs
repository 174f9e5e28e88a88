//! Discovering the length of the master sequence.
//!
//! On a physically contiguous arena, consecutive sequences only differ by
//! the XOR permutation applied by the linear part of the slice function.
//! Once sequences are long enough to cover the whole period, every sequence
//! can be matched against the start of the run with an offset smaller than
//! the period.

use tracing::{ debug, info, warn };

use crate::arena::Arena;
use crate::config::ProbeConfig;
use crate::env::ProbeEnv;
use crate::oracle::SliceOracle;
use crate::sequence::SliceSequence;
use crate::Result;

/// Results for one sequence length.
#[derive(Clone, Debug)]
pub struct PeriodProbe {
    pub seq_len: usize,
    /// The offset found for each sequence (if any).
    pub xor_ops: Vec<Option<u32>>,
    /// Largest offset seen so far (across all probes).
    pub max_xor: u32,
    /// `max_xor` rounded up to a power of two.
    pub power: usize,
}

#[derive(Clone, Debug)]
pub struct PeriodDiscovery {
    /// The sequence length, if one was found.
    pub period: Option<usize>,
    pub trace: Vec<PeriodProbe>,
}

/// Find the sequence length by measuring successively longer sequences.
///
/// The arena is expected to be physically contiguous, and large enough for
/// `cfg.num_sequences` sequences of the largest length tried.
pub fn discover_sequence_period<O: SliceOracle>(arena: &Arena,
    oracle: &mut O, cfg: &ProbeConfig) -> Result<PeriodDiscovery>
{
    cfg.validate()?;
    let _pin = ProbeEnv::pin_scoped(cfg.measurement_core())?;
    let mut trace = Vec::new();
    let mut max_xor = 0;
    let mut power = 1;

    let mut seq_len = 1;
    while seq_len < cfg.max_period {
        let num_lines = cfg.num_sequences * seq_len;
        if (num_lines << cfg.line_bits) > arena.len() {
            warn!("arena is too small for {} sequences of {} lines",
                cfg.num_sequences, seq_len);
            break;
        }

        let run = oracle.measure_sequence(arena, 0, num_lines, cfg.line_size());
        let xor_ops: Vec<Option<u32>> = (0..cfg.num_sequences).map(|s| {
            let start = s * seq_len;
            let sequence: SliceSequence = (start..start + seq_len)
                .map(|idx| run.get(idx))
                .collect();
            sequence.xor_offset(&run, cfg.num_slices, num_lines)
        }).collect();

        max_xor = xor_ops.iter().flatten().fold(max_xor, |m, x| m.max(*x));
        while power < max_xor as usize {
            power *= 2;
        }

        info!("tried {} lines, max offset {:#x}, period <= {}", seq_len,
            max_xor, power);
        debug!("offsets: {:x?}", xor_ops);
        trace.push(PeriodProbe { seq_len, xor_ops, max_xor, power });

        if seq_len > power {
            return Ok(PeriodDiscovery { period: Some(power), trace });
        }
        seq_len <<= 1;
    }
    Ok(PeriodDiscovery { period: None, trace })
}
