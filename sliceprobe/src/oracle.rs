//! Interfaces to the measurement and translation collaborators.

use crate::arena::Arena;
use crate::model::SliceId;
use crate::sequence::SliceSequence;
use crate::Result;

/// Translates virtual addresses into physical addresses.
///
/// Implementations are shared by search workers, so they must be `Sync`.
/// Callers are responsible for touching an address before translating it.
pub trait Translate: Sync {
    fn translate(&self, vaddr: usize) -> Result<usize>;
}

impl<T: Translate + ?Sized> Translate for &T {
    fn translate(&self, vaddr: usize) -> Result<usize> {
        (**self).translate(vaddr)
    }
}

/// Reports which slice owns a particular location in an [`Arena`].
///
/// A measurement may be individually expensive and is not reentrant: the
/// caller keeps itself pinned to one CPU for an entire measurement sequence.
/// Implementations are expected to retry/de-noise internally, and return
/// `None` when a measurement is inconclusive.
pub trait SliceOracle {
    /// Measure the slice of the cacheline at `offset`.
    fn measure(&mut self, arena: &Arena, offset: usize) -> Option<SliceId>;

    /// Measure `count` consecutive locations starting at `start`, taking
    /// steps of `stride` bytes.
    fn measure_sequence(&mut self, arena: &Arena, start: usize, count: usize,
        stride: usize) -> SliceSequence
    {
        (0..count).map(|i| {
            let offset = start + (i * stride);
            arena.touch(offset)?;
            self.measure(arena, offset)
        }).collect()
    }
}

impl<O: SliceOracle + ?Sized> SliceOracle for &mut O {
    fn measure(&mut self, arena: &Arena, offset: usize) -> Option<SliceId> {
        (**self).measure(arena, offset)
    }
    fn measure_sequence(&mut self, arena: &Arena, start: usize, count: usize,
        stride: usize) -> SliceSequence
    {
        (**self).measure_sequence(arena, start, count, stride)
    }
}
