//! Searching an arena for adjacent physical addresses.
//!
//! For each bit `b` above the sequence period, we pick a "pivot" location
//! whose physical address has `b` set and then look for another location
//! whose physical address differs from the pivot in exactly `b`.
//!
//! Bits below the page size are resolved by scanning the page around the
//! pivot. Bits at or above the page size can only be resolved by finding
//! another page, so the whole arena is split between a group of workers
//! which scan at page granularity.
//!
//! This is a best-effort search: a small (or unlucky) arena may leave some
//! bits with fewer pairs than requested.

pub mod group;

use std::ops::Range;
use tracing::{ debug, info, trace, warn };

use crate::arena::Arena;
use crate::config::ProbeConfig;
use crate::env::ProbeEnv;
use crate::oracle::Translate;
use crate::pairs::*;
use crate::util::{ bit_set, Align };
use crate::{ Error, Result };
use group::{ WorkGroup, Member };

/// Find up to `cfg.quota` adjacent pairs for every bit in
/// `cfg.start_bit()..cfg.addr_bits`.
///
/// A zero quota or an empty arena yields an empty set. Errors are only
/// returned for an invalid configuration, or when search workers can't be
/// created (or panic).
pub fn find_adjacent_pairs<T: Translate>(arena: &Arena, translator: &T,
    cfg: &ProbeConfig) -> Result<AdjacentPairSet>
{
    cfg.validate()?;
    let start_bit = cfg.start_bit();
    let table = AdjacentPairTable::new(start_bit, cfg.addr_bits, cfg.quota);
    if cfg.quota == 0 || arena.is_empty() {
        info!("skipping pair search (quota={}, arena={:#x} bytes)",
            cfg.quota, arena.len());
        return Ok(table.freeze());
    }

    info!("searching for {} adjacent pairs per bit in {}..{} ({:#x}-byte arena)",
        cfg.quota, start_bit, cfg.addr_bits, arena.len());

    let search = PairSearch { arena, translator, cfg, table: &table };
    for bit in start_bit..cfg.addr_bits {
        search.search_bit(bit)?;
        let count = table.count(bit);
        if count < cfg.quota {
            warn!("bit {:02}: only found {}/{} pairs", bit, count, cfg.quota);
        } else {
            info!("bit {:02}: found {}/{} pairs", bit, count, cfg.quota);
        }
    }
    Ok(table.freeze())
}

/// State shared by the coordinator and all workers during a search.
struct PairSearch<'a, T: Translate> {
    arena: &'a Arena,
    translator: &'a T,
    cfg: &'a ProbeConfig,
    table: &'a AdjacentPairTable,
}

impl<'a, T: Translate> PairSearch<'a, T> {
    /// Touch and translate the location at `offset`.
    fn locate(&self, offset: usize) -> Option<Location> {
        let vaddr = self.arena.touch(offset)?;
        match self.translator.translate(vaddr) {
            Ok(paddr) => Some(Location::new(offset, paddr)),
            Err(e) => {
                trace!("offset {:#x}: {}", offset, e);
                None
            },
        }
    }

    /// Record `loc` if it differs from the pivot in exactly `bit`.
    fn record(&self, bit: usize, pivot: Location, loc: Location) -> bool {
        if loc.paddr == pivot.paddr {
            return false;
        }
        let Some(pair) = AdjacentPair::new(bit, pivot, loc) else {
            return false;
        };
        let recorded = self.table.try_insert(pair);
        if recorded {
            debug!("bit {:02}: {:#011x} ({:#x}) <-> {:#011x} ({:#x})", bit,
                pair.a.paddr, pair.a.offset, pair.b.paddr, pair.b.offset);
        }
        recorded
    }

    fn search_bit(&self, bit: usize) -> Result<()> {
        let page = Align::from_bit(self.cfg.page_bits);
        let intra_page = bit < self.cfg.page_bits;
        let stride = if intra_page { 1 << bit } else { page.value() };

        let mut offset = 0;
        while offset < self.arena.len() && !self.table.is_saturated(bit) {
            let pivot = match self.locate(offset) {
                Some(loc) if bit_set(loc.paddr, bit) => loc,
                _ => {
                    offset += stride;
                    continue;
                },
            };

            if intra_page {
                self.scan_page(bit, pivot);
                // Move on to the next page, even if there might be other
                // candidates left in this one
                offset = page.align_down(offset) + page.value();
            } else {
                self.scan_parallel(bit, pivot)?;
                offset += stride;
            }
        }
        Ok(())
    }

    /// Scan the page containing the pivot, one cache line at a time.
    fn scan_page(&self, bit: usize, pivot: Location) {
        let page = Align::from_bit(self.cfg.page_bits);
        let start = page.align_down(pivot.offset);
        let end = (start + page.value()).min(self.arena.len());
        for offset in (start..end).step_by(self.cfg.line_size()) {
            if self.table.is_saturated(bit) {
                break;
            }
            if let Some(loc) = self.locate(offset) {
                self.record(bit, pivot, loc);
            }
        }
    }

    /// Split the arena into contiguous partitions (one per worker) and
    /// scan them in parallel, one page at a time.
    fn scan_parallel(&self, bit: usize, pivot: Location) -> Result<()> {
        let page_size = self.cfg.page_size();
        let num_pages = self.arena.len().div_ceil(page_size);
        let num_workers = self.cfg.num_threads.clamp(1, num_pages.max(1));
        let cpus = ProbeEnv::allowed_cpus();
        let group = WorkGroup::new();

        std::thread::scope(|s| {
            let mut handles = Vec::with_capacity(num_workers);
            let mut spawn_error = None;

            for t in 0..num_workers {
                let range = Range {
                    start: (t * num_pages / num_workers) * page_size,
                    end: (((t + 1) * num_pages / num_workers) * page_size)
                        .min(self.arena.len()),
                };
                let cpu = self.cfg.pin_workers.then(|| cpus[t % cpus.len()]);
                let member = group.enter();
                let res = std::thread::Builder::new()
                    .name(format!("pair-search-{}", t))
                    .spawn_scoped(s, move || {
                        self.scan_range(bit, pivot, range, cpu, member)
                    });
                match res {
                    Ok(handle) => handles.push(handle),
                    Err(source) => {
                        spawn_error = Some(Error::WorkerSpawn { worker: t, source });
                        break;
                    },
                }
            }

            if spawn_error.is_none() {
                group.wait_until(|| self.table.is_saturated(bit));
            }
            group.cancel();

            let mut panicked = false;
            for handle in handles {
                match handle.join() {
                    Ok(found) => trace!("bit {:02}: worker found {} pairs", bit, found),
                    Err(_) => panicked = true,
                }
            }

            if let Some(e) = spawn_error {
                return Err(e);
            }
            if panicked {
                return Err(Error::WorkerPanic);
            }
            Ok(())
        })
    }

    /// Worker: scan `range` at page granularity until it's exhausted or
    /// the group is cancelled.
    fn scan_range(&self, bit: usize, pivot: Location, range: Range<usize>,
        cpu: Option<usize>, member: Member<'_>) -> usize
    {
        if let Some(cpu) = cpu {
            if let Err(e) = ProbeEnv::pin_to_core(cpu) {
                warn!("{}", e);
            }
        }

        let mut found = 0;
        for offset in range.step_by(self.cfg.page_size()) {
            if member.is_cancelled() {
                break;
            }
            if let Some(loc) = self.locate(offset) {
                if self.record(bit, pivot, loc) {
                    found += 1;
                    member.notify();
                }
            }
        }
        found
    }
}
