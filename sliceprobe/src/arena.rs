//! Backing memory used for address searches and slice measurements.

use std::num::NonZeroUsize;
use std::sync::atomic::{ AtomicU8, Ordering };
use nix::sys::mman::{ ProtFlags, MapFlags };

use crate::{ Error, Result };

/// An anonymous, private mapping.
///
/// All scanning and measurement is done in terms of offsets into the arena.
/// The arena is shared by search workers. Their ranges are disjoint, but
/// [`Arena::touch`] is atomic anyway, so any thread may touch any offset.
pub struct Arena {
    ptr: *mut u8,
    len: usize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map `len` bytes of anonymous memory, optionally backed by huge pages
    /// of the default size (see `/proc/sys/vm/nr_hugepages`).
    ///
    /// A zero-length request returns an empty arena.
    pub fn acquire(len: usize, huge: bool) -> Result<Self> {
        let Some(nz_len) = NonZeroUsize::new(len) else {
            return Ok(Self::empty());
        };

        let mut flags = MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE;
        if huge {
            flags |= MapFlags::MAP_HUGETLB;
        }

        let ptr = unsafe {
            nix::sys::mman::mmap(None, nz_len,
                ProtFlags::PROT_READ |
                ProtFlags::PROT_WRITE |
                ProtFlags::PROT_EXEC,
                flags, -1, 0)
        }.map_err(|errno| Error::ArenaMap { len, errno })?;

        tracing::debug!("mapped {:#x}-byte arena at {:p}", len, ptr);
        Ok(Self { ptr: ptr as *mut u8, len })
    }

    pub fn empty() -> Self {
        Self { ptr: std::ptr::null_mut(), len: 0 }
    }

    /// Size of the arena in bytes.
    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Virtual address of the first byte in the arena.
    pub fn base(&self) -> usize { self.ptr as usize }

    /// Virtual address of the byte at `offset`, if it lies in the arena.
    pub fn addr(&self, offset: usize) -> Option<usize> {
        (offset < self.len).then(|| self.base() + offset)
    }

    /// Write to the byte at `offset` so that its page is resident (and
    /// not backed by the zero page). Returns the virtual address.
    pub fn touch(&self, offset: usize) -> Option<usize> {
        if offset >= self.len {
            return None;
        }
        // The mapping is live and writable for as long as `self` is, and
        // all concurrent access to arena bytes goes through this atomic.
        let byte = unsafe { AtomicU8::from_ptr(self.ptr.add(offset)) };
        byte.fetch_add(1, Ordering::Relaxed);
        Some(self.base() + offset)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        let res = unsafe {
            nix::sys::mman::munmap(self.ptr as *mut std::ffi::c_void, self.len)
        };
        if let Err(errno) = res {
            tracing::warn!("couldn't unmap arena at {:p}: {}", self.ptr, errno);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_arena() {
        let arena = Arena::acquire(0, false).unwrap();
        assert!(arena.is_empty());
        assert_eq!(arena.touch(0), None);
        assert_eq!(arena.addr(0), None);
    }

    #[test]
    fn touch() {
        let arena = Arena::acquire(0x4000, false).unwrap();
        assert_eq!(arena.len(), 0x4000);
        assert_eq!(arena.base() & 0xfff, 0);
        assert_eq!(arena.touch(0x1040), Some(arena.base() + 0x1040));
        assert_eq!(arena.touch(0x4000), None);
        assert_eq!(arena.addr(0x3fff), Some(arena.base() + 0x3fff));
    }

    #[test]
    fn concurrent_touch() {
        let arena = Arena::acquire(0x1000, false).unwrap();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let arena = &arena;
                s.spawn(move || {
                    for _ in 0..50 {
                        assert_eq!(arena.touch(0x40), Some(arena.base() + 0x40));
                    }
                });
            }
        });
        let byte = unsafe { *(arena.base() as *const u8).add(0x40) };
        assert_eq!(byte, 200);
    }
}
