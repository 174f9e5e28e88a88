//! Module for interacting with `/proc/<pid>/pagemap`.

use std::os::fd::{ AsRawFd, FromRawFd, OwnedFd };
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::Pid;

use crate::oracle::Translate;
use crate::{ Error, Result };

/// An entry in '/proc/<pid>/pagemap'.
#[derive(Clone, Copy, Debug)]
pub struct PageMapEntry(pub u64);
impl PageMapEntry {
    const NUM_BYTES: usize = 8;
    pub fn present(&self) -> bool { (self.0 & (1 << 63)) != 0 }
    pub fn swapped(&self) -> bool { (self.0 & (1 << 62)) != 0 }
    pub fn exclusive(&self) -> bool { (self.0 & (1 << 56)) != 0 }
    pub fn soft_dirty(&self) -> bool { (self.0 & (1 << 55)) != 0 }
    pub fn pfn(&self) -> usize {
        self.0 as usize & ((1 << 55) - 1)
    }
}

/// Wrapper for interacting with '/proc/<pid>/pagemap'.
///
/// Entries are always reported at 4KiB granularity (even for huge pages),
/// so this works for any arena. Reading PFNs requires `CAP_SYS_ADMIN`.
pub struct PageMap {
    fd: OwnedFd,
}
impl PageMap {
    const NUM_OFFSET_BITS: usize = 12;

    /// Open the pagemap for the current process.
    pub fn open_self() -> Result<Self> {
        Self::open_path("/proc/self/pagemap")
    }

    /// Open the pagemap for some other process.
    pub fn open(pid: Pid) -> Result<Self> {
        Self::open_path(&format!("/proc/{}/pagemap", pid))
    }

    fn open_path(path: &str) -> Result<Self> {
        let raw_fd = nix::fcntl::open(path, OFlag::O_RDONLY, Mode::empty())
            .map_err(std::io::Error::from)?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };
        Ok(Self { fd })
    }

    /// Read the pagemap entry for the page containing `vaddr`.
    pub fn entry(&self, vaddr: usize) -> Result<PageMapEntry> {
        let mut buf = [0u8; 8];
        let vfn  = vaddr >> Self::NUM_OFFSET_BITS;
        let foff = (vfn * PageMapEntry::NUM_BYTES) as i64;
        let n = nix::sys::uio::pread(self.fd.as_raw_fd(), &mut buf, foff)
            .map_err(|_| Error::Translation {
                vaddr, reason: "couldn't read pagemap entry"
            })?;
        if n != buf.len() {
            return Err(Error::Translation {
                vaddr, reason: "short read from pagemap"
            });
        }
        Ok(PageMapEntry(u64::from_le_bytes(buf)))
    }

    /// Resolve the given virtual address into a physical address.
    ///
    /// The caller is expected to have touched `vaddr` beforehand.
    pub fn resolve_paddr(&self, vaddr: usize) -> Result<usize> {
        let entry = self.entry(vaddr)?;
        if !entry.present() {
            return Err(Error::Translation {
                vaddr, reason: "page not present"
            });
        }
        if entry.pfn() == 0 {
            return Err(Error::Translation {
                vaddr, reason: "got PFN 0 from page map (do you have permission?)"
            });
        }
        let paddr = (
            (entry.pfn() << Self::NUM_OFFSET_BITS) |
            (vaddr & ((1 << Self::NUM_OFFSET_BITS) - 1))
        );
        Ok(paddr)
    }
}

impl Translate for PageMap {
    fn translate(&self, vaddr: usize) -> Result<usize> {
        self.resolve_paddr(vaddr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entry_bits() {
        let e = PageMapEntry((1 << 63) | (1 << 55) | 0x1234);
        assert!(e.present());
        assert!(!e.swapped());
        assert!(e.soft_dirty());
        assert_eq!(e.pfn(), 0x1234);
    }

    #[test]
    fn open_self() {
        // Unprivileged readers can open the file; they just see PFN 0.
        let pm = PageMap::open_self().unwrap();
        let x = Box::new(0xdeadu64);
        let vaddr = &*x as *const u64 as usize;
        match pm.resolve_paddr(vaddr) {
            Ok(paddr) => assert_eq!(paddr & 0xfff, vaddr & 0xfff),
            Err(Error::Translation { vaddr: v, .. }) => assert_eq!(v, vaddr),
            Err(e) => panic!("unexpected error {}", e),
        }
    }
}
