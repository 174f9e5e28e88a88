//! Utilities for controlling/inspecting the state of the current process.

use std::io::Read;
use nix::sched::{ CpuSet, sched_getaffinity, sched_setaffinity };
use nix::unistd::Pid;

use crate::{ Error, Result };

/// Utilities for controlling the state of the current process.
pub struct ProbeEnv;
impl ProbeEnv {
    const ISOLATED_PATH: &'static str =
        "/sys/devices/system/cpu/isolated";
    const SMT_PATH: &'static str =
        "/sys/devices/system/cpu/smt/control";
    const NR_HUGEPAGES_PATH: &'static str =
        "/proc/sys/vm/nr_hugepages";

    fn read_trimmed(path: &str) -> std::io::Result<String> {
        let mut f = std::fs::File::open(path)?;
        let mut res = String::new();
        f.read_to_string(&mut res)?;
        Ok(res.trim().to_string())
    }

    /// Return a string describing the set of isolated cores.
    pub fn sysfs_isolated() -> std::io::Result<String> {
        let res = Self::read_trimmed(Self::ISOLATED_PATH)?;
        match res.as_str() {
            "" => Ok("disabled".to_string()),
            _ => Ok(res),
        }
    }

    /// Returns true if SMT is enabled.
    pub fn sysfs_smt_enabled() -> std::io::Result<bool> {
        let res = Self::read_trimmed(Self::SMT_PATH)?;
        Ok(matches!(res.as_str(), "on" | "forceon"))
    }

    /// Return the number of reserved huge pages.
    pub fn procfs_nr_hugepages() -> std::io::Result<usize> {
        let res = Self::read_trimmed(Self::NR_HUGEPAGES_PATH)?;
        res.parse().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, res)
        })
    }

    /// Return the number of online CPUs.
    pub fn online_cpus() -> usize {
        match nix::unistd::sysconf(nix::unistd::SysconfVar::_NPROCESSORS_ONLN) {
            Ok(Some(n)) if n > 0 => n as usize,
            _ => 1,
        }
    }

    /// Return the list of CPUs the calling thread is allowed to run on.
    pub fn allowed_cpus() -> Vec<usize> {
        let cpus: Vec<usize> = match sched_getaffinity(Pid::from_raw(0)) {
            Ok(set) => (0..CpuSet::count())
                .filter(|cpu| set.is_set(*cpu).unwrap_or(false))
                .collect(),
            Err(_) => Vec::new(),
        };
        if cpus.is_empty() { vec![0] } else { cpus }
    }
}

impl ProbeEnv {
    /// Pin the calling thread to a particular core.
    pub fn pin_to_core(core: usize) -> Result<()> {
        let this_pid = Pid::from_raw(0);
        let mut cpuset = CpuSet::new();
        cpuset.set(core).map_err(|errno| Error::Affinity { cpu: core, errno })?;
        sched_setaffinity(this_pid, &cpuset)
            .map_err(|errno| Error::Affinity { cpu: core, errno })
    }

    /// Pin the calling thread to a particular core until the returned guard
    /// is dropped.
    pub fn pin_scoped(core: usize) -> Result<AffinityGuard> {
        let prev = sched_getaffinity(Pid::from_raw(0))
            .map_err(|errno| Error::Affinity { cpu: core, errno })?;
        Self::pin_to_core(core)?;
        Ok(AffinityGuard { prev, core })
    }
}

/// Restores the previous CPU mask of the calling thread when dropped.
#[must_use]
pub struct AffinityGuard {
    prev: CpuSet,
    core: usize,
}
impl AffinityGuard {
    /// The core the thread is pinned to.
    pub fn core(&self) -> usize { self.core }
}
impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if let Err(errno) = sched_setaffinity(Pid::from_raw(0), &self.prev) {
            tracing::warn!("couldn't restore cpu mask after pinning to {}: {}",
                self.core, errno);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pin_and_restore() {
        let before = ProbeEnv::allowed_cpus();
        let core = before[0];
        {
            let guard = ProbeEnv::pin_scoped(core).unwrap();
            assert_eq!(guard.core(), core);
            assert_eq!(ProbeEnv::allowed_cpus(), vec![core]);
        }
        assert_eq!(ProbeEnv::allowed_cpus(), before);
    }

    #[test]
    fn online() {
        assert!(ProbeEnv::online_cpus() >= 1);
        assert!(!ProbeEnv::allowed_cpus().is_empty());
    }
}
