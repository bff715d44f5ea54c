#![deny(unsafe_op_in_unsafe_fn)]

use serde::{Deserialize, Serialize};

pub mod discriminator;

#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
#[cfg(any(target_os = "linux", target_os = "android"))]
use nix::unistd::Pid;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum CacheStatus {
    Hit,
    Miss,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn core_set(core: usize) -> Result<CpuSet, nix::Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    Ok(cpu_set)
}

/// Pins the calling thread, returns the previous affinity.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_affinity(cpu_set: &CpuSet) -> Result<CpuSet, nix::Error> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    sched_setaffinity(Pid::from_raw(0), cpu_set)?;
    Ok(old)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn restore_affinity(cpu_set: &CpuSet) {
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), cpu_set) {
        log::warn!("failed to restore cpu affinity: {}", e);
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;

    #[test]
    fn core_set_holds_one_core() {
        let set = core_set(0).unwrap();
        assert!(set.is_set(0).unwrap());
        assert!(!set.is_set(1).unwrap());
        assert!(core_set(CpuSet::count()).is_err());
    }

    #[test]
    fn affinity_is_restored() {
        let current = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let old = set_affinity(&current).unwrap();
        restore_affinity(&old);
        let after = sched_getaffinity(Pid::from_raw(0)).unwrap();
        for core in 0..CpuSet::count() {
            assert_eq!(after.is_set(core).unwrap(), old.is_set(core).unwrap());
        }
    }
}
