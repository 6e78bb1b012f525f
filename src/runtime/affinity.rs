// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    config::{
        LpelConfig,
        LpelFlags,
    },
    fail::{
        ErrorKind,
        Fail,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Core sets for worker and non-worker threads, derived from the validated
/// configuration: workers get cores `[0, proc_workers)`, others get
/// `[proc_workers, proc_workers + proc_others)` or fold back onto the worker
/// cores when `proc_others` is zero.
#[derive(Debug)]
pub(crate) struct CpuSets {
    /// Cores usable by worker threads when not pinned one-to-one.
    pub workers: Vec<usize>,
    /// Cores usable by non-worker threads.
    pub others: Vec<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CpuSets {
    /// Builds the core sets for the given configuration.
    pub fn create(cfg: &LpelConfig) -> Self {
        let workers: Vec<usize> = (0..cfg.proc_workers).collect();
        let others: Vec<usize> = if cfg.proc_others == 0 {
            // Distribute on the workers.
            (0..cfg.proc_workers).collect()
        } else {
            (cfg.proc_workers..cfg.proc_workers + cfg.proc_others).collect()
        };
        Self { workers, others }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Queries the number of available cores.
#[cfg(unix)]
pub fn get_num_cores() -> Result<usize, Fail> {
    let proc_avail: libc::c_long = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if proc_avail == -1 {
        return Err(Fail::new(ErrorKind::Fail, "_SC_NPROCESSORS_ONLN not available"));
    }
    Ok(proc_avail as usize)
}

/// Queries the number of available cores.
#[cfg(not(unix))]
pub fn get_num_cores() -> Result<usize, Fail> {
    match ::std::thread::available_parallelism() {
        Ok(n) => Ok(n.get()),
        Err(_) => Err(Fail::new(ErrorKind::Fail, "available parallelism not known")),
    }
}

/// Checks whether the process may raise threads to real-time scheduling
/// (holds CAP_SYS_NICE in its effective set).
#[cfg(target_os = "linux")]
pub fn can_set_exclusive() -> Result<bool, Fail> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: libc::c_int,
    }

    #[repr(C)]
    #[derive(Clone, Copy, Default)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
    const CAP_SYS_NICE: u32 = 23;

    let mut header: CapUserHeader = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data: [CapUserData; 2] = [CapUserData::default(); 2];

    // Obtain the capabilities of the process.
    let ret: libc::c_long = unsafe { libc::syscall(libc::SYS_capget, &mut header, data.as_mut_ptr()) };
    if ret != 0 {
        return Err(Fail::new(ErrorKind::Fail, "capget failed"));
    }

    Ok(data[0].effective & (1 << CAP_SYS_NICE) != 0)
}

/// Checks whether the process may raise threads to real-time scheduling.
#[cfg(not(target_os = "linux"))]
pub fn can_set_exclusive() -> Result<bool, Fail> {
    Err(Fail::new(ErrorKind::Fail, "capability probing not supported on this platform"))
}

/// Pins the calling thread: `core` in `[0, num_workers)` selects a worker
/// core, `-1` selects the others set. With EXCLUSIVE set, worker threads
/// are additionally promoted to real-time FIFO at the lowest priority
/// (best effort; the capability was validated at init).
#[cfg(target_os = "linux")]
pub(crate) fn assign_thread(cfg: &LpelConfig, sets: &CpuSets, core: i32) -> Result<(), Fail> {
    let tid: libc::pid_t = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };

    if core == -1 {
        // Assign an others-thread to the others cpuset.
        set_affinity(tid, &sets.others)?;
    } else {
        // Assign a worker thread.
        assert!(core >= 0 && (core as usize) < cfg.num_workers);

        if cfg.flags.contains(LpelFlags::PINNED) {
            // Assign to the specified core.
            set_affinity(tid, &[core as usize % cfg.proc_workers])?;

            // Make non-preemptible.
            if cfg.flags.contains(LpelFlags::EXCLUSIVE) {
                let param: libc::sched_param = libc::sched_param {
                    sched_priority: 1, // lowest real-time priority
                };
                if unsafe { libc::sched_setscheduler(tid, libc::SCHED_FIFO, &param) } != 0 {
                    // Best effort at this point.
                    warn!("assign_thread(): could not raise scheduling class for tid={:?}", tid);
                }
            }
        } else {
            // Assign along all worker cores.
            set_affinity(tid, &sets.workers)?;
        }
    }

    Ok(())
}

/// Pins the calling thread (no-op on platforms without affinity control).
#[cfg(not(target_os = "linux"))]
pub(crate) fn assign_thread(_cfg: &LpelConfig, _sets: &CpuSets, _core: i32) -> Result<(), Fail> {
    Ok(())
}

/// Applies a CPU affinity mask to the given thread.
#[cfg(target_os = "linux")]
fn set_affinity(tid: libc::pid_t, cores: &[usize]) -> Result<(), Fail> {
    let mut cpuset: libc::cpu_set_t = unsafe { ::std::mem::zeroed() };
    unsafe { libc::CPU_ZERO(&mut cpuset) };
    for core in cores {
        unsafe { libc::CPU_SET(*core, &mut cpuset) };
    }

    let res: libc::c_int =
        unsafe { libc::sched_setaffinity(tid, ::std::mem::size_of::<libc::cpu_set_t>(), &cpuset) };
    if res != 0 {
        return Err(Fail::new(ErrorKind::Assign, "sched_setaffinity failed"));
    }

    Ok(())
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::CpuSets;
    use crate::runtime::config::LpelConfig;

    #[test]
    fn others_set_folds_onto_workers() {
        let cfg: LpelConfig = LpelConfig::new(2, 2, 0);
        let sets: CpuSets = CpuSets::create(&cfg);
        assert_eq!(sets.workers, vec![0, 1]);
        assert_eq!(sets.others, vec![0, 1]);
    }

    #[test]
    fn others_set_follows_worker_cores() {
        let cfg: LpelConfig = LpelConfig::new(2, 2, 2);
        let sets: CpuSets = CpuSets::create(&cfg);
        assert_eq!(sets.workers, vec![0, 1]);
        assert_eq!(sets.others, vec![2, 3]);
    }
}
