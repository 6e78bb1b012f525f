// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    affinity,
    fail::{
        ErrorKind,
        Fail,
    },
};
use ::bitflags::bitflags;

//======================================================================================================================
// Structures
//======================================================================================================================

bitflags! {
    /// Runtime option flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct LpelFlags: u32 {
        /// Pin each worker thread to a distinct core.
        const PINNED = 1 << 0;
        /// Raise worker threads to real-time FIFO scheduling. Requires PINNED
        /// and the scheduling-elevation capability.
        const EXCLUSIVE = 1 << 1;
    }
}

/// Runtime configuration. Immutable after [crate::runtime::Lpel::init].
#[derive(Clone, Debug)]
pub struct LpelConfig {
    /// Number of worker threads.
    pub num_workers: usize,
    /// Number of cores reserved for worker threads.
    pub proc_workers: usize,
    /// Number of cores reserved for non-worker threads. Zero folds the
    /// others set back onto the worker cores.
    pub proc_others: usize,
    /// Option flags.
    pub flags: LpelFlags,
    /// Opaque node identifier, passed through to embedders.
    pub node: i32,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl LpelConfig {
    /// Creates a configuration with the given worker layout and no flags.
    pub fn new(num_workers: usize, proc_workers: usize, proc_others: usize) -> Self {
        Self {
            num_workers,
            proc_workers,
            proc_others,
            flags: LpelFlags::empty(),
            node: -1,
        }
    }

    /// Validates the configuration. Nothing is mutated on failure.
    pub(crate) fn check(&self) -> Result<(), Fail> {
        // Input sanity checks.
        if self.num_workers == 0 || self.proc_workers == 0 {
            return Err(Fail::new(ErrorKind::Inval, "need at least one worker and one worker core"));
        }

        // Check if there are enough processors (if we can check).
        if let Ok(proc_avail) = affinity::get_num_cores() {
            if self.proc_workers + self.proc_others > proc_avail {
                return Err(Fail::new(ErrorKind::Inval, "more cores requested than available"));
            }
        }

        // Additional requirements for the exclusive flag.
        if self.flags.contains(LpelFlags::EXCLUSIVE) {
            // Pinned flag must also be set.
            if !self.flags.contains(LpelFlags::PINNED) {
                return Err(Fail::new(ErrorKind::Inval, "EXCLUSIVE requires PINNED"));
            }
            // Check permissions to set exclusive (if we can check).
            if let Ok(can_rt) = affinity::can_set_exclusive() {
                if !can_rt {
                    return Err(Fail::new(
                        ErrorKind::Excl,
                        "process lacks the scheduling-elevation capability",
                    ));
                }
            }
        }

        Ok(())
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
