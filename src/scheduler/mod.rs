// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub(crate) mod mailbox;
pub mod task;
pub(crate) mod taskqueue;
pub(crate) mod worker;

pub use self::{
    mailbox::MailboxStats,
    task::{
        yield_now,
        BlockedOn,
        Task,
        TaskRef,
        TaskState,
    },
};

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::{
    Mutex,
    MutexGuard,
};

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Locks a mutex, recovering the guard from a peer that panicked while
/// holding the lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(e) => e.into_inner(),
    }
}
