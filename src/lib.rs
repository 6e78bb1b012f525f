// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A light-weight parallel execution layer: thousands of cooperative tasks
//! execute on a small fixed pool of worker threads pinned to CPU cores,
//! communicating through bounded single-producer/single-consumer streams.
//! Tasks block on stream endpoints rather than on kernel primitives; the
//! per-worker dispatch loop moves them between ready and blocked with a
//! single coroutine poll per dispatch.

#![deny(clippy::all)]

#[macro_use]
extern crate log;

pub mod monitor;
pub mod runtime;
pub mod scheduler;
pub mod stream;

pub use self::{
    runtime::{
        can_set_exclusive,
        get_num_cores,
        ErrorKind,
        Fail,
        Lpel,
        LpelConfig,
        LpelFlags,
    },
    scheduler::{
        yield_now,
        BlockedOn,
        MailboxStats,
        Task,
        TaskRef,
        TaskState,
    },
    stream::{
        poll_any,
        Mode,
        Stream,
        StreamDesc,
    },
};
