// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::scheduler::{
    lock,
    task::TaskRef,
};
use ::std::{
    collections::VecDeque,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Condvar,
        Mutex,
        MutexGuard,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Cross-worker messages. The mailbox is the only shared mutable channel
/// between workers; posting a message is the synchronisation point.
pub(crate) enum WorkerMsg {
    /// Place a newly runnable task on the receiving worker's ready queue.
    Assign(TaskRef),
    /// A task owned by the receiving worker was woken by a peer.
    Wakeup(TaskRef),
    /// Ask the receiving worker to terminate once it drains.
    Terminate,
}

/// Per-worker MPSC mailbox: any thread may post, only the owning worker
/// receives. A worker whose ready queue runs dry blocks here; this is the
/// only place a worker thread blocks in kernel space.
pub(crate) struct Mailbox {
    /// Pending messages, oldest first.
    queue: Mutex<VecDeque<WorkerMsg>>,
    /// Signalled on every post.
    avail: Condvar,
    /// Number of Assign messages posted.
    assigns: AtomicU64,
    /// Number of Wakeup messages posted.
    wakeups: AtomicU64,
}

/// Message delivery counters for one mailbox.
#[derive(Clone, Copy, Debug, Default)]
pub struct MailboxStats {
    /// Assign messages posted so far.
    pub assigns: u64,
    /// Wakeup messages posted so far.
    pub wakeups: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Mailbox {
    /// Creates an empty mailbox.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            avail: Condvar::new(),
            assigns: AtomicU64::new(0),
            wakeups: AtomicU64::new(0),
        }
    }

    /// Posts a message and wakes the owning worker if it is waiting.
    pub fn send(&self, msg: WorkerMsg) {
        match &msg {
            WorkerMsg::Assign(_) => {
                self.assigns.fetch_add(1, Ordering::Relaxed);
            },
            WorkerMsg::Wakeup(_) => {
                self.wakeups.fetch_add(1, Ordering::Relaxed);
            },
            WorkerMsg::Terminate => (),
        };

        let mut queue: MutexGuard<VecDeque<WorkerMsg>> = lock(&self.queue);
        queue.push_back(msg);
        self.avail.notify_one();
    }

    /// Takes the oldest pending message, if any.
    pub fn try_recv(&self) -> Option<WorkerMsg> {
        lock(&self.queue).pop_front()
    }

    /// Takes the oldest pending message, blocking until one arrives.
    pub fn recv(&self) -> WorkerMsg {
        let mut queue: MutexGuard<VecDeque<WorkerMsg>> = lock(&self.queue);
        loop {
            if let Some(msg) = queue.pop_front() {
                return msg;
            }
            queue = match self.avail.wait(queue) {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
        }
    }

    /// Reports how many messages of each kind were posted.
    pub fn stats(&self) -> MailboxStats {
        MailboxStats {
            assigns: self.assigns.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
