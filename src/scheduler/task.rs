// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    monitor::MonTask,
    runtime::limits,
    scheduler::{
        lock,
        worker,
        worker::WorkerShared,
    },
};
use ::std::{
    any::Any,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{
            AtomicPtr,
            AtomicU32,
            AtomicU8,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of unique task identifiers.
static TASK_SEQ: AtomicU32 = AtomicU32::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Task life-cycle states. The discriminants are the letters used in
/// monitor trace lines.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskState {
    Created = b'C',
    Ready = b'R',
    Running = b'U',
    Blocked = b'B',
    Zombie = b'Z',
}

/// On which event a blocked task is waiting.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockedOn {
    Input = b'i',
    Output = b'o',
    Any = b'a',
}

/// Shared handle to a task control block.
pub type TaskRef = Arc<Task>;

/// TASK CONTROL BLOCK
///
/// State transitions are driven only by the owning worker, except for
/// Blocked -> Ready which is driven by the peer across a stream (see
/// [Task::deliver_wakeup]).
pub struct Task {
    /// Unique identifier.
    uid: u32,
    /// Requested stack size attribute. Coroutines are stackless; this is
    /// recorded for accounting only.
    stacksize: usize,
    /// Current state.
    state: AtomicU8,
    /// Event the task is waiting on while Blocked.
    blocked_on: AtomicU8,
    /// The worker owning this task.
    worker: Arc<WorkerShared>,
    /// Intrusive ready-queue link to the next task. Only ever touched by
    /// the owning worker.
    pub(crate) queue_next: AtomicPtr<Task>,
    /// Intrusive ready-queue link to the previous task.
    pub(crate) queue_prev: AtomicPtr<Task>,
    /// The coroutine body. Locked only by the owning worker for the
    /// duration of one dispatch.
    coroutine: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    /// Poll token, accessed concurrently by wakers.
    poll_token: AtomicU32,
    /// The endpoint which has new data and caused this task to be woken
    /// up. Set by the wake-up side, read and cleared by the task itself on
    /// resume.
    wakeup: Mutex<Option<WakeupSource>>,
    /// Accounting information.
    pub(crate) mon: Mutex<Option<MonTask>>,
}

/// Identity of the endpoint that fired a wakeup.
pub(crate) struct WakeupSource {
    /// Uid of the underlying stream.
    pub sid: u32,
    /// The woken task's descriptor on that stream.
    pub desc: Weak<dyn Any + Send + Sync>,
}

/// Future that suspends the current task for exactly one dispatch. The
/// task is re-polled only after its worker dispatches it again.
pub(crate) struct Suspend {
    suspended: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskState {
    /// Recovers a state from its trace letter.
    fn from_u8(v: u8) -> TaskState {
        match v {
            b'C' => TaskState::Created,
            b'R' => TaskState::Ready,
            b'U' => TaskState::Running,
            b'B' => TaskState::Blocked,
            b'Z' => TaskState::Zombie,
            _ => unreachable!("invalid task state: {}", v),
        }
    }
}

impl BlockedOn {
    fn from_u8(v: u8) -> BlockedOn {
        match v {
            b'i' => BlockedOn::Input,
            b'o' => BlockedOn::Output,
            b'a' => BlockedOn::Any,
            _ => unreachable!("invalid block reason: {}", v),
        }
    }
}

impl Task {
    /// Allocates a task control block owned by `worker`. The coroutine is
    /// attached separately so the body can capture the task's own handle.
    pub(crate) fn new(worker: Arc<WorkerShared>, stacksize: i32) -> TaskRef {
        let stacksize: usize = if stacksize <= 0 {
            limits::DEFAULT_STACK_SIZE
        } else {
            stacksize as usize
        };

        Arc::new(Task {
            uid: TASK_SEQ.fetch_add(1, Ordering::Relaxed),
            stacksize,
            state: AtomicU8::new(TaskState::Created as u8),
            blocked_on: AtomicU8::new(BlockedOn::Any as u8),
            worker,
            queue_next: AtomicPtr::new(::std::ptr::null_mut()),
            queue_prev: AtomicPtr::new(::std::ptr::null_mut()),
            coroutine: Mutex::new(None),
            poll_token: AtomicU32::new(0),
            wakeup: Mutex::new(None),
            mon: Mutex::new(None),
        })
    }

    /// Returns the unique identifier of the task.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Returns the stack size attribute of the task.
    pub fn stacksize(&self) -> usize {
        self.stacksize
    }

    /// Returns the worker owning this task.
    pub(crate) fn worker(&self) -> &Arc<WorkerShared> {
        &self.worker
    }

    /// Returns the current state of the task.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Returns the event a blocked task is waiting on.
    pub fn blocked_on(&self) -> BlockedOn {
        BlockedOn::from_u8(self.blocked_on.load(Ordering::Acquire))
    }

    /// Marks the running task blocked on the given event. The caller
    /// installs the task in a wait slot and suspends afterwards.
    pub(crate) fn block(&self, on: BlockedOn) {
        debug_assert_eq!(self.state(), TaskState::Running);
        self.blocked_on.store(on as u8, Ordering::Release);
        self.set_state(TaskState::Blocked);
    }

    /// Returns the current poll-token value.
    pub fn poll_token(&self) -> u32 {
        self.poll_token.load(Ordering::Acquire)
    }

    /// Attaches the coroutine body.
    pub(crate) fn set_coroutine(&self, coroutine: Pin<Box<dyn Future<Output = ()> + Send>>) {
        *lock(&self.coroutine) = Some(coroutine);
    }

    /// Runs one dispatch of the coroutine. Only the owning worker calls
    /// this; a completed coroutine reports Ready again.
    pub(crate) fn poll_coroutine(&self, ctx: &mut Context) -> Poll<()> {
        match lock(&self.coroutine).as_mut() {
            Some(coroutine) => coroutine.as_mut().poll(ctx),
            None => Poll::Ready(()),
        }
    }

    /// Releases the coroutine and its captured state.
    pub(crate) fn drop_coroutine(&self) {
        *lock(&self.coroutine) = None;
    }

    /// Delivers a wakeup to `woken`, possibly from another worker's
    /// thread. `token` is the poll-token value `woken` recorded when it
    /// blocked; the CAS ensures that of all concurrent wakeup attempts
    /// exactly one wins and the rest are dropped. The winner hands the
    /// task back to its owning worker: directly onto the local ready
    /// queue when the caller runs on that worker, through the owner's
    /// mailbox otherwise.
    pub(crate) fn deliver_wakeup(woken: &TaskRef, token: u32, src: WakeupSource) -> bool {
        if woken
            .poll_token
            .compare_exchange(token, token.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        *lock(&woken.wakeup) = Some(src);
        woken.set_state(TaskState::Ready);
        worker::make_ready(woken);
        true
    }

    /// Takes the wakeup source recorded by the winning waker. Meaningful
    /// only between wakeup delivery and the next suspension.
    pub(crate) fn take_wakeup(&self) -> Option<WakeupSource> {
        lock(&self.wakeup).take()
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the current task for one dispatch.
pub(crate) fn suspend() -> Suspend {
    Suspend { suspended: false }
}

/// Cooperatively yields the current task back to its worker. The task
/// stays runnable and is re-appended to the worker's ready queue.
pub async fn yield_now() {
    suspend().await
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _ctx: &mut Context) -> Poll<()> {
        if self.suspended {
            Poll::Ready(())
        } else {
            self.suspended = true;
            Poll::Pending
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
