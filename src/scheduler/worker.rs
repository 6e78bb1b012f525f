// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The worker dispatch loop. Each worker is one OS thread owning a private
//! ready queue and a mailbox; tasks run cooperatively on the worker's
//! thread, one coroutine poll per dispatch.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    monitor::MonContext,
    scheduler::{
        lock,
        mailbox::{
            Mailbox,
            WorkerMsg,
        },
        task::{
            TaskRef,
            TaskState,
        },
        taskqueue::TaskQueue,
    },
};
use ::futures::task::noop_waker_ref;
use ::std::{
    cell::{
        Cell,
        RefCell,
    },
    rc::Rc,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

//======================================================================================================================
// Thread Local Variables
//======================================================================================================================

thread_local! {
    /// The worker context of the current thread, when the thread is a
    /// worker. Running tasks reach their worker through this to append
    /// local wakeups without a mailbox round trip.
    static CURRENT: RefCell<Option<Rc<WorkerLocal>>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// The cross-thread face of a worker: everything other threads may touch.
pub(crate) struct WorkerShared {
    /// Worker id.
    wid: usize,
    /// Inbound messages from other workers and the embedder.
    mailbox: Mailbox,
}

/// Worker state owned by the worker thread itself.
struct WorkerLocal {
    /// Worker id.
    wid: usize,
    /// Ready queue, private to this worker.
    ready: RefCell<TaskQueue>,
    /// Number of live tasks owned by this worker.
    live: Cell<usize>,
    /// Set once a Terminate message arrived.
    terminate: Cell<bool>,
    /// Monitoring context, present when the monitor module was initialized.
    mon: RefCell<Option<MonContext>>,
}

/// How one dispatch ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Dispatch {
    /// The coroutine returned: the task is a zombie.
    Exited,
    /// The task yielded voluntarily and stays runnable.
    Yielded,
    /// The task parked itself in a stream wait slot.
    Parked,
    /// The task blocked but a peer already woke it; the waker requeued it.
    Woken,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WorkerShared {
    /// Creates the shared face of worker `wid`.
    pub fn new(wid: usize) -> Self {
        Self {
            wid,
            mailbox: Mailbox::new(),
        }
    }

    pub fn wid(&self) -> usize {
        self.wid
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

impl WorkerLocal {
    fn new(wid: usize) -> Self {
        Self {
            wid,
            ready: RefCell::new(TaskQueue::new()),
            live: Cell::new(0),
            terminate: Cell::new(false),
            mon: RefCell::new(MonContext::create(wid)),
        }
    }

    /// Applies one mailbox message.
    fn apply(&self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Assign(task) => {
                trace!("worker {}: assign task {}", self.wid, task.uid());
                debug_assert_eq!(task.state(), TaskState::Ready);
                self.live.set(self.live.get() + 1);
                self.ready.borrow_mut().append(task);
            },
            WorkerMsg::Wakeup(task) => {
                trace!("worker {}: wakeup task {}", self.wid, task.uid());
                self.ready.borrow_mut().append(task);
            },
            WorkerMsg::Terminate => {
                trace!("worker {}: terminate requested", self.wid);
                self.terminate.set(true);
            },
        }
    }

    /// Dispatches `task` once: Ready -> Running, one coroutine poll, then
    /// classify how the dispatch ended.
    fn dispatch(&self, task: &TaskRef) -> Dispatch {
        task.set_state(TaskState::Running);

        if let (Some(ctx), Some(mt)) = (self.mon.borrow_mut().as_mut(), lock(&task.mon).as_mut()) {
            ctx.task_start(mt);
        }

        let mut poll_ctx: Context = Context::from_waker(noop_waker_ref());
        let poll: Poll<()> = task.poll_coroutine(&mut poll_ctx);

        let outcome: Dispatch = match poll {
            Poll::Ready(()) => {
                task.set_state(TaskState::Zombie);
                Dispatch::Exited
            },
            Poll::Pending => match task.state() {
                // A voluntary yield leaves the state untouched; the worker
                // moves the task back to Ready. Doing it here (and not in
                // the yield future) keeps a fast peer wakeup from racing
                // this classification.
                TaskState::Running => {
                    task.set_state(TaskState::Ready);
                    Dispatch::Yielded
                },
                TaskState::Blocked => Dispatch::Parked,
                TaskState::Ready => Dispatch::Woken,
                state => unreachable!("task {} suspended in state {:?}", task.uid(), state),
            },
        };

        match (self.mon.borrow_mut().as_mut(), lock(&task.mon).as_mut()) {
            (Some(ctx), Some(mt)) => ctx.task_stop(mt, task.state()),
            (None, Some(mt)) => mt.reset_dirty(),
            _ => (),
        }

        outcome
    }

    /// Reclaims a zombie task.
    fn destroy(&self, task: TaskRef) {
        trace!("worker {}: task {} reached zombie", self.wid, task.uid());
        task.drop_coroutine();
        *lock(&task.mon) = None;
        self.live.set(self.live.get() - 1);
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Places a newly runnable task with its owning worker: directly onto the
/// local ready queue when the calling thread is that worker (the preferred
/// path, with the live-task accounting the mailbox Assign would do on
/// receipt), through the owner's mailbox otherwise.
pub(crate) fn assign(task: &TaskRef) {
    let local: bool = CURRENT.with(|cur| match cur.borrow().as_ref() {
        Some(worker) if worker.wid == task.worker().wid() => {
            trace!("worker {}: assign task {} locally", worker.wid, task.uid());
            worker.live.set(worker.live.get() + 1);
            worker.ready.borrow_mut().append(task.clone());
            true
        },
        _ => false,
    });

    if !local {
        task.worker().mailbox().send(WorkerMsg::Assign(task.clone()));
    }
}

/// Hands a now-Ready task back to its owning worker: directly onto the
/// local ready queue when the calling thread is that worker, through the
/// owner's mailbox otherwise. This is the only path that requeues a
/// blocked-then-woken task.
pub(crate) fn make_ready(task: &TaskRef) {
    let local: bool = CURRENT.with(|cur| match cur.borrow().as_ref() {
        Some(worker) if worker.wid == task.worker().wid() => {
            worker.ready.borrow_mut().append(task.clone());
            true
        },
        _ => false,
    });

    if !local {
        task.worker().mailbox().send(WorkerMsg::Wakeup(task.clone()));
    }
}

/// The worker thread body: the dispatch loop of worker `shared.wid`.
pub(crate) fn run(shared: Arc<WorkerShared>) {
    let local: Rc<WorkerLocal> = Rc::new(WorkerLocal::new(shared.wid));
    CURRENT.with(|cur| *cur.borrow_mut() = Some(local.clone()));

    if let Some(ctx) = local.mon.borrow_mut().as_mut() {
        ctx.debug(&format!("Worker {} started.", local.wid));
    }
    debug!("worker {}: started", local.wid);

    loop {
        // (1) Drain the mailbox.
        while let Some(msg) = shared.mailbox.try_recv() {
            local.apply(msg);
        }

        if local.ready.borrow().is_empty() {
            // (2) Done once drained, terminated, and no task can come back.
            if local.terminate.get() && local.live.get() == 0 {
                break;
            }

            // (3) Nothing runnable: block on the mailbox.
            if let Some(ctx) = local.mon.borrow_mut().as_mut() {
                ctx.worker_wait_start();
            }
            let msg: WorkerMsg = shared.mailbox.recv();
            if let Some(ctx) = local.mon.borrow_mut().as_mut() {
                ctx.worker_wait_stop();
            }
            local.apply(msg);
            continue;
        }

        // (4)+(5) Dispatch the head task and account for the outcome.
        let task: TaskRef = match local.ready.borrow_mut().remove() {
            Some(task) => task,
            None => continue,
        };

        match local.dispatch(&task) {
            Dispatch::Exited => local.destroy(task),
            Dispatch::Yielded => local.ready.borrow_mut().append(task),
            // Parked tasks are pinned in a stream wait slot; woken tasks
            // were already requeued by the waker.
            Dispatch::Parked | Dispatch::Woken => (),
        }
    }

    // Reclaim any task still linked on the ready queue.
    local.ready.borrow_mut().iterate_remove(|_| true, |task| local.destroy(task));

    if let Some(ctx) = local.mon.borrow_mut().as_mut() {
        let (wait_cnt, wait_total) = ctx.wait_stats();
        ctx.debug(&format!(
            "Worker {} exited. wait_cnt {}, wait_time {}us.",
            local.wid,
            wait_cnt,
            wait_total.as_micros()
        ));
    }
    debug!("worker {}: exited", local.wid);

    CURRENT.with(|cur| *cur.borrow_mut() = None);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
