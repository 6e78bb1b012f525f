// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Exports
//======================================================================================================================

pub mod affinity;
pub mod config;
pub mod fail;
pub mod limits;
pub mod logging;

pub use self::{
    affinity::{
        can_set_exclusive,
        get_num_cores,
    },
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
// Imports
//======================================================================================================================

use crate::{
    monitor,
    monitor::{
        MonTask,
        MonTaskFlags,
    },
    runtime::affinity::CpuSets,
    scheduler::{
        lock,
        mailbox::{
            MailboxStats,
            WorkerMsg,
        },
        task::{
            Task,
            TaskRef,
            TaskState,
        },
        worker,
        worker::WorkerShared,
    },
};
use ::std::{
    future::Future,
    sync::Arc,
    thread,
    thread::JoinHandle,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Configuration state shared with the worker threads. Immutable after
/// [Lpel::init].
struct LpelShared {
    /// The validated configuration.
    config: LpelConfig,
    /// Core sets derived from the configuration.
    cpusets: CpuSets,
}

/// The runtime handle: owns the worker pool and carries the validated
/// configuration through the lifecycle calls.
pub struct Lpel {
    /// Shared configuration state.
    shared: Arc<LpelShared>,
    /// Cross-thread faces of the workers, indexed by worker id.
    workers: Vec<Arc<WorkerShared>>,
    /// Join handles of spawned worker threads.
    handles: Vec<JoinHandle<()>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Lpel {
    /// Initialises the runtime: validates the configuration, derives the
    /// core sets, and wires the worker contexts. No threads run yet; on
    /// failure nothing is mutated.
    pub fn init(cfg: &LpelConfig) -> Result<Lpel, Fail> {
        logging::initialize();

        cfg.check()?;

        let cpusets: CpuSets = CpuSets::create(cfg);
        let workers: Vec<Arc<WorkerShared>> = (0..cfg.num_workers)
            .map(|wid| Arc::new(WorkerShared::new(wid)))
            .collect();

        debug!("init(): {} workers over {} cores", cfg.num_workers, cfg.proc_workers);

        Ok(Lpel {
            shared: Arc::new(LpelShared {
                config: cfg.clone(),
                cpusets,
            }),
            workers,
            handles: Vec::new(),
        })
    }

    /// Starts the worker threads. Each worker pins itself according to
    /// the configuration before entering its dispatch loop.
    pub fn spawn(&mut self) -> Result<(), Fail> {
        for worker in &self.workers {
            let shared: Arc<LpelShared> = self.shared.clone();
            let worker: Arc<WorkerShared> = worker.clone();

            let handle: JoinHandle<()> = thread::Builder::new()
                .name(format!("lpel-worker-{:02}", worker.wid()))
                .spawn(move || {
                    if let Err(e) = affinity::assign_thread(&shared.config, &shared.cpusets, worker.wid() as i32) {
                        // The runtime continues unpinned.
                        warn!("spawn(): worker {} not pinned: {:?}", worker.wid(), e);
                    }
                    worker::run(worker);
                })
                .map_err(|e| Fail::new(ErrorKind::Fail, &format!("cannot spawn worker thread: {}", e)))?;

            self.handles.push(handle);
        }

        Ok(())
    }

    /// Asks every worker to terminate. Workers drain their outstanding
    /// tasks before exiting.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.mailbox().send(WorkerMsg::Terminate);
        }
    }

    /// Waits for the workers to finish and releases their threads.
    pub fn cleanup(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Pins the calling thread to the given worker core, or to the others
    /// set if `core` is -1.
    pub fn thread_assign(&self, core: i32) -> Result<(), Fail> {
        affinity::assign_thread(&self.shared.config, &self.shared.cpusets, core)
    }

    /// Returns the number of workers.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Returns the opaque node identifier from the configuration.
    pub fn node(&self) -> i32 {
        self.shared.config.node
    }

    /// Creates a task bound to worker `wid`. The body receives the task's
    /// own handle; `stacksize <= 0` selects the default attribute. The
    /// task does not run until [Lpel::task_run].
    pub fn task_create<F, Fut>(&self, wid: usize, body: F, stacksize: i32) -> Result<TaskRef, Fail>
    where
        F: FnOnce(TaskRef) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let worker: &Arc<WorkerShared> = match self.workers.get(wid) {
            Some(worker) => worker,
            None => return Err(Fail::new(ErrorKind::Inval, "no such worker")),
        };

        let task: TaskRef = Task::new(worker.clone(), stacksize);
        let coroutine: Fut = body(task.clone());
        task.set_coroutine(Box::pin(coroutine));

        trace!("task_create(): task {} on worker {}", task.uid(), wid);
        Ok(task)
    }

    /// Attaches a monitor record to a task. A no-op unless
    /// [crate::monitor::init] ran; must precede [Lpel::task_run].
    pub fn task_monitor(&self, task: &TaskRef, name: &str, flags: MonTaskFlags) {
        assert_eq!(task.state(), TaskState::Created, "cannot monitor a started task");
        if !monitor::initialized() {
            return;
        }
        *lock(&task.mon) = Some(MonTask::new(task.uid(), name, flags));
    }

    /// Places a created task on its worker's queue. A worker running a
    /// task of its own lands on its local ready queue directly; any other
    /// caller goes through the owner's mailbox.
    pub fn task_run(&self, task: &TaskRef) {
        assert_eq!(task.state(), TaskState::Created, "task already started");
        task.set_state(TaskState::Ready);
        worker::assign(task);
    }

    /// Reports the message counters of worker `wid`'s mailbox.
    pub fn mailbox_stats(&self, wid: usize) -> Option<MailboxStats> {
        self.workers.get(wid).map(|worker| worker.mailbox().stats())
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// A dropped runtime stops and joins its workers if the embedder did not.
impl Drop for Lpel {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
            self.cleanup();
        }
    }
}
