// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The monitoring sidecar. Each worker appends dispatch records to its own
//! trace file; tasks opt in per task. One line is written per dispatch:
//!
//! ```text
//! <ts_norm> <tid> [<name> ] disp <N> st <S>[<sub>] [et <dt> [creat <ct>]] [<streams>]
//! ```
//!
//! Timestamps are microseconds since module init. The `<streams>` section
//! lists the dirty stream records as `sid,mode,state,counter,?!*;` tuples.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::limits,
    scheduler::task::TaskState,
};
use ::arrayvec::ArrayString;
use ::bitflags::bitflags;
use ::slab::Slab;
use ::std::{
    fs::File,
    io::{
        BufWriter,
        Write,
    },
    mem,
    sync::OnceLock,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Module-wide monitoring state, set once by [init].
static GLOBAL: OnceLock<MonGlobal> = OnceLock::new();

//======================================================================================================================
// Structures
//======================================================================================================================

bitflags! {
    /// What a monitored task records.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct MonTaskFlags: u32 {
        /// Record creation/start/stop/total timings.
        const TIMES = 1 << 0;
        /// Record stream events.
        const STREAMS = 1 << 1;
    }
}

bitflags! {
    /// Events recorded on a stream descriptor during one dispatch.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    struct EventFlags: u8 {
        /// An item passed through the descriptor.
        const MOVED = 1 << 0;
        /// The descriptor's holder woke the peer.
        const WAKEUP = 1 << 1;
        /// The descriptor's holder blocked on it.
        const BLOCKON = 1 << 2;
    }
}

/// The state of a stream descriptor, as traced.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum SdState {
    /// In use.
    InUse,
    /// Opened during the current dispatch.
    Opened,
    /// Closed; the record is freed once traced.
    Closed,
    /// Rebound to a different stream during the current dispatch.
    Replaced,
}

/// Link in the dirty list. The C original chains records through reserved
/// pointer values; here the "not linked"/"end of list" distinction is an
/// explicit option-plus-tag: a record with `dirty == None` is not on the
/// list, `Some(End)` terminates it.
#[derive(Clone, Copy, Debug)]
enum DirtyLink {
    /// End of the dirty list.
    End,
    /// Next record on the dirty list.
    Entry(usize),
}

/// Module-wide monitoring state.
struct MonGlobal {
    /// Prefix for trace-file names.
    prefix: ArrayString<{ limits::MON_FIX_MAX }>,
    /// Postfix for trace-file names.
    postfix: ArrayString<{ limits::MON_FIX_MAX }>,
    /// Reference timestamp; trace times are normalized against this.
    begin: Instant,
}

/// A worker's monitoring context: the trace file plus wait accounting.
pub(crate) struct MonContext {
    /// Worker id.
    #[allow(unused)]
    wid: usize,
    /// Where the monitoring data is written to.
    outfile: BufWriter<File>,
    /// How often a task has been dispatched on this worker.
    disp: u64,
    /// How often the worker waited on its mailbox.
    wait_cnt: u64,
    /// Cumulative mailbox wait time.
    wait_total: Duration,
    /// Start of the wait in progress, if any.
    wait_mark: Option<Instant>,
}

/// Monitor record of one task.
pub(crate) struct MonTask {
    /// Task name.
    name: ArrayString<{ limits::TASK_NAME_MAX }>,
    /// What to record.
    flags: MonTaskFlags,
    /// Task uid.
    tid: u32,
    /// Dispatch counter.
    disp: u64,
    /// Task creation time, normalized.
    creat: Duration,
    /// Start time of the last dispatch.
    start: Option<Instant>,
    /// Total execution time of the task.
    total: Duration,
    /// Whether the task blocked on reading, writing, or any-in.
    blockon: char,
    /// Stream records of the task's descriptors.
    streams: Slab<MonStream>,
    /// Head of the dirty list.
    dirty_head: DirtyLink,
}

/// Monitor record of one stream descriptor.
struct MonStream {
    /// Copy of the stream uid.
    sid: u32,
    /// Either 'r' or 'w'.
    mode: char,
    /// Descriptor state.
    state: SdState,
    /// Number of items processed.
    counter: u64,
    /// Events recorded during the current dispatch.
    events: EventFlags,
    /// Dirty-list link; None while the record is not on the list.
    dirty: Option<DirtyLink>,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Initializes the monitoring module: trace-file prefix/postfix (each
/// truncated to 16 characters) and the reference timestamp. Workers
/// started before this ran produce no trace files. Idempotent.
pub fn init(prefix: &str, postfix: &str) {
    let _ = GLOBAL.set(MonGlobal {
        prefix: bounded(prefix),
        postfix: bounded(postfix),
        begin: Instant::now(),
    });
}

/// Checks whether the monitoring module was initialized.
pub fn initialized() -> bool {
    GLOBAL.get().is_some()
}

/// Truncates a string into a bounded array string.
fn bounded<const CAP: usize>(s: &str) -> ArrayString<CAP> {
    let mut out: ArrayString<CAP> = ArrayString::new();
    for ch in s.chars() {
        if out.try_push(ch).is_err() {
            break;
        }
    }
    out
}

/// Normalizes a timestamp against the reference timestamp.
fn norm(instant: Instant) -> Duration {
    match GLOBAL.get() {
        Some(global) => instant.saturating_duration_since(global.begin),
        None => Duration::ZERO,
    }
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SdState {
    fn letter(&self) -> char {
        match self {
            SdState::InUse => 'I',
            SdState::Opened => 'O',
            SdState::Closed => 'C',
            SdState::Replaced => 'R',
        }
    }
}

impl MonContext {
    /// Creates the monitoring context of worker `wid`, opening its trace
    /// file. Returns None when the module was not initialized; a failed
    /// open is reported and monitoring is disabled for the worker.
    pub fn create(wid: usize) -> Option<MonContext> {
        let global: &MonGlobal = GLOBAL.get()?;
        let fname: String = format!("{}worker{:02}{}", global.prefix, wid, global.postfix);

        let outfile: File = match File::create(&fname) {
            Ok(file) => file,
            Err(e) => {
                warn!("create(): cannot open trace file {:?}: {:?}", fname, e);
                return None;
            },
        };

        Some(MonContext {
            wid,
            outfile: BufWriter::new(outfile),
            disp: 0,
            wait_cnt: 0,
            wait_total: Duration::ZERO,
            wait_mark: None,
        })
    }

    /// The worker starts waiting on its mailbox.
    pub fn worker_wait_start(&mut self) {
        self.wait_cnt += 1;
        self.wait_mark = Some(Instant::now());
    }

    /// The worker stops waiting on its mailbox.
    pub fn worker_wait_stop(&mut self) {
        if let Some(mark) = self.wait_mark.take() {
            self.wait_total += mark.elapsed();
        }
    }

    /// Reports the wait accounting of the worker.
    pub fn wait_stats(&self) -> (u64, Duration) {
        (self.wait_cnt, self.wait_total)
    }

    /// Writes a free-form `*** <msg>` line with a normalized timestamp.
    pub fn debug(&mut self, msg: &str) {
        let ts: Duration = norm(Instant::now());
        let _ = writeln!(self.outfile, "{} *** {}", ts.as_micros(), msg);
        let _ = self.outfile.flush();
    }

    /// A task enters dispatch on this worker.
    pub fn task_start(&mut self, mt: &mut MonTask) {
        if mt.flags.contains(MonTaskFlags::TIMES) {
            mt.start = Some(Instant::now());
        }

        // Until a blockon event says otherwise, a blocked dispatch counts
        // as waiting on any-in.
        mt.blockon = 'a';

        mt.disp += 1;
        self.disp += 1;
    }

    /// A task leaves dispatch in `state`: emit one trace record. Failed
    /// writes are dropped for this record.
    pub fn task_stop(&mut self, mt: &mut MonTask, state: TaskState) {
        let stop: Instant = Instant::now();
        let file: &mut BufWriter<File> = &mut self.outfile;

        if mt.flags.contains(MonTaskFlags::TIMES) {
            let _ = write!(file, "{} ", norm(stop).as_micros());
        }

        // General info: tid, name, dispatch count, state.
        let _ = write!(file, "{} ", mt.tid);
        if !mt.name.is_empty() {
            let _ = write!(file, "{} ", mt.name);
        }
        let _ = write!(file, "disp {} ", mt.disp);

        if state == TaskState::Blocked {
            let _ = write!(file, "st B{} ", mt.blockon);
        } else {
            let _ = write!(file, "st {} ", state as u8 as char);
        }

        // Times.
        if mt.flags.contains(MonTaskFlags::TIMES) {
            let et: Duration = match mt.start {
                Some(start) => stop.saturating_duration_since(start),
                None => Duration::ZERO,
            };
            mt.total += et;
            let _ = write!(file, "et {} ", et.as_micros());
            if state == TaskState::Zombie {
                let _ = write!(file, "creat {} ", mt.creat.as_micros());
            }
        }

        // Stream info.
        if mt.flags.contains(MonTaskFlags::STREAMS) {
            let _ = write!(file, "[");
            mt.drain_dirty(Some(&mut *file));
            let _ = write!(file, "] ");
        }

        let _ = writeln!(file);
    }
}

impl MonTask {
    /// Creates the monitor record for task `tid`.
    pub fn new(tid: u32, name: &str, flags: MonTaskFlags) -> MonTask {
        let creat: Duration = if flags.contains(MonTaskFlags::TIMES) {
            norm(Instant::now())
        } else {
            Duration::ZERO
        };

        MonTask {
            name: bounded(name),
            flags,
            tid,
            disp: 0,
            creat,
            start: None,
            total: Duration::ZERO,
            blockon: 'a',
            streams: Slab::new(),
            dirty_head: DirtyLink::End,
        }
    }

    /// A descriptor of this task opened a stream. Returns the record key,
    /// or None when stream events are not recorded.
    pub fn stream_open(&mut self, sid: u32, mode: char) -> Option<usize> {
        if !self.flags.contains(MonTaskFlags::STREAMS) {
            return None;
        }

        let key: usize = self.streams.insert(MonStream {
            sid,
            mode,
            state: SdState::Opened,
            counter: 0,
            events: EventFlags::empty(),
            dirty: None,
        });
        self.mark_dirty(key);
        Some(key)
    }

    /// An item passed through the descriptor.
    pub fn stream_moved(&mut self, key: usize) {
        self.streams[key].counter += 1;
        self.streams[key].events |= EventFlags::MOVED;
        self.mark_dirty(key);
    }

    /// The task blocked on the descriptor.
    pub fn stream_blockon(&mut self, key: usize) {
        self.streams[key].events |= EventFlags::BLOCKON;
        self.mark_dirty(key);

        // Track whether the task blocked on reading or writing.
        self.blockon = match self.streams[key].mode {
            'r' => 'i',
            'w' => 'o',
            mode => unreachable!("invalid descriptor mode: {}", mode),
        };
    }

    /// The task woke the peer blocked on the other end.
    pub fn stream_wakeup(&mut self, key: usize) {
        // No mark_dirty: a moved event on the same descriptor follows in
        // the same dispatch.
        self.streams[key].events |= EventFlags::WAKEUP;
    }

    /// The descriptor was closed.
    pub fn stream_close(&mut self, key: usize) {
        self.streams[key].state = SdState::Closed;
        self.mark_dirty(key);
    }

    /// The descriptor was rebound to stream `new_sid`.
    pub fn stream_replace(&mut self, key: usize, new_sid: u32) {
        self.streams[key].state = SdState::Replaced;
        self.streams[key].sid = new_sid;
        self.mark_dirty(key);
    }

    /// Drops the accumulated dirty records without tracing them. Used when
    /// the worker has no trace file.
    pub fn reset_dirty(&mut self) {
        self.drain_dirty(None::<&mut BufWriter<File>>);
    }

    /// Links a record into the dirty list, at most once per dispatch.
    fn mark_dirty(&mut self, key: usize) {
        if self.streams[key].dirty.is_none() {
            // Insert at the front of the dirty list.
            self.streams[key].dirty = Some(self.dirty_head);
            self.dirty_head = DirtyLink::Entry(key);
        }
    }

    /// Drains the dirty list: trace each record (when a writer is given),
    /// move Opened/Replaced records to InUse, free Closed records, reset
    /// event flags and links.
    fn drain_dirty<W: Write>(&mut self, mut file: Option<&mut W>) {
        let mut link: DirtyLink = mem::replace(&mut self.dirty_head, DirtyLink::End);

        while let DirtyLink::Entry(key) = link {
            let (next, freed): (DirtyLink, bool) = {
                let rec: &mut MonStream = &mut self.streams[key];

                if let Some(file) = file.as_mut() {
                    let _ = write!(
                        file,
                        "{},{},{},{},{}{}{};",
                        rec.sid,
                        rec.mode,
                        rec.state.letter(),
                        rec.counter,
                        if rec.events.contains(EventFlags::BLOCKON) { '?' } else { '-' },
                        if rec.events.contains(EventFlags::WAKEUP) { '!' } else { '-' },
                        if rec.events.contains(EventFlags::MOVED) { '*' } else { '-' },
                    );
                }

                // Unlink the record and update its state.
                let next: DirtyLink = match rec.dirty.take() {
                    Some(next) => next,
                    None => DirtyLink::End,
                };
                rec.events = EventFlags::empty();

                match rec.state {
                    SdState::Opened | SdState::Replaced => {
                        rec.state = SdState::InUse;
                        (next, false)
                    },
                    SdState::InUse => (next, false),
                    SdState::Closed => (next, true),
                }
            };

            if freed {
                self.streams.remove(key);
            }
            link = next;
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
