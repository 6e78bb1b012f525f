// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Bounded single-producer/single-consumer streams with a cooperative
//! blocking protocol. Reads and writes are non-blocking on the fast path;
//! the slow paths park the task in the endpoint's wait slot and a later
//! buffer operation by the peer delivers the wakeup, possibly across
//! workers.

//======================================================================================================================
// Exports
//======================================================================================================================

pub(crate) mod buffer;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    runtime::fail::Fail,
    scheduler::{
        lock,
        task,
        task::{
            BlockedOn,
            Task,
            TaskRef,
            WakeupSource,
        },
    },
    stream::buffer::Buffer,
};
use ::std::{
    any::Any,
    mem,
    sync::{
        atomic::{
            AtomicU32,
            AtomicU8,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Endpoint has never been opened.
const EP_UNOPENED: u8 = 0;
/// Endpoint is held by a task.
const EP_OPEN: u8 = 1;
/// Endpoint was closed by its holder.
const EP_CLOSED: u8 = 2;

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Source of unique stream identifiers.
static STREAM_SEQ: AtomicU32 = AtomicU32::new(0);

//======================================================================================================================
// Structures
//======================================================================================================================

/// Which end of a stream a descriptor operates on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
}

/// A task parked in an endpoint wait slot, together with the poll-token
/// value it recorded when it blocked. The token is what a waker must CAS
/// against; see [Task::deliver_wakeup].
struct Waiting {
    task: TaskRef,
    token: u32,
}

/// A bounded SPSC stream of items. At most one task may hold each
/// endpoint at a time.
pub struct Stream<T> {
    /// Unique identifier.
    uid: u32,
    /// The item buffer.
    buffer: Buffer<T>,
    /// Producer blocked on a full buffer, woken by the consumer.
    prod_waiting: Mutex<Option<Waiting>>,
    /// Consumer blocked on an empty buffer, woken by the producer.
    cons_waiting: Mutex<Option<Waiting>>,
    /// Life-cycle state of the producer endpoint.
    prod_state: AtomicU8,
    /// Life-cycle state of the consumer endpoint.
    cons_state: AtomicU8,
    /// The descriptor currently holding the producer endpoint.
    prod_sd: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    /// The descriptor currently holding the consumer endpoint.
    cons_sd: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

/// A task's handle to one endpoint of one stream. Descriptors may be
/// rebound to a different underlying stream (see [StreamDesc::replace]).
pub struct StreamDesc<T> {
    inner: Arc<SdInner<T>>,
}

struct SdInner<T> {
    /// The task owning this descriptor.
    task: TaskRef,
    /// Which end of the stream this descriptor operates on.
    mode: Mode,
    /// The underlying stream. Rebindable by the owning task only.
    stream: Mutex<Arc<Stream<T>>>,
    /// Key of the monitor record for this descriptor, when the owning
    /// task monitors stream events.
    mon: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<T: Send + 'static> Stream<T> {
    /// Creates a stream with the given buffer capacity. Zero capacity is
    /// rejected.
    pub fn create(capacity: usize) -> Result<Arc<Stream<T>>, Fail> {
        Ok(Arc::new(Stream {
            uid: STREAM_SEQ.fetch_add(1, Ordering::Relaxed),
            buffer: Buffer::new(capacity)?,
            prod_waiting: Mutex::new(None),
            cons_waiting: Mutex::new(None),
            prod_state: AtomicU8::new(EP_UNOPENED),
            cons_state: AtomicU8::new(EP_UNOPENED),
            prod_sd: Mutex::new(None),
            cons_sd: Mutex::new(None),
        }))
    }

    /// Returns the unique identifier of the stream.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Returns the number of items currently buffered (the fill level).
    pub fn count(&self) -> usize {
        self.buffer.count()
    }

    /// Returns the buffer capacity of the stream.
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Claims an endpoint for a new holder.
    fn claim_endpoint(&self, mode: Mode) {
        let state: &AtomicU8 = match mode {
            Mode::Read => &self.cons_state,
            Mode::Write => &self.prod_state,
        };
        let prev: u8 = state.swap(EP_OPEN, Ordering::AcqRel);
        assert!(prev != EP_OPEN, "endpoint of stream {} is already open", self.uid);
    }

    /// Releases an endpoint. The destroyer is the last closer: once both
    /// endpoints are closed the buffer must be drained.
    fn release_endpoint(&self, mode: Mode) {
        let (state, sd): (&AtomicU8, &Mutex<Option<Weak<dyn Any + Send + Sync>>>) = match mode {
            Mode::Read => (&self.cons_state, &self.cons_sd),
            Mode::Write => (&self.prod_state, &self.prod_sd),
        };
        *lock(sd) = None;
        state.store(EP_CLOSED, Ordering::Release);

        if self.prod_state.load(Ordering::Acquire) == EP_CLOSED
            && self.cons_state.load(Ordering::Acquire) == EP_CLOSED
        {
            assert!(
                self.buffer.is_empty(),
                "stream {} destroyed with items left in the buffer",
                self.uid
            );
        }
    }
}

impl<T: Send + 'static> StreamDesc<T> {
    /// Opens one endpoint of `stream` for `task`. Only one task may hold
    /// each endpoint at any given point in time.
    pub fn open(task: &TaskRef, stream: &Arc<Stream<T>>, mode: Mode) -> StreamDesc<T> {
        stream.claim_endpoint(mode);

        // Create the monitor record, or None if the task does not monitor
        // stream events.
        let mon: Option<usize> = lock(&task.mon)
            .as_mut()
            .and_then(|mt| mt.stream_open(stream.uid(), mode_letter(mode)));

        let sd: StreamDesc<T> = StreamDesc {
            inner: Arc::new(SdInner {
                task: task.clone(),
                mode,
                stream: Mutex::new(stream.clone()),
                mon,
            }),
        };

        // Register the descriptor on the stream for wakeup attribution.
        let inner_dyn: Arc<dyn Any + Send + Sync> = sd.inner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&inner_dyn);
        match mode {
            Mode::Read => *lock(&stream.cons_sd) = Some(weak),
            Mode::Write => *lock(&stream.prod_sd) = Some(weak),
        }

        sd
    }

    /// Returns the underlying stream of this descriptor.
    fn stream(&self) -> Arc<Stream<T>> {
        lock(&self.inner.stream).clone()
    }

    /// Blocking, consuming read from the stream. If the stream is empty,
    /// the task is suspended until the producer writes an item.
    pub async fn read(&self) -> T {
        assert_eq!(self.inner.mode, Mode::Read, "descriptor not opened for reading");

        loop {
            let stream: Arc<Stream<T>> = self.stream();

            // The buffer is checked and the wait slot installed under the
            // slot lock; the producer takes the same lock after its write,
            // so a concurrent item cannot slip past unobserved.
            let item: Option<T> = {
                let mut waiting = lock(&stream.cons_waiting);
                match stream.buffer.try_get() {
                    Some(item) => Some(item),
                    None => {
                        let task: &TaskRef = &self.inner.task;
                        task.block(BlockedOn::Input);
                        *waiting = Some(Waiting {
                            task: task.clone(),
                            token: task.poll_token(),
                        });
                        self.mon_blockon();
                        None
                    },
                }
            };

            match item {
                Some(item) => {
                    self.wake_peer(&stream, Mode::Write);
                    self.mon_moved();
                    return item;
                },
                None => {
                    task::suspend().await;
                    self.inner.task.take_wakeup();
                },
            }
        }
    }

    /// Blocking write to the stream. If the buffer is full, the task is
    /// suspended until the consumer reads an item, freeing space.
    pub async fn write(&self, item: T) {
        assert_eq!(self.inner.mode, Mode::Write, "descriptor not opened for writing");

        let mut item: T = item;
        loop {
            let stream: Arc<Stream<T>> = self.stream();

            let put: Result<(), T> = {
                let mut waiting = lock(&stream.prod_waiting);
                match stream.buffer.try_put(item) {
                    Ok(()) => Ok(()),
                    Err(rejected) => {
                        let task: &TaskRef = &self.inner.task;
                        task.block(BlockedOn::Output);
                        *waiting = Some(Waiting {
                            task: task.clone(),
                            token: task.poll_token(),
                        });
                        self.mon_blockon();
                        Err(rejected)
                    },
                }
            };

            match put {
                Ok(()) => {
                    self.wake_peer(&stream, Mode::Read);
                    self.mon_moved();
                    return;
                },
                Err(rejected) => {
                    item = rejected;
                    task::suspend().await;
                    self.inner.task.take_wakeup();
                },
            }
        }
    }

    /// Closes the endpoint held by this descriptor.
    pub fn close(self) {
        self.mon_close();
        let stream: Arc<Stream<T>> = self.stream();
        stream.release_endpoint(self.inner.mode);
    }

    /// Rebinds a descriptor opened for reading to another stream. The old
    /// stream is detached and reclaimed once unreferenced.
    pub fn replace(&self, snew: &Arc<Stream<T>>) {
        assert_eq!(self.inner.mode, Mode::Read, "only read descriptors can be replaced");

        // Claim the consumer endpoint of the new stream.
        snew.claim_endpoint(Mode::Read);
        let inner_dyn: Arc<dyn Any + Send + Sync> = self.inner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&inner_dyn);
        *lock(&snew.cons_sd) = Some(weak);

        // Detach from the old stream.
        let old: Arc<Stream<T>> = {
            let mut binding = lock(&self.inner.stream);
            mem::replace(&mut *binding, snew.clone())
        };
        *lock(&old.cons_sd) = None;
        old.cons_state.store(EP_CLOSED, Ordering::Release);

        self.mon_replace(snew.uid());
    }

    /// Wakes the peer parked on the other endpoint of `stream`, if any.
    /// `peer_mode` names the endpoint whose holder may be waiting. Exactly
    /// one waker wins the task's poll-token CAS; losers leave the slot
    /// untouched.
    fn wake_peer(&self, stream: &Arc<Stream<T>>, peer_mode: Mode) {
        let (waiting, peer_sd) = match peer_mode {
            Mode::Read => (&stream.cons_waiting, &stream.cons_sd),
            Mode::Write => (&stream.prod_waiting, &stream.prod_sd),
        };

        let woken: bool = {
            let mut slot = lock(waiting);
            match slot.as_ref() {
                Some(parked) => {
                    let desc: Weak<dyn Any + Send + Sync> = match lock(peer_sd).as_ref() {
                        Some(weak) => weak.clone(),
                        None => Weak::<SdInner<T>>::new(),
                    };
                    let src: WakeupSource = WakeupSource {
                        sid: stream.uid(),
                        desc,
                    };
                    if Task::deliver_wakeup(&parked.task, parked.token, src) {
                        *slot = None;
                        true
                    } else {
                        false
                    }
                },
                None => false,
            }
        };

        if woken {
            self.mon_wakeup();
        }
    }

    // Monitoring callbacks. All of them are no-ops unless the owning task
    // monitors stream events.

    fn mon_moved(&self) {
        if let Some(key) = self.inner.mon {
            if let Some(mt) = lock(&self.inner.task.mon).as_mut() {
                mt.stream_moved(key);
            }
        }
    }

    fn mon_blockon(&self) {
        if let Some(key) = self.inner.mon {
            if let Some(mt) = lock(&self.inner.task.mon).as_mut() {
                mt.stream_blockon(key);
            }
        }
    }

    fn mon_wakeup(&self) {
        if let Some(key) = self.inner.mon {
            if let Some(mt) = lock(&self.inner.task.mon).as_mut() {
                mt.stream_wakeup(key);
            }
        }
    }

    fn mon_close(&self) {
        if let Some(key) = self.inner.mon {
            if let Some(mt) = lock(&self.inner.task.mon).as_mut() {
                mt.stream_close(key);
            }
        }
    }

    fn mon_replace(&self, new_sid: u32) {
        if let Some(key) = self.inner.mon {
            if let Some(mt) = lock(&self.inner.task.mon).as_mut() {
                mt.stream_replace(key, new_sid);
            }
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Returns the monitor letter for a descriptor mode.
fn mode_letter(mode: Mode) -> char {
    match mode {
        Mode::Read => 'r',
        Mode::Write => 'w',
    }
}

/// Waits until any of the given read endpoints has data available and
/// returns the index of one that does. The task registers in every
/// consumer-waiting slot with a single poll-token snapshot; the first peer
/// that produces an item wins the token CAS and delivers the wakeup, and
/// the task unregisters from the remaining endpoints on resume.
pub async fn poll_any<T: Send + 'static>(task: &TaskRef, descs: &[&StreamDesc<T>]) -> usize {
    assert!(!descs.is_empty(), "cannot wait on an empty endpoint set");
    for sd in descs {
        assert_eq!(sd.inner.mode, Mode::Read, "poll_any takes read endpoints");
    }

    loop {
        let streams: Vec<Arc<Stream<T>>> = descs.iter().map(|sd| sd.stream()).collect();

        // Fast path: some endpoint already has data.
        if let Some(idx) = streams.iter().position(|s| !s.buffer.is_empty()) {
            return idx;
        }

        // Register in every consumer-waiting slot with the same token.
        let token: u32 = task.poll_token();
        task.block(BlockedOn::Any);
        for stream in &streams {
            let mut waiting = lock(&stream.cons_waiting);
            debug_assert!(waiting.is_none(), "consumer slot of stream {} occupied", stream.uid());
            *waiting = Some(Waiting {
                task: task.clone(),
                token,
            });
        }

        // An item may have arrived between the scan and the registration
        // without its producer seeing us in the slot. Deliver our own
        // wakeup through the regular CAS path, so that of this attempt and
        // any concurrent peer exactly one wins.
        for (idx, stream) in streams.iter().enumerate() {
            if !stream.buffer.is_empty() {
                let inner_dyn: Arc<dyn Any + Send + Sync> = descs[idx].inner.clone();
                let desc: Weak<dyn Any + Send + Sync> = Arc::downgrade(&inner_dyn);
                let src: WakeupSource = WakeupSource {
                    sid: stream.uid(),
                    desc,
                };
                Task::deliver_wakeup(task, token, src);
                break;
            }
        }

        task::suspend().await;

        // Resumed: find which endpoint fired, then unregister from the
        // slots the winner left untouched.
        let fired: Option<WakeupSource> = task.take_wakeup();
        for stream in &streams {
            let mut waiting = lock(&stream.cons_waiting);
            if let Some(parked) = waiting.as_ref() {
                if Arc::ptr_eq(&parked.task, task) && parked.token == token {
                    *waiting = None;
                }
            }
        }

        match fired {
            Some(src) => match streams.iter().position(|s| s.uid() == src.sid) {
                Some(idx) => return idx,
                // The descriptor was rebound since the wakeup fired; scan again.
                None => continue,
            },
            None => continue,
        }
    }
}
