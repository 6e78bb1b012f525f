// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::lpel::{
    can_set_exclusive,
    get_num_cores,
    ErrorKind,
    Lpel,
    LpelConfig,
    LpelFlags,
    Mode,
    Stream,
    StreamDesc,
    TaskRef,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Configuration Boundaries
//======================================================================================================================

#[test]
fn init_rejects_zero_workers() {
    let cfg: LpelConfig = LpelConfig::new(0, 1, 0);
    match Lpel::init(&cfg) {
        Err(e) => assert_eq!(e.kind, ErrorKind::Inval),
        Ok(_) => panic!("zero workers should be rejected"),
    }
}

#[test]
fn init_rejects_oversubscribed_cores() {
    let cores: usize = match get_num_cores() {
        Ok(cores) => cores,
        Err(_) => return,
    };
    let cfg: LpelConfig = LpelConfig::new(2, cores, 1);
    match Lpel::init(&cfg) {
        Err(e) => assert_eq!(e.kind, ErrorKind::Inval),
        Ok(_) => panic!("oversubscription should be rejected"),
    }
}

#[test]
fn init_rejects_exclusive_without_pinned() {
    let mut cfg: LpelConfig = LpelConfig::new(1, 1, 0);
    cfg.flags = LpelFlags::EXCLUSIVE;
    match Lpel::init(&cfg) {
        Err(e) => assert_eq!(e.kind, ErrorKind::Inval),
        Ok(_) => panic!("EXCLUSIVE without PINNED should be rejected"),
    }
}

/// With EXCLUSIVE|PINNED but no elevation capability, init must fail with
/// the exclusive error and spawn no threads. Skipped when the test process
/// actually holds the capability.
#[test]
fn init_exclusive_denied_without_capability() {
    match can_set_exclusive() {
        Ok(false) => (),
        // Capability held or not probeable: nothing to assert here.
        _ => return,
    }

    let mut cfg: LpelConfig = LpelConfig::new(1, 1, 0);
    cfg.flags = LpelFlags::PINNED | LpelFlags::EXCLUSIVE;
    match Lpel::init(&cfg) {
        Err(e) => assert_eq!(e.kind, ErrorKind::Excl),
        Ok(_) => panic!("EXCLUSIVE without the capability should be rejected"),
    }
}

#[test]
fn task_create_rejects_unknown_worker() -> Result<()> {
    let lpel: Lpel = match Lpel::init(&common::config(1)) {
        Ok(lpel) => lpel,
        Err(e) => anyhow::bail!("failed to initialize runtime: {:?}", e),
    };
    match lpel.task_create(1, |_task| async {}, 0) {
        Err(e) => assert_eq!(e.kind, ErrorKind::Inval),
        Ok(_) => panic!("task on unknown worker should be rejected"),
    }
    Ok(())
}

//======================================================================================================================
// Stream Boundaries
//======================================================================================================================

#[test]
fn zero_capacity_stream_is_rejected() {
    match Stream::<u32>::create(0) {
        Err(e) => assert_eq!(e.kind, ErrorKind::Inval),
        Ok(_) => panic!("zero-capacity stream should be rejected"),
    }
}

/// Writing to a stream at capacity blocks the producer; reads unblock it.
/// With one more item than the buffer holds, completion of both tasks
/// proves the block/wakeup cycle.
#[test]
fn write_at_capacity_blocks_until_read() -> Result<()> {
    const CAPACITY: usize = 2;
    const ITEMS: u32 = 3;

    let mut lpel: Lpel = match Lpel::init(&common::config(2)) {
        Ok(lpel) => lpel,
        Err(e) => anyhow::bail!("failed to initialize runtime: {:?}", e),
    };

    let stream: Arc<Stream<u32>> = match Stream::create(CAPACITY) {
        Ok(stream) => stream,
        Err(e) => anyhow::bail!("failed to create stream: {:?}", e),
    };

    let received: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let producer: TaskRef = {
        let stream: Arc<Stream<u32>> = stream.clone();
        match lpel.task_create(
            0,
            move |task| async move {
                let tx: StreamDesc<u32> = StreamDesc::open(&task, &stream, Mode::Write);
                for i in 0..ITEMS {
                    tx.write(i).await;
                }
                tx.close();
            },
            0,
        ) {
            Ok(task) => task,
            Err(e) => anyhow::bail!("failed to create producer: {:?}", e),
        }
    };

    let consumer: TaskRef = {
        let stream: Arc<Stream<u32>> = stream.clone();
        let received: Arc<Mutex<Vec<u32>>> = received.clone();
        match lpel.task_create(
            1,
            move |task| async move {
                let rx: StreamDesc<u32> = StreamDesc::open(&task, &stream, Mode::Read);
                for _ in 0..ITEMS {
                    let item: u32 = rx.read().await;
                    received.lock().unwrap().push(item);
                }
                rx.close();
            },
            0,
        ) {
            Ok(task) => task,
            Err(e) => anyhow::bail!("failed to create consumer: {:?}", e),
        }
    };

    if let Err(e) = lpel.spawn() {
        anyhow::bail!("failed to spawn workers: {:?}", e);
    }
    lpel.task_run(&producer);
    lpel.task_run(&consumer);

    lpel.stop();
    lpel.cleanup();

    assert_eq!(received.lock().unwrap().clone(), vec![0, 1, 2]);
    Ok(())
}

/// A task spawning a task on its own worker places it on the local ready
/// queue directly: the only Assign message through the mailbox is the one
/// posted for the parent from the embedder thread.
#[test]
fn task_spawned_from_worker_lands_locally() -> Result<()> {
    let mut lpel: Lpel = match Lpel::init(&common::config(1)) {
        Ok(lpel) => lpel,
        Err(e) => anyhow::bail!("failed to initialize runtime: {:?}", e),
    };
    if let Err(e) = lpel.spawn() {
        anyhow::bail!("failed to spawn workers: {:?}", e);
    }
    let lpel: Arc<Lpel> = Arc::new(lpel);

    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let parent: TaskRef = {
        let lpel: Arc<Lpel> = lpel.clone();
        let done: Arc<AtomicBool> = done.clone();
        match lpel.clone().task_create(
            0,
            move |_task| async move {
                // Runs on worker 0 and spawns a sibling onto worker 0.
                let child: TaskRef = match lpel.task_create(
                    0,
                    move |_task| async move {
                        done.store(true, Ordering::Release);
                    },
                    0,
                ) {
                    Ok(task) => task,
                    Err(e) => panic!("failed to create child task: {:?}", e),
                };
                lpel.task_run(&child);
            },
            0,
        ) {
            Ok(task) => task,
            Err(e) => anyhow::bail!("failed to create parent task: {:?}", e),
        }
    };
    lpel.task_run(&parent);

    // The worker releases the parent's handle on the runtime once the
    // parent is reaped; reclaim exclusive ownership for the teardown.
    while Arc::strong_count(&lpel) > 1 {
        thread::sleep(Duration::from_millis(1));
    }
    let mut lpel: Lpel = match Arc::try_unwrap(lpel) {
        Ok(lpel) => lpel,
        Err(_) => panic!("runtime handle still shared"),
    };
    lpel.stop();
    lpel.cleanup();

    assert!(done.load(Ordering::Acquire), "child task never ran");

    // One Assign by mail for the parent; the child went onto the local
    // ready queue without a mailbox round trip.
    assert_eq!(lpel.mailbox_stats(0).unwrap().assigns, 1);
    Ok(())
}

/// Opening and closing an endpoint leaves the stream reusable: a second
/// holder can open the same endpoint afterwards.
#[test]
fn open_close_round_trip() -> Result<()> {
    let mut lpel: Lpel = match Lpel::init(&common::config(1)) {
        Ok(lpel) => lpel,
        Err(e) => anyhow::bail!("failed to initialize runtime: {:?}", e),
    };

    let stream: Arc<Stream<u32>> = match Stream::create(4) {
        Ok(stream) => stream,
        Err(e) => anyhow::bail!("failed to create stream: {:?}", e),
    };

    let task: TaskRef = {
        let stream: Arc<Stream<u32>> = stream.clone();
        match lpel.task_create(
            0,
            move |task| async move {
                let rx: StreamDesc<u32> = StreamDesc::open(&task, &stream, Mode::Read);
                rx.close();
                // The endpoint is free again.
                let rx: StreamDesc<u32> = StreamDesc::open(&task, &stream, Mode::Read);
                rx.close();
            },
            0,
        ) {
            Ok(task) => task,
            Err(e) => anyhow::bail!("failed to create task: {:?}", e),
        }
    };

    if let Err(e) = lpel.spawn() {
        anyhow::bail!("failed to spawn workers: {:?}", e);
    }
    lpel.task_run(&task);

    lpel.stop();
    lpel.cleanup();

    assert_eq!(stream.count(), 0);
    Ok(())
}
