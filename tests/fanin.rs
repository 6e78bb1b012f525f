// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::lpel::{
    poll_any,
    Lpel,
    Mode,
    Stream,
    StreamDesc,
    TaskRef,
};
use ::std::{
    sync::{
        atomic::{
            AtomicU32,
            Ordering,
        },
        Arc,
        Mutex,
    },
    thread,
    time::Duration,
};

//======================================================================================================================
// Any-In Fan-In
//======================================================================================================================

/// One consumer waits any-in on three streams while three producers each
/// send one item, well separated in time so every item finds the consumer
/// blocked. The consumer must wake exactly once per item, the firing
/// endpoint must be identified correctly each time, and the poll-token
/// must advance by exactly one per wakeup.
#[test]
fn fan_in_wakes_once_per_item() -> Result<()> {
    let mut lpel: Lpel = match Lpel::init(&common::config(4)) {
        Ok(lpel) => lpel,
        Err(e) => anyhow::bail!("failed to initialize runtime: {:?}", e),
    };

    let streams: Vec<Arc<Stream<u32>>> = (0..3)
        .map(|_| match Stream::create(4) {
            Ok(stream) => stream,
            Err(e) => panic!("failed to create stream: {:?}", e),
        })
        .collect();

    let arrivals: Arc<Mutex<Vec<(usize, u32)>>> = Arc::new(Mutex::new(Vec::new()));
    let token_delta: Arc<AtomicU32> = Arc::new(AtomicU32::new(0));

    // Consumer on worker 0.
    let consumer: TaskRef = {
        let streams: Vec<Arc<Stream<u32>>> = streams.clone();
        let arrivals: Arc<Mutex<Vec<(usize, u32)>>> = arrivals.clone();
        let token_delta: Arc<AtomicU32> = token_delta.clone();
        match lpel.task_create(
            0,
            move |task| async move {
                let d0: StreamDesc<u32> = StreamDesc::open(&task, &streams[0], Mode::Read);
                let d1: StreamDesc<u32> = StreamDesc::open(&task, &streams[1], Mode::Read);
                let d2: StreamDesc<u32> = StreamDesc::open(&task, &streams[2], Mode::Read);

                let token_before: u32 = task.poll_token();
                for _ in 0..3 {
                    let descs: [&StreamDesc<u32>; 3] = [&d0, &d1, &d2];
                    let idx: usize = poll_any(&task, &descs).await;
                    let item: u32 = descs[idx].read().await;
                    arrivals.lock().unwrap().push((idx, item));
                }
                token_delta.store(task.poll_token() - token_before, Ordering::Relaxed);

                d0.close();
                d1.close();
                d2.close();
            },
            0,
        ) {
            Ok(task) => task,
            Err(e) => anyhow::bail!("failed to create consumer: {:?}", e),
        }
    };

    // One producer per remaining worker, staggered so the consumer is
    // parked in its any-in wait when each item arrives.
    let mut producers: Vec<TaskRef> = Vec::new();
    for i in 0..3usize {
        let stream: Arc<Stream<u32>> = streams[i].clone();
        let producer: TaskRef = match lpel.task_create(
            i + 1,
            move |task| async move {
                thread::sleep(Duration::from_millis(100 * (i as u64 + 1)));
                let tx: StreamDesc<u32> = StreamDesc::open(&task, &stream, Mode::Write);
                tx.write((i as u32 + 1) * 100).await;
                tx.close();
            },
            0,
        ) {
            Ok(task) => task,
            Err(e) => anyhow::bail!("failed to create producer {}: {:?}", i, e),
        };
        producers.push(producer);
    }

    if let Err(e) = lpel.spawn() {
        anyhow::bail!("failed to spawn workers: {:?}", e);
    }
    lpel.task_run(&consumer);
    for producer in &producers {
        lpel.task_run(producer);
    }

    lpel.stop();
    lpel.cleanup();

    // Three arrivals, each identifying the endpoint that actually fired.
    let arrivals: Vec<(usize, u32)> = arrivals.lock().unwrap().clone();
    assert_eq!(arrivals.len(), 3);
    for (idx, item) in &arrivals {
        assert_eq!(*item, (*idx as u32 + 1) * 100, "wrong endpoint reported for item {}", item);
    }

    // Exactly one poll-token increment per wakeup.
    assert_eq!(token_delta.load(Ordering::Relaxed), 3);

    Ok(())
}
