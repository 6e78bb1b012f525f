// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::lpel::{
    Lpel,
    MailboxStats,
    Mode,
    Stream,
    StreamDesc,
    TaskRef,
};
use ::std::sync::{
    Arc,
    Mutex,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const ITEMS: u32 = 10_000;
const CAPACITY: usize = 4;

//======================================================================================================================
// Cross Worker
//======================================================================================================================

/// Producer on worker 0, consumer on worker 1, over a capacity-4 stream.
/// The consumer must receive every item in order, and both directions of
/// the blocking protocol must have crossed the worker boundary through the
/// mailboxes.
#[test]
fn cross_worker_pipe() -> Result<()> {
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

    // FIFO delivery of the whole sequence.
    let received: Vec<u32> = received.lock().unwrap().clone();
    let expected: Vec<u32> = (0..ITEMS).collect();
    assert_eq!(received, expected);

    // With a capacity-4 stream both sides must have blocked, so each
    // worker's mailbox carried at least one cross-worker wakeup.
    let stats0: MailboxStats = lpel.mailbox_stats(0).unwrap();
    let stats1: MailboxStats = lpel.mailbox_stats(1).unwrap();
    assert!(stats0.wakeups >= 1, "producer never woken through its mailbox");
    assert!(stats1.wakeups >= 1, "consumer never woken through its mailbox");

    Ok(())
}
