//! Wait Set Demo
//!
//! Two producer threads feed chunk queues while the main thread waits on both
//! queues and a stop trigger through a single wait set.

use std::thread;
use std::time::Duration;

use venom_sync::{ChunkQueue, Deadline, QueueFullPolicy, UserTrigger, WaitSet};

const CHUNKS_PER_PRODUCER: u64 = 5;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let fast = ChunkQueue::<u64, 8>::new(QueueFullPolicy::DiscardOldest);
    let slow = ChunkQueue::<u64, 8>::new(QueueFullPolicy::RejectNewest);
    let stop = UserTrigger::new();

    let mut waitset = match WaitSet::<3>::new() {
        Ok(waitset) => waitset,
        Err(e) => {
            eprintln!("[WaitSet] Failed to create wait set: {}", e);
            std::process::exit(1);
        }
    };
    for (event_id, result) in [
        (1, waitset.attach_condition_with_id(&fast, 1)),
        (2, waitset.attach_condition_with_id(&slow, 2)),
        (0, waitset.attach_condition_with_id(&stop, 0)),
    ] {
        if let Err(e) = result {
            eprintln!("[WaitSet] Failed to attach event {}: {}", event_id, e);
            std::process::exit(1);
        }
    }

    thread::scope(|scope| {
        scope.spawn(|| {
            for chunk in 0..CHUNKS_PER_PRODUCER {
                let _ = fast.try_push(chunk);
                thread::sleep(Duration::from_millis(10));
            }
        });
        scope.spawn(|| {
            for chunk in 0..CHUNKS_PER_PRODUCER {
                let _ = slow.try_push(100 + chunk);
                thread::sleep(Duration::from_millis(35));
            }
            stop.fire();
        });

        let mut received = 0;
        'outer: loop {
            for notification in waitset.wait(Deadline::Timeout(Duration::from_secs(5))) {
                match notification.event_id() {
                    1 => {
                        while let Some(chunk) = fast.pop() {
                            println!("[WaitSet] fast queue -> chunk {}", chunk);
                            received += 1;
                        }
                    }
                    2 => {
                        while let Some(chunk) = slow.pop() {
                            println!("[WaitSet] slow queue -> chunk {}", chunk);
                            received += 1;
                        }
                    }
                    _ => break 'outer,
                }
            }
        }

        // Anything that raced with the stop trigger.
        while let Some(chunk) = fast.pop().or_else(|| slow.pop()) {
            println!("[WaitSet] drained chunk {}", chunk);
            received += 1;
        }
        println!("[WaitSet] Received {} chunks", received);
    });
}
