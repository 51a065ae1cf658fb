//! End-to-end wait set scenarios across threads

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use venom_sync::{
    ChunkQueue, Condition, Deadline, QueueFullPolicy, Trigger, TriggerState, UniqueIdGenerator,
    UserTrigger, WaitSet,
};

#[test]
fn stop_trigger_ends_a_consumer_loop() {
    let queue = ChunkQueue::<u64, 16>::new(QueueFullPolicy::RejectNewest);
    let stop = UserTrigger::new();
    let consumed = AtomicU64::new(0);

    thread::scope(|scope| {
        let consumer = scope.spawn(|| {
            let mut waitset = WaitSet::<2>::new().unwrap();
            waitset.attach_condition(&queue).unwrap();
            waitset.attach_condition(&stop).unwrap();
            loop {
                for notification in waitset.wait(Deadline::Infinite) {
                    if notification.originates_from(&queue) {
                        while queue.pop().is_some() {
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                    } else if notification.originates_from(&stop) {
                        return;
                    }
                }
            }
        });

        for chunk in 0..10 {
            while queue.try_push(chunk).is_err() {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(1));
        }
        // Let the consumer catch up before stopping it.
        while !queue.is_empty() {
            thread::yield_now();
        }
        stop.fire();
        consumer.join().unwrap();
    });

    assert_eq!(consumed.load(Ordering::Relaxed), 10);
}

#[test]
fn many_conditions_report_in_attachment_order() {
    let ids = UniqueIdGenerator::new();
    let triggers: Vec<Trigger> = (0..32).map(|_| Trigger::from_generator(&ids)).collect();
    let mut waitset = WaitSet::<32>::new().unwrap();

    // Attach in reverse so attachment order differs from id order.
    for (event_id, trigger) in triggers.iter().enumerate().rev() {
        waitset
            .attach_condition_with_id(trigger, event_id as u64)
            .unwrap();
    }
    for trigger in &triggers {
        trigger.raise();
    }

    let event_ids: Vec<u64> = waitset
        .wait(Deadline::Immediate)
        .iter()
        .map(|n| n.event_id())
        .collect();
    let expected: Vec<u64> = (0..32).rev().collect();
    assert_eq!(event_ids, expected);
}

#[test]
fn raises_from_many_threads_are_all_observed() {
    const THREADS: usize = 8;
    let triggers: Vec<Trigger> = (0..THREADS).map(|_| Trigger::new()).collect();
    let mut waitset = WaitSet::<THREADS>::new().unwrap();
    for trigger in &triggers {
        waitset.attach_condition(trigger).unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    thread::scope(|scope| {
        for trigger in &triggers {
            scope.spawn(move || trigger.raise());
        }
        while seen.len() < THREADS {
            for notification in waitset.wait(Deadline::Timeout(Duration::from_secs(10))) {
                seen.insert(notification.trigger_id());
            }
        }
    });

    for trigger in &triggers {
        assert!(seen.contains(&trigger.id()));
        assert_eq!(trigger.state(), TriggerState::Attached);
    }
}

#[test]
fn trigger_outlives_its_wait_set() {
    let queue = ChunkQueue::<u64, 4>::new(QueueFullPolicy::DiscardOldest);
    {
        let mut waitset = WaitSet::<1>::new().unwrap();
        waitset.attach_condition(&queue).unwrap();
        assert_eq!(queue.trigger().state(), TriggerState::Attached);
    }
    assert_eq!(queue.trigger().state(), TriggerState::Detached);
    // Raising into a dropped wait set is a no-op.
    queue.try_push(1).unwrap();
    assert_eq!(queue.pop(), Some(1));
}
