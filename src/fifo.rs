//! Lock-Free MPMC (Multiple Producer Multiple Consumer) FIFO
//!
//! Moves small values (chunk indices, handles) between threads and processes
//! without locks.
//!
//! # Design
//! - `IndexedStorage` holds the values, two index queues hand out slot ownership
//! - Producers: claim a free index -> write slot -> publish index as used
//! - Consumers: claim a used index -> move value out -> release index as free
//! - Overwrite policy: when no free index exists, the oldest used index is
//!   reclaimed by the producer and its value handed back to the caller
//!
//! No operation takes a lock, so a participant dying half-way through an
//! operation can leak at most one slot but never block anybody else.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VenomError};
use crate::index_queue::IndexQueue;
use crate::report;
use crate::shm::AddressIndependent;
use crate::storage::IndexedStorage;

/// What a push does when every slot is occupied. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum QueueFullPolicy {
    /// Refuse the new value and hand it back
    #[default]
    RejectNewest = 0,
    /// Evict the oldest value to make room
    DiscardOldest = 1,
}

/// Successful push
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    /// Enqueued into a free slot
    Pushed,
    /// Enqueued after evicting the oldest value, which is returned
    Evicted(T),
}

impl<T> PushOutcome<T> {
    /// The evicted value, if the push made room by evicting one
    pub fn evicted(self) -> Option<T> {
        match self {
            PushOutcome::Pushed => None,
            PushOutcome::Evicted(value) => Some(value),
        }
    }

    /// Check if the push evicted the oldest value
    pub fn was_evicted(&self) -> bool {
        matches!(self, PushOutcome::Evicted(_))
    }
}

/// A push was refused; the value is handed back untouched
#[derive(PartialEq, Eq, thiserror::Error)]
#[error("Queue is full")]
pub struct QueueFull<T>(pub T);

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> QueueFull<T> {
    /// Get the refused value back
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<QueueFull<T>> for VenomError {
    fn from(_: QueueFull<T>) -> Self {
        VenomError::QueueFull
    }
}

/// Check a queue capacity for construction
pub(crate) fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(VenomError::InvalidCapacity {
            capacity,
            reason: "must not be zero",
        });
    }
    if !capacity.is_power_of_two() {
        return Err(VenomError::InvalidCapacity {
            capacity,
            reason: "must be a power of two",
        });
    }
    Ok(())
}

/// Fixed-capacity lock-free FIFO
///
/// Any number of producers and consumers may use a shared reference
/// concurrently. `N` must be a non-zero power of two. The layout holds no
/// pointers; with an address-independent `T` it can be placed in shared memory.
#[repr(C)]
pub struct LockFreeFifoQueue<T, const N: usize> {
    free_indices: IndexQueue<N>,
    used_indices: IndexQueue<N>,
    size: AtomicU64,
    policy: QueueFullPolicy,
    storage: IndexedStorage<T, N>,
}

impl<T, const N: usize> LockFreeFifoQueue<T, N> {
    /// Create an empty queue
    ///
    /// An invalid `N` is a programming error and is reported as fatal.
    #[track_caller]
    pub fn new(policy: QueueFullPolicy) -> Self {
        match Self::try_new(policy) {
            Ok(queue) => queue,
            Err(err) => report::fatal(err),
        }
    }

    /// Create an empty queue, returning construction errors as values
    pub fn try_new(policy: QueueFullPolicy) -> Result<Self> {
        validate_capacity(N)?;
        Ok(Self {
            free_indices: IndexQueue::new_full(),
            used_indices: IndexQueue::new_empty(),
            size: AtomicU64::new(0),
            policy,
            storage: IndexedStorage::new(),
        })
    }

    /// Maximum number of queued values
    #[inline(always)]
    pub const fn capacity(&self) -> u64 {
        N as u64
    }

    /// Policy fixed at construction
    #[inline]
    pub fn policy(&self) -> QueueFullPolicy {
        self.policy
    }

    /// Push a value (never blocks)
    ///
    /// With [`QueueFullPolicy::RejectNewest`] a full queue returns the value in
    /// [`QueueFull`]. With [`QueueFullPolicy::DiscardOldest`] the push always
    /// succeeds: the oldest value is moved out of its slot before the new value is
    /// written there and returned as [`PushOutcome::Evicted`].
    pub fn try_push(&self, value: T) -> std::result::Result<PushOutcome<T>, QueueFull<T>> {
        if let Some(index) = self.free_indices.pop() {
            self.publish(index, value);
            return Ok(PushOutcome::Pushed);
        }

        if self.policy == QueueFullPolicy::RejectNewest {
            return Err(QueueFull(value));
        }

        // Every round that finds both index queues empty saw another participant
        // holding a slot it is about to hand back, so the loop is lock-free.
        loop {
            if let Some(index) = self.used_indices.pop() {
                // SAFETY: the index came out of the used queue, so we own a
                // constructed slot.
                let evicted = unsafe { self.storage.take(index) };
                unsafe { self.storage.emplace(index, value) };
                self.used_indices.push(index);
                return Ok(PushOutcome::Evicted(evicted));
            }
            if let Some(index) = self.free_indices.pop() {
                self.publish(index, value);
                return Ok(PushOutcome::Pushed);
            }
            std::hint::spin_loop();
        }
    }

    #[inline]
    fn publish(&self, index: usize, value: T) {
        // SAFETY: the index came out of the free queue, so we own the slot and it
        // is unconstructed.
        unsafe { self.storage.emplace(index, value) };
        self.size.fetch_add(1, Ordering::AcqRel);
        self.used_indices.push(index);
    }

    /// Remove the oldest value (never blocks)
    pub fn pop(&self) -> Option<T> {
        let index = self.used_indices.pop()?;
        // SAFETY: we own the constructed slot until it goes back to the free queue.
        let value = unsafe { self.storage.take(index) };
        self.size.fetch_sub(1, Ordering::AcqRel);
        self.free_indices.push(index);
        Some(value)
    }

    /// Number of queued values
    ///
    /// A snapshot that may be stale under concurrent use, but always within
    /// `0..=capacity`.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire).min(N as u64)
    }

    /// Check if no value is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_indices.is_empty()
    }
}

// SAFETY: indices, counters and slots only; values are AddressIndependent.
unsafe impl<T: AddressIndependent, const N: usize> AddressIndependent for LockFreeFifoQueue<T, N> {}

impl<T, const N: usize> Drop for LockFreeFifoQueue<T, N> {
    fn drop(&mut self) {
        while let Some(index) = self.used_indices.pop() {
            // SAFETY: `&mut self`, nobody else holds an index; used slots are
            // constructed.
            unsafe { self.storage.destroy(index) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report;
    use proptest::prelude::*;
    use std::collections::{HashSet, VecDeque};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_empty_queue() {
        let queue = LockFreeFifoQueue::<u64, 8>::new(QueueFullPolicy::RejectNewest);
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_values_round_trip_bit_exact() {
        const N: usize = 16;
        let queue = LockFreeFifoQueue::<u64, N>::new(QueueFullPolicy::RejectNewest);
        let values = [0, 1, N as u64 - 1, u64::MAX];
        for value in values {
            assert_eq!(queue.try_push(value), Ok(PushOutcome::Pushed));
        }
        for value in values {
            assert_eq!(queue.pop(), Some(value));
        }
    }

    #[test]
    fn test_reject_policy_when_full() {
        let queue = LockFreeFifoQueue::<u32, 4>::new(QueueFullPolicy::RejectNewest);
        for i in 0..4 {
            assert!(queue.try_push(i).is_ok());
        }
        assert_eq!(queue.size(), 4);

        let rejected = queue.try_push(99).unwrap_err();
        assert_eq!(rejected.into_inner(), 99);
        assert!(matches!(VenomError::from(QueueFull(99)), VenomError::QueueFull));

        assert_eq!(queue.pop(), Some(0));
        assert_eq!(queue.try_push(4), Ok(PushOutcome::Pushed));
        assert_eq!(
            (0..4).map(|_| queue.pop().unwrap()).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_overwrite_policy_evicts_oldest() {
        let queue = LockFreeFifoQueue::<u32, 4>::new(QueueFullPolicy::DiscardOldest);
        for i in 0..4 {
            assert_eq!(queue.try_push(i), Ok(PushOutcome::Pushed));
        }
        assert_eq!(queue.try_push(4), Ok(PushOutcome::Evicted(0)));
        assert_eq!(queue.try_push(5), Ok(PushOutcome::Evicted(1)));
        assert_eq!(queue.size(), 4);
        assert_eq!(
            (0..4).map(|_| queue.pop().unwrap()).collect::<Vec<_>>(),
            vec![2, 3, 4, 5]
        );
        assert_eq!(queue.policy(), QueueFullPolicy::DiscardOldest);
    }

    #[test]
    fn test_remaining_values_are_dropped_with_queue() {
        let tracker = Arc::new(());
        {
            let queue = LockFreeFifoQueue::<Arc<()>, 4>::new(QueueFullPolicy::DiscardOldest);
            for _ in 0..6 {
                let _ = queue.try_push(Arc::clone(&tracker));
            }
            assert_eq!(Arc::strong_count(&tracker), 5);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_invalid_capacity() {
        assert!(matches!(
            LockFreeFifoQueue::<u8, 6>::try_new(QueueFullPolicy::RejectNewest),
            Err(VenomError::InvalidCapacity { capacity: 6, .. })
        ));

        let fatal_seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&fatal_seen);
        let result = report::with_fatal_hook(
            move |report| {
                assert!(matches!(report.error(), VenomError::InvalidCapacity { .. }));
                sink.fetch_add(1, Ordering::Relaxed);
            },
            || {
                catch_unwind(AssertUnwindSafe(|| {
                    LockFreeFifoQueue::<u8, 12>::new(QueueFullPolicy::RejectNewest)
                }))
            },
        );
        assert!(result.is_err());
        assert_eq!(fatal_seen.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_concurrent_producers_and_consumers() {
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: u64 = 20_000;

        let queue = Arc::new(LockFreeFifoQueue::<u64, 64>::new(QueueFullPolicy::RejectNewest));
        let barrier = Arc::new(Barrier::new(PRODUCERS as usize + CONSUMERS));
        let remaining = Arc::new(AtomicU64::new(PRODUCERS * PER_PRODUCER));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        let mut value = (p << 32) | i;
                        loop {
                            match queue.try_push(value) {
                                Ok(_) => break,
                                Err(QueueFull(v)) => {
                                    value = v;
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                let remaining = Arc::clone(&remaining);
                thread::spawn(move || {
                    barrier.wait();
                    let mut popped = Vec::new();
                    let mut last_seen = [None::<u64>; PRODUCERS as usize];
                    while remaining.load(Ordering::Acquire) > 0 {
                        match queue.pop() {
                            Some(value) => {
                                remaining.fetch_sub(1, Ordering::AcqRel);
                                let producer = (value >> 32) as usize;
                                let sequence = value & 0xFFFF_FFFF;
                                // Per-producer order holds within one consumer.
                                if let Some(last) = last_seen[producer] {
                                    assert!(sequence > last);
                                }
                                last_seen[producer] = Some(sequence);
                                popped.push(value);
                            }
                            None => thread::yield_now(),
                        }
                    }
                    popped
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        let mut all = HashSet::new();
        for consumer in consumers {
            for value in consumer.join().unwrap() {
                assert!(all.insert(value), "value {value:#x} popped twice");
            }
        }
        assert_eq!(all.len() as u64, PRODUCERS * PER_PRODUCER);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn test_concurrent_overwrite_never_duplicates() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 10_000;

        let queue = Arc::new(LockFreeFifoQueue::<u64, 8>::new(QueueFullPolicy::DiscardOldest));
        let evicted = Arc::new(AtomicU64::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let evicted = Arc::clone(&evicted);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let outcome = queue.try_push((p << 32) | i).unwrap();
                        if outcome.was_evicted() {
                            evicted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut popped = Vec::new();
                for _ in 0..PER_PRODUCER {
                    if let Some(value) = queue.pop() {
                        popped.push(value);
                    }
                }
                popped
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        let mut seen: HashSet<u64> = HashSet::new();
        for value in consumer.join().unwrap() {
            assert!(seen.insert(value));
        }
        while let Some(value) = queue.pop() {
            assert!(seen.insert(value));
        }
        // Every pushed value was either popped exactly once or evicted exactly once.
        assert_eq!(
            seen.len() as u64 + evicted.load(Ordering::Relaxed),
            PRODUCERS * PER_PRODUCER
        );
    }

    #[test]
    fn test_overwrite_succeeds_with_more_producers_than_slots() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: u64 = 50_000;

        let queue = Arc::new(LockFreeFifoQueue::<u64, 2>::new(QueueFullPolicy::DiscardOldest));
        let barrier = Arc::new(Barrier::new(PRODUCERS));
        let refused = Arc::new(AtomicU64::new(0));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                let refused = Arc::clone(&refused);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_PRODUCER {
                        if queue.try_push(i).is_err() {
                            refused.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        assert_eq!(refused.load(Ordering::Relaxed), 0);
        assert_eq!(queue.size(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u16),
        Pop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u16>().prop_map(Op::Push), Just(Op::Pop)]
    }

    proptest! {
        #[test]
        fn prop_matches_bounded_deque(ops in prop::collection::vec(op(), 0..200), discard in any::<bool>()) {
            let policy = if discard { QueueFullPolicy::DiscardOldest } else { QueueFullPolicy::RejectNewest };
            let queue = LockFreeFifoQueue::<u16, 8>::new(policy);
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(value) => {
                        let outcome = queue.try_push(value);
                        if model.len() < 8 {
                            prop_assert_eq!(outcome, Ok(PushOutcome::Pushed));
                            model.push_back(value);
                        } else if discard {
                            let oldest = model.pop_front();
                            prop_assert_eq!(outcome.ok().and_then(PushOutcome::evicted), oldest);
                            model.push_back(value);
                        } else {
                            prop_assert_eq!(outcome, Err(QueueFull(value)));
                        }
                    }
                    Op::Pop => prop_assert_eq!(queue.pop(), model.pop_front()),
                }
                prop_assert_eq!(queue.size(), model.len() as u64);
            }
        }
    }
}
