//! Delivery queue that announces new data through a trigger
//!
//! This is the shape a subscriber port takes: chunk indices go through a
//! [`LockFreeFifoQueue`], and every successful push raises the queue's trigger.
//! Attached to a wait set, the queue is reported whenever it holds data.

use crate::condition::Condition;
use crate::error::Result;
use crate::fifo::{LockFreeFifoQueue, PushOutcome, QueueFull, QueueFullPolicy};
use crate::trigger::Trigger;

pub struct ChunkQueue<T, const N: usize> {
    queue: LockFreeFifoQueue<T, N>,
    trigger: Trigger,
}

impl<T, const N: usize> ChunkQueue<T, N> {
    /// Create an empty, detached queue; an invalid `N` is fatal
    #[track_caller]
    pub fn new(policy: QueueFullPolicy) -> Self {
        Self {
            queue: LockFreeFifoQueue::new(policy),
            trigger: Trigger::new(),
        }
    }

    /// Create an empty, detached queue, returning construction errors as values
    pub fn try_new(policy: QueueFullPolicy) -> Result<Self> {
        Ok(Self {
            queue: LockFreeFifoQueue::try_new(policy)?,
            trigger: Trigger::new(),
        })
    }

    /// Push and raise the trigger on success
    pub fn try_push(&self, value: T) -> std::result::Result<PushOutcome<T>, QueueFull<T>> {
        let outcome = self.queue.try_push(value)?;
        self.trigger.raise();
        Ok(outcome)
    }

    /// Take the oldest value
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Number of queued values
    #[inline]
    pub fn size(&self) -> u64 {
        self.queue.size()
    }

    /// Check if no value is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Maximum number of queued values
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.queue.capacity()
    }

    /// Policy fixed at construction
    #[inline]
    pub fn policy(&self) -> QueueFullPolicy {
        self.queue.policy()
    }
}

impl<T, const N: usize> Condition for ChunkQueue<T, N> {
    fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    fn is_satisfied(&self) -> bool {
        !self.queue.is_empty()
    }
}
