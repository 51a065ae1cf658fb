//! Cross-process chunk channel
//!
//! One shared memory segment carries a chunk-index queue and the condition
//! variable its receiver sleeps on. Any number of senders connect by name.
//!
//! The receiver is also a [`Condition`]: the segment holds a shared trigger and a
//! wait set condition variable, so [`ChunkReceiver::wait_set`] gives a wait set
//! that senders in other processes wake, next to local conditions such as a
//! stop trigger.
//!
//! # Layout
//! - Header: magic, version, notification index, offsets of the parts below
//! - `ConditionVariableData` for [`ChunkReceiver::recv`] (cache-line aligned)
//! - `ConditionSlot` for the receiver's wait set
//! - `Trigger` raised on every send
//! - `LockFreeFifoQueue<u64, CHANNEL_QUEUE_CAPACITY>`
//!
//! All links are offsets from the segment start, so every process may map the
//! segment at a different address.

use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::condition::Condition;
use crate::condition_variable::{
    ConditionListener, ConditionVariableData, Deadline, Remaining, MAX_NOTIFICATIONS,
};
use crate::error::{Result, VenomError};
use crate::fifo::{LockFreeFifoQueue, PushOutcome, QueueFull, QueueFullPolicy};
use crate::cv_pool::ConditionSlot;
use crate::report;
use crate::shm::{align_up, AddressIndependent, RelativeRef, ShmRegion};
use crate::trigger::Trigger;
use crate::waitset::WaitSet;

/// Magic number for channel validation ("VNSY")
const CHANNEL_MAGIC: u32 = 0x564E5359;
const CHANNEL_VERSION: u32 = 2;

/// Chunk indices a channel can hold
pub const CHANNEL_QUEUE_CAPACITY: usize = 256;

type ChannelQueue = LockFreeFifoQueue<u64, CHANNEL_QUEUE_CAPACITY>;

/// Channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// What a send does when the receiver fell behind
    pub policy: QueueFullPolicy,
    /// Flag index the receiver waits on
    pub notification_index: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            policy: QueueFullPolicy::RejectNewest,
            notification_index: 0,
        }
    }
}

/// Channel header stored at the beginning of the segment
#[repr(C)]
struct ChannelHeader {
    /// Stored last; a valid magic means the rest is initialized
    magic: AtomicU32,
    version: u32,
    notification_index: u64,
    condition_variable: RelativeRef<ConditionVariableData>,
    home: RelativeRef<ConditionSlot>,
    trigger: RelativeRef<Trigger>,
    queue: RelativeRef<ChannelQueue>,
}

unsafe impl AddressIndependent for ChannelHeader {}

struct Layout {
    condition_variable: usize,
    home: usize,
    trigger: usize,
    queue: usize,
    total: usize,
}

impl Layout {
    const fn new() -> Self {
        let condition_variable = align_up(
            size_of::<ChannelHeader>(),
            align_of::<ConditionVariableData>(),
        );
        let home = align_up(
            condition_variable + size_of::<ConditionVariableData>(),
            align_of::<ConditionSlot>(),
        );
        let trigger = align_up(home + size_of::<ConditionSlot>(), align_of::<Trigger>());
        let queue = align_up(trigger + size_of::<Trigger>(), align_of::<ChannelQueue>());
        Self {
            condition_variable,
            home,
            trigger,
            queue,
            total: queue + size_of::<ChannelQueue>(),
        }
    }
}

/// Receiving side; owns the segment
pub struct ChunkReceiver {
    region: Arc<ShmRegion>,
    condition_variable: NonNull<ConditionVariableData>,
    home: RelativeRef<ConditionSlot>,
    trigger: NonNull<Trigger>,
    queue: NonNull<ChannelQueue>,
}

// SAFETY: the pointers target the receiver's own mapping, which lives as long as
// `region`; the targets synchronize through atomics only.
unsafe impl Send for ChunkReceiver {}
unsafe impl Sync for ChunkReceiver {}

impl ChunkReceiver {
    /// Create the segment `namespace` and lay out an empty channel in it
    pub fn create(namespace: &str, config: ChannelConfig) -> Result<Self> {
        if config.notification_index >= MAX_NOTIFICATIONS {
            return Err(report::recoverable(VenomError::NotificationIndexOutOfRange {
                index: config.notification_index,
                max: MAX_NOTIFICATIONS - 1,
            }));
        }

        let layout = Layout::new();
        let region = ShmRegion::create(namespace, layout.total)?;

        // SAFETY: the segment was just created and zeroed; no sender can pass the
        // magic check before the header is published below.
        let (condition_variable, home, trigger, queue) = unsafe {
            let condition_variable =
                region.place(layout.condition_variable as u64, ConditionVariableData::new())?;
            let home = region.place(layout.home as u64, ConditionSlot::new())?;
            let trigger = region.place(layout.trigger as u64, Trigger::new_shared())?;
            let queue = region.place(layout.queue as u64, ChannelQueue::try_new(config.policy)?)?;
            let header = region.place(
                0,
                ChannelHeader {
                    magic: AtomicU32::new(0),
                    version: CHANNEL_VERSION,
                    notification_index: config.notification_index as u64,
                    condition_variable,
                    home,
                    trigger,
                    queue,
                },
            )?;

            let condition_variable = region.get(condition_variable)?;
            condition_variable.attach(config.notification_index)?;
            region.get(header)?.magic.store(CHANNEL_MAGIC, Ordering::Release);

            (
                NonNull::from(condition_variable),
                home,
                NonNull::from(region.get(trigger)?),
                NonNull::from(region.get(queue)?),
            )
        };

        debug!(
            namespace,
            size = layout.total,
            policy = ?config.policy,
            notification_index = config.notification_index,
            "Created chunk channel"
        );
        Ok(Self {
            region: Arc::new(region),
            condition_variable,
            home,
            trigger,
            queue,
        })
    }

    /// Wait set blocking on the condition variable in the channel segment
    ///
    /// Attach the receiver itself to be woken by senders in any process; local
    /// conditions can be attached next to it. Only one such wait set exists at a
    /// time, a second call fails with [`VenomError::ConditionVariableInUse`].
    pub fn wait_set<'a, const CAPACITY: usize>(&self) -> Result<WaitSet<'a, CAPACITY>> {
        // SAFETY: `create` placed a ConditionSlot at `home`.
        unsafe { WaitSet::in_region(Arc::clone(&self.region), self.home) }
    }

    #[inline]
    fn queue(&self) -> &ChannelQueue {
        // SAFETY: points into `self.region`, see the Send/Sync impls.
        unsafe { self.queue.as_ref() }
    }

    #[inline]
    fn condition_variable(&self) -> &ConditionVariableData {
        // SAFETY: as above.
        unsafe { self.condition_variable.as_ref() }
    }

    /// Take the oldest chunk index without blocking
    #[inline]
    pub fn try_recv(&self) -> Option<u64> {
        self.queue().pop()
    }

    /// Take the oldest chunk index, blocking until one arrives or the deadline
    /// passes
    pub fn recv(&self, deadline: Deadline) -> Option<u64> {
        let countdown = deadline.start();
        let listener = ConditionListener::new(self.condition_variable());
        loop {
            if let Some(chunk) = self.try_recv() {
                return Some(chunk);
            }
            let fired = listener.wait_until(countdown);
            if fired.is_empty() && matches!(countdown.remaining(), Remaining::Expired) {
                return self.try_recv();
            }
        }
    }

    /// Number of queued chunk indices
    #[inline]
    pub fn len(&self) -> u64 {
        self.queue().size()
    }

    /// Check if no chunk index is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Maximum number of queued chunk indices
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.queue().capacity()
    }

    /// Name of the channel segment
    pub fn namespace(&self) -> &str {
        self.region.name()
    }
}

impl Condition for ChunkReceiver {
    fn trigger(&self) -> &Trigger {
        // SAFETY: points into `self.region`, see the Send/Sync impls.
        unsafe { self.trigger.as_ref() }
    }

    fn is_satisfied(&self) -> bool {
        !self.is_empty()
    }
}

/// Sending side; any number per channel
pub struct ChunkSender {
    region: ShmRegion,
    condition_variable: NonNull<ConditionVariableData>,
    trigger: NonNull<Trigger>,
    queue: NonNull<ChannelQueue>,
    notification_index: usize,
}

// SAFETY: see `ChunkReceiver`.
unsafe impl Send for ChunkSender {}
unsafe impl Sync for ChunkSender {}

impl ChunkSender {
    /// Map the channel `namespace` created by a receiver
    pub fn connect(namespace: &str) -> Result<Self> {
        let region = ShmRegion::open(namespace)?;

        // SAFETY: a receiver placed a header at offset 0; the magic tells whether
        // it finished, and every offset is bounds-checked by `get`.
        let (condition_variable, trigger, queue, notification_index) = unsafe {
            let header = region.get(RelativeRef::<ChannelHeader>::new(0))?;

            let magic = header.magic.load(Ordering::Acquire);
            if magic != CHANNEL_MAGIC {
                return Err(report::recoverable(VenomError::InvalidMagic {
                    expected: CHANNEL_MAGIC,
                    got: magic,
                }));
            }
            if header.version != CHANNEL_VERSION {
                return Err(report::recoverable(VenomError::VersionMismatch {
                    expected: CHANNEL_VERSION,
                    got: header.version,
                }));
            }

            let notification_index = header.notification_index as usize;
            if notification_index >= MAX_NOTIFICATIONS {
                return Err(report::recoverable(VenomError::NotificationIndexOutOfRange {
                    index: notification_index,
                    max: MAX_NOTIFICATIONS - 1,
                }));
            }

            (
                NonNull::from(region.get(header.condition_variable)?),
                NonNull::from(region.get(header.trigger)?),
                NonNull::from(region.get(header.queue)?),
                notification_index,
            )
        };

        debug!(namespace, notification_index, "Connected to chunk channel");
        Ok(Self {
            region,
            condition_variable,
            trigger,
            queue,
            notification_index,
        })
    }

    /// Queue a chunk index and wake the receiver
    ///
    /// Wakes both a blocked [`ChunkReceiver::recv`] and the receiver's wait set.
    pub fn try_send(&self, chunk: u64) -> std::result::Result<PushOutcome<u64>, QueueFull<u64>> {
        // SAFETY: all three point into `self.region`.
        let (queue, condition_variable, trigger) = unsafe {
            (
                self.queue.as_ref(),
                self.condition_variable.as_ref(),
                self.trigger.as_ref(),
            )
        };
        let outcome = queue.try_push(chunk)?;
        // The index was range-checked in `connect`.
        let _ = condition_variable.notify(self.notification_index);
        trigger.raise();
        Ok(outcome)
    }

    /// Name of the channel segment
    pub fn namespace(&self) -> &str {
        self.region.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::UserTrigger;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_channel_create_connect() {
        let namespace = "test_channel";
        let receiver = ChunkReceiver::create(namespace, ChannelConfig::default()).unwrap();
        let sender = ChunkSender::connect(namespace).unwrap();
        assert_eq!(sender.namespace(), namespace);
        assert_eq!(receiver.capacity(), CHANNEL_QUEUE_CAPACITY as u64);

        assert_eq!(sender.try_send(17), Ok(PushOutcome::Pushed));
        assert_eq!(receiver.len(), 1);
        assert_eq!(receiver.recv(Deadline::Immediate), Some(17));
        assert_eq!(receiver.recv(Deadline::Immediate), None);
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_recv_blocks_until_send() {
        let namespace = "test_channel_blocking";
        let receiver = ChunkReceiver::create(
            namespace,
            ChannelConfig {
                notification_index: 77,
                ..ChannelConfig::default()
            },
        )
        .unwrap();

        let sender = thread::spawn(move || {
            let sender = ChunkSender::connect(namespace).unwrap();
            thread::sleep(Duration::from_millis(20));
            sender.try_send(3).unwrap();
        });

        assert_eq!(receiver.recv(Deadline::Timeout(Duration::from_secs(10))), Some(3));
        sender.join().unwrap();
    }

    #[test]
    fn test_recv_times_out() {
        let receiver = ChunkReceiver::create("test_channel_timeout", ChannelConfig::default()).unwrap();
        assert_eq!(receiver.recv(Deadline::Timeout(Duration::from_millis(10))), None);
    }

    #[test]
    fn test_full_channel_follows_policy() {
        let namespace = "test_channel_full";
        let _receiver = ChunkReceiver::create(namespace, ChannelConfig::default()).unwrap();
        let sender = ChunkSender::connect(namespace).unwrap();
        for chunk in 0..CHANNEL_QUEUE_CAPACITY as u64 {
            sender.try_send(chunk).unwrap();
        }
        assert_eq!(sender.try_send(999), Err(QueueFull(999)));

        let namespace = "test_channel_overwrite";
        let receiver = ChunkReceiver::create(
            namespace,
            ChannelConfig {
                policy: QueueFullPolicy::DiscardOldest,
                ..ChannelConfig::default()
            },
        )
        .unwrap();
        let sender = ChunkSender::connect(namespace).unwrap();
        for chunk in 0..CHANNEL_QUEUE_CAPACITY as u64 {
            sender.try_send(chunk).unwrap();
        }
        assert_eq!(sender.try_send(999), Ok(PushOutcome::Evicted(0)));
        assert_eq!(receiver.try_recv(), Some(1));
    }

    #[test]
    fn test_connect_rejects_foreign_segment() {
        let namespace = "test_channel_foreign";
        let _region = ShmRegion::create(namespace, 4096).unwrap();
        assert!(matches!(
            ChunkSender::connect(namespace),
            Err(VenomError::InvalidMagic { expected: CHANNEL_MAGIC, got: 0 })
        ));
    }

    #[test]
    fn test_notification_index_is_checked() {
        let result = ChunkReceiver::create(
            "test_channel_bad_index",
            ChannelConfig {
                notification_index: MAX_NOTIFICATIONS,
                ..ChannelConfig::default()
            },
        );
        assert!(matches!(
            result,
            Err(VenomError::NotificationIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_connect_to_missing_channel() {
        assert!(matches!(
            ChunkSender::connect("test_channel_missing"),
            Err(VenomError::ShmOpen { .. })
        ));
    }

    #[test]
    fn test_receiver_waits_next_to_user_trigger() {
        let namespace = "test_channel_waitset";
        let receiver = ChunkReceiver::create(namespace, ChannelConfig::default()).unwrap();
        let stop = UserTrigger::new();

        let mut waitset = receiver.wait_set::<4>().unwrap();
        assert!(matches!(
            receiver.wait_set::<4>(),
            Err(VenomError::ConditionVariableInUse)
        ));
        waitset.attach_condition_with_id(&receiver, 1).unwrap();
        waitset.attach_condition_with_id(&stop, 2).unwrap();
        assert!(waitset.wait(Deadline::Immediate).is_empty());

        let sender = thread::spawn(move || {
            let sender = ChunkSender::connect(namespace).unwrap();
            thread::sleep(Duration::from_millis(20));
            sender.try_send(5).unwrap();
        });
        let fired = waitset.wait(Deadline::Timeout(Duration::from_secs(10)));
        sender.join().unwrap();
        assert_eq!(fired.len(), 1);
        assert!(fired[0].originates_from(&receiver));
        assert_eq!(receiver.try_recv(), Some(5));

        stop.fire();
        let fired = waitset.wait(Deadline::Timeout(Duration::from_secs(10)));
        assert_eq!(fired.len(), 1);
        assert!(fired[0].originates_from(&stop));

        // Data queued before the attach is reported right away.
        drop(waitset);
        ChunkSender::connect(namespace).unwrap().try_send(6).unwrap();
        let mut waitset = receiver.wait_set::<4>().unwrap();
        waitset.attach_condition(&receiver).unwrap();
        assert_eq!(waitset.wait(Deadline::Immediate).len(), 1);
    }
}
