//! VenomSync - lock-free queues and wait sets for zero-copy shared memory IPC
//!
//! Producers hand chunk indices to consumers through fixed-capacity lock-free
//! queues and wake them through a condition variable that lives in shared memory
//! and never takes a lock. A [`WaitSet`] aggregates many event sources into one
//! blocking wait.
//!
//! # Architecture
//!
//! - **Queues**: [`LockFreeFifoQueue`] (MPMC, lock-free, reject or overwrite when
//!   full) and [`SpscSofi`] (SPSC, wait-free, always overwrites)
//! - **Signalling**: [`ConditionVariableData`] holds persistent flag bits and a
//!   futex word; [`ConditionNotifier`] raises a flag, [`ConditionListener`] waits
//! - **Aggregation**: a [`Trigger`] inside a data source is attached to a
//!   [`WaitSet`], which reports fired conditions in attachment order
//! - **Shared memory**: [`ShmRegion`] places [`AddressIndependent`] types and links
//!   them by [`RelativeRef`] offsets; [`ChunkReceiver`] / [`ChunkSender`] build a
//!   cross-process channel on top
//! - **Cross-process waiting**: a wait set built over a [`ConditionSlot`] in a
//!   region is woken by shared triggers in the same region from every process;
//!   [`ChunkReceiver::wait_set`] sets one up for a channel
//!
//! ```
//! use venom_sync::{ChunkQueue, Deadline, QueueFullPolicy, UserTrigger, WaitSet};
//!
//! let queue = ChunkQueue::<u64, 16>::new(QueueFullPolicy::RejectNewest);
//! let stop = UserTrigger::new();
//!
//! let mut waitset = WaitSet::<2>::new()?;
//! waitset.attach_condition(&queue)?;
//! waitset.attach_condition(&stop)?;
//!
//! queue.try_push(7).unwrap();
//! for notification in waitset.wait(Deadline::Infinite) {
//!     if notification.originates_from(&queue) {
//!         assert_eq!(queue.pop(), Some(7));
//!     }
//! }
//! # Ok::<(), venom_sync::VenomError>(())
//! ```

pub mod chunk_queue;
pub mod channel;
pub mod condition;
pub mod condition_variable;
mod cv_pool;
pub mod error;
pub mod fifo;
mod futex;
mod index_queue;
pub mod report;
pub mod shm;
pub mod sofi;
pub mod storage;
pub mod trigger;
pub mod unique_id;
pub mod waitset;

pub use channel::{ChannelConfig, ChunkReceiver, ChunkSender, CHANNEL_QUEUE_CAPACITY};
pub use chunk_queue::ChunkQueue;
pub use condition::{Condition, UserTrigger};
pub use condition_variable::{
    ConditionListener, ConditionNotifier, ConditionVariableData, Deadline, NotificationSet,
    MAX_NOTIFICATIONS,
};
pub use cv_pool::{ConditionSlot, CONDITION_VARIABLE_SLOTS};
pub use error::{ErrorCategory, Result, Severity, VenomError};
pub use fifo::{LockFreeFifoQueue, PushOutcome, QueueFull, QueueFullPolicy};
pub use report::ErrorReport;
pub use shm::{AddressIndependent, RelativeRef, ShmRegion};
pub use sofi::SpscSofi;
pub use storage::IndexedStorage;
pub use trigger::{AttachmentKind, Trigger, TriggerHandle, TriggerState};
pub use unique_id::{UniqueId, UniqueIdGenerator};
pub use waitset::{NotificationCallback, NotificationInfo, WaitSet, DEFAULT_WAITSET_CAPACITY};
