//! Shared-memory condition variable without a mutex
//!
//! The signal state is a set of persistent flag bits plus a 32-bit epoch that
//! doubles as the futex word. A notifier only performs atomic RMW operations and
//! one wake syscall, so it never blocks and can die at any point without leaving a
//! lock behind. A waiter atomically takes (and thereby clears) all pending flags,
//! so each raise is reported at most once.
//!
//! # Protocol
//! - Notify: set flag (`fetch_or`) -> bump epoch -> wake sleepers if any
//! - Wait: read epoch -> take flags -> if none, sleep while the epoch is unchanged
//!
//! A flag set before a waiter shows up is simply found on its first take.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, VenomError};
use crate::futex;
use crate::shm::AddressIndependent;

/// Number of flag indices of one condition variable
pub const MAX_NOTIFICATIONS: usize = 128;

const WORDS: usize = MAX_NOTIFICATIONS / 64;

/// How long a wait may block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Poll once, never block
    Immediate,
    /// Block for at most this long
    Timeout(Duration),
    /// Block until something fires
    Infinite,
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Deadline::Immediate
        } else {
            Deadline::Timeout(timeout)
        }
    }
}

impl Deadline {
    /// Pin the deadline to the current instant
    pub(crate) fn start(self) -> Countdown {
        match self {
            Deadline::Immediate => Countdown::Immediate,
            // An unrepresentable expiry is as good as no expiry.
            Deadline::Timeout(timeout) => Instant::now()
                .checked_add(timeout)
                .map_or(Countdown::Unbounded, Countdown::Until),
            Deadline::Infinite => Countdown::Unbounded,
        }
    }
}

/// A [`Deadline`] fixed to a point in time, shared by retry loops
#[derive(Debug, Clone, Copy)]
pub(crate) enum Countdown {
    Immediate,
    Until(Instant),
    Unbounded,
}

pub(crate) enum Remaining {
    Expired,
    For(Duration),
    Unbounded,
}

impl Countdown {
    pub(crate) fn remaining(&self) -> Remaining {
        match *self {
            Countdown::Immediate => Remaining::Expired,
            Countdown::Until(expires_at) => {
                let left = expires_at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    Remaining::Expired
                } else {
                    Remaining::For(left)
                }
            }
            Countdown::Unbounded => Remaining::Unbounded,
        }
    }
}

/// Set of fired flag indices
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationSet {
    words: [u64; WORDS],
}

impl NotificationSet {
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        index < MAX_NOTIFICATIONS && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    pub fn insert(&mut self, index: usize) {
        if index < MAX_NOTIFICATIONS {
            self.words[index / 64] |= 1 << (index % 64);
        }
    }

    /// Fired indices in ascending order
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_index, &word)| {
            Bits(word).map(move |bit| word_index * 64 + bit)
        })
    }
}

impl fmt::Debug for NotificationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

struct Bits(u64);

impl Iterator for Bits {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let bit = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

/// The shared signal state
///
/// Plain atomics only; it can be placed in a shared memory segment and used from
/// every process that maps it, at whatever address.
#[repr(C, align(64))]
pub struct ConditionVariableData {
    /// Futex word, bumped on every notify
    epoch: AtomicU32,
    /// Number of threads inside a wait
    waiters: AtomicU32,
    pending: [AtomicU64; WORDS],
    attached: [AtomicU64; WORDS],
}

// SAFETY: only atomics, no pointers.
unsafe impl AddressIndependent for ConditionVariableData {}

#[allow(clippy::declare_interior_mutable_const)]
const CLEAR: AtomicU64 = AtomicU64::new(0);

#[inline]
fn locate(index: usize) -> Result<(usize, u64)> {
    if index >= MAX_NOTIFICATIONS {
        return Err(VenomError::NotificationIndexOutOfRange {
            index,
            max: MAX_NOTIFICATIONS - 1,
        });
    }
    Ok((index / 64, 1 << (index % 64)))
}

impl ConditionVariableData {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            pending: [CLEAR; WORDS],
            attached: [CLEAR; WORDS],
        }
    }

    /// Set flag `index` and wake the waiters
    ///
    /// Only atomic operations and one wake syscall; safe from a signal handler.
    pub fn notify(&self, index: usize) -> Result<()> {
        let (word, bit) = locate(index)?;
        self.pending[word].fetch_or(bit, Ordering::Release);
        self.wake();
        Ok(())
    }

    /// Mark `index` as having a listener-side owner
    pub fn attach(&self, index: usize) -> Result<()> {
        let (word, bit) = locate(index)?;
        self.attached[word].fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    /// Remove `index` from the attached set and drop a pending signal on it
    pub fn detach(&self, index: usize) -> Result<()> {
        let (word, bit) = locate(index)?;
        self.attached[word].fetch_and(!bit, Ordering::AcqRel);
        self.pending[word].fetch_and(!bit, Ordering::AcqRel);
        // A waiter may now have nothing left to wait for.
        self.wake();
        Ok(())
    }

    pub fn is_attached(&self, index: usize) -> bool {
        locate(index)
            .map(|(word, bit)| self.attached[word].load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    pub fn has_attachments(&self) -> bool {
        self.attached
            .iter()
            .any(|word| word.load(Ordering::Acquire) != 0)
    }

    /// Drop a stale signal on `index` without waking anyone
    pub(crate) fn clear(&self, index: usize) {
        if let Ok((word, bit)) = locate(index) {
            self.pending[word].fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Wake every waiter so it re-evaluates its state
    pub(crate) fn wake(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) > 0 {
            futex::wake_all(&self.epoch);
        }
    }

    /// Take and clear every pending flag
    fn take_pending(&self) -> NotificationSet {
        let mut fired = NotificationSet::new();
        for (slot, word) in fired.words.iter_mut().zip(&self.pending) {
            if word.load(Ordering::Relaxed) != 0 {
                *slot = word.swap(0, Ordering::Acquire);
            }
        }
        fired
    }

    fn has_pending(&self) -> bool {
        self.pending
            .iter()
            .any(|word| word.load(Ordering::Acquire) != 0)
    }

    /// Clear every pending and attached flag for a fresh owner
    pub(crate) fn reset(&self) {
        for word in self.pending.iter().chain(&self.attached) {
            word.store(0, Ordering::Release);
        }
    }
}

impl Default for ConditionVariableData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariableData")
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("waiters", &self.waiters.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Producer-side handle that raises one fixed flag
#[derive(Clone, Copy)]
pub struct ConditionNotifier<'a> {
    data: &'a ConditionVariableData,
    index: usize,
}

impl<'a> ConditionNotifier<'a> {
    pub fn new(data: &'a ConditionVariableData, index: usize) -> Result<Self> {
        locate(index)?;
        Ok(Self { data, index })
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn notify(&self) {
        // Range was checked at construction.
        let _ = self.data.notify(self.index);
    }
}

/// Consumer-side handle that blocks until flags fire
pub struct ConditionListener<'a> {
    data: &'a ConditionVariableData,
}

struct WaiterGuard<'a>(&'a AtomicU32);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'a> ConditionListener<'a> {
    pub fn new(data: &'a ConditionVariableData) -> Self {
        Self { data }
    }

    /// Peek whether any flag is pending, without consuming it
    pub fn was_notified(&self) -> bool {
        self.data.has_pending()
    }

    /// Block until at least one flag is set or the deadline passes
    ///
    /// Returns the flags that were set and clears them. Returns an empty set at
    /// once if no index is attached.
    pub fn wait_for_one_of(&self, deadline: Deadline) -> NotificationSet {
        self.wait_until(deadline.start())
    }

    pub(crate) fn wait_until(&self, countdown: Countdown) -> NotificationSet {
        let data = self.data;
        data.waiters.fetch_add(1, Ordering::SeqCst);
        let _guard = WaiterGuard(&data.waiters);

        loop {
            let epoch = data.epoch.load(Ordering::SeqCst);
            let fired = data.take_pending();
            if !fired.is_empty() || !data.has_attachments() {
                return fired;
            }
            let timeout = match countdown.remaining() {
                Remaining::Expired => return fired,
                Remaining::For(left) => Some(left),
                Remaining::Unbounded => None,
            };
            futex::wait(&data.epoch, epoch, timeout);
        }
    }
}
