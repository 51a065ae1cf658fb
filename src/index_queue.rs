//! Lock-free MPMC queue of slot indices
//!
//! Every cell stores an index tagged with the cycle in which it was written. The
//! read and write positions are plain counters; `position & (N - 1)` selects the
//! cell and `position >> log2(N)` is the cycle. A cell is free for a writer when its
//! value is exactly one cycle behind the write position and readable when it has
//! the same cycle as the read position. `N` must be a power of two, so positions
//! and cycles wrap around at 2^64 identically for every participant.
//!
//! Only the indices `0..N` are ever stored, so a push can never find the queue
//! full as long as each index is in at most one queue at a time.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::VenomError;
use crate::report;

/// Padding to cache line
#[repr(C, align(64))]
pub(crate) struct CachePadded<T>(pub(crate) T);

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

#[repr(C)]
pub(crate) struct IndexQueue<const N: usize> {
    read_position: CachePadded<AtomicU64>,
    write_position: CachePadded<AtomicU64>,
    cells: [AtomicU64; N],
}

impl<const N: usize> IndexQueue<N> {
    const SHIFT: u32 = N.trailing_zeros();
    const INDEX_MASK: u64 = N as u64 - 1;
    const CYCLE_MASK: u64 = u64::MAX >> Self::SHIFT;

    #[inline(always)]
    fn index_of(value: u64) -> usize {
        (value & Self::INDEX_MASK) as usize
    }

    #[inline(always)]
    fn cycle_of(value: u64) -> u64 {
        value >> Self::SHIFT
    }

    #[inline(always)]
    fn tagged(index: u64, cycle: u64) -> u64 {
        (cycle << Self::SHIFT) | index
    }

    #[inline(always)]
    fn is_one_cycle_behind(value: u64, position: u64) -> bool {
        (Self::cycle_of(value).wrapping_add(1) & Self::CYCLE_MASK) == Self::cycle_of(position)
    }

    #[inline(always)]
    fn cell(&self, position: u64) -> &AtomicU64 {
        &self.cells[Self::index_of(position)]
    }

    /// Queue holding no index
    pub(crate) fn new_empty() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            read_position: CachePadded(AtomicU64::new(N as u64)),
            write_position: CachePadded(AtomicU64::new(N as u64)),
            cells: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Queue holding every index `0..N` in ascending order
    pub(crate) fn new_full() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            read_position: CachePadded(AtomicU64::new(0)),
            write_position: CachePadded(AtomicU64::new(N as u64)),
            cells: std::array::from_fn(|i| AtomicU64::new(i as u64)),
        }
    }

    /// Append `index`
    ///
    /// The caller must own `index` (it popped it from a sibling queue), which
    /// guarantees a free cell exists.
    pub(crate) fn push(&self, index: usize) {
        report::enforce(index < N, || VenomError::IndexOutOfBounds { index, capacity: N });

        let mut write_position = self.write_position.load(Ordering::Relaxed);
        loop {
            let cell = self.cell(write_position);
            let mut current = cell.load(Ordering::Acquire);

            if Self::is_one_cycle_behind(current, write_position) {
                let published = Self::tagged(index as u64, Self::cycle_of(write_position));
                match cell.compare_exchange_weak(
                    current,
                    published,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }

            if Self::cycle_of(current) == Self::cycle_of(write_position) {
                // Another push published here but has not advanced the position yet.
                let next = write_position.wrapping_add(1);
                write_position = match self.write_position.compare_exchange(
                    write_position,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => next,
                    Err(actual) => actual,
                };
            } else {
                write_position = self.write_position.load(Ordering::Relaxed);
            }
        }

        // Failure only means someone helped already.
        let _ = self.write_position.compare_exchange(
            write_position,
            write_position.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Remove the oldest index, `None` if the queue was empty
    pub(crate) fn pop(&self) -> Option<usize> {
        let mut read_position = self.read_position.load(Ordering::Relaxed);
        loop {
            let value = self.cell(read_position).load(Ordering::Acquire);

            if Self::cycle_of(value) == Self::cycle_of(read_position) {
                match self.read_position.compare_exchange_weak(
                    read_position,
                    read_position.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return Some(Self::index_of(value)),
                    Err(actual) => read_position = actual,
                }
            } else if Self::is_one_cycle_behind(value, read_position) {
                return None;
            } else {
                read_position = self.read_position.load(Ordering::Relaxed);
            }
        }
    }

    /// Snapshot; may be stale under concurrent modification
    pub(crate) fn is_empty(&self) -> bool {
        let read_position = self.read_position.load(Ordering::Acquire);
        let value = self.cell(read_position).load(Ordering::Acquire);
        Self::is_one_cycle_behind(value, read_position)
    }
}
