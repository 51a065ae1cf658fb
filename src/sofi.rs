//! Wait-free SPSC (Single Producer Single Consumer) safely overflowing FIFO
//!
//! Exactly one producer and one consumer. A push always succeeds in a bounded
//! number of steps; when the queue is full the oldest value is overwritten and
//! handed back to the producer.
//!
//! # Design
//! - `N` internal slots, one of which always stays free so the producer can write
//!   its slot before publishing the write position
//! - Producer: write slot -> publish write position -> on overflow advance the
//!   read position itself
//! - Consumer: copy slot -> claim it by advancing the read position with a CAS; if
//!   the producer advanced it first the copy is discarded and retried

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, VenomError};
use crate::fifo::validate_capacity;
use crate::index_queue::CachePadded;
use crate::report;
use crate::shm::AddressIndependent;
use crate::storage::IndexedStorage;

#[repr(C)]
pub struct SpscSofi<T: Copy, const N: usize> {
    read_position: CachePadded<AtomicU64>,
    write_position: CachePadded<AtomicU64>,
    storage: IndexedStorage<T, N>,
}

impl<T: Copy, const N: usize> SpscSofi<T, N> {
    const MASK: u64 = N as u64 - 1;

    /// Create an empty queue holding at most `N - 1` values
    #[track_caller]
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(sofi) => sofi,
            Err(err) => report::fatal(err),
        }
    }

    /// Create an empty queue, returning construction errors as values
    pub fn try_new() -> Result<Self> {
        validate_capacity(N)?;
        if N < 2 {
            return Err(VenomError::InvalidCapacity {
                capacity: N,
                reason: "needs at least two internal slots",
            });
        }
        Ok(Self {
            read_position: CachePadded(AtomicU64::new(0)),
            write_position: CachePadded(AtomicU64::new(0)),
            storage: IndexedStorage::new(),
        })
    }

    /// Maximum number of queued values
    #[inline(always)]
    pub const fn capacity(&self) -> u64 {
        N as u64 - 1
    }

    #[inline(always)]
    fn slot(position: u64) -> usize {
        (position & Self::MASK) as usize
    }

    /// Push a value, returning the overwritten oldest value on overflow
    ///
    /// Must only be called from the single producer.
    pub fn push(&self, value: T) -> Option<T> {
        let write_position = self.write_position.load(Ordering::Relaxed);
        let next_write_position = write_position.wrapping_add(1);

        // SAFETY: the slot at the write position is never read as a live value.
        unsafe { self.storage.write_racy(Self::slot(write_position), value) };
        self.write_position.store(next_write_position, Ordering::Release);

        let read_position = self.read_position.load(Ordering::Relaxed);
        if next_write_position.wrapping_sub(read_position) < N as u64 {
            return None;
        }

        // Overflow: take the oldest value unless the consumer popped it meanwhile.
        match self.read_position.compare_exchange(
            read_position,
            read_position.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: the slot was written in an earlier cycle and the producer is
            // the only writer.
            Ok(_) => Some(unsafe { self.storage.read_racy(Self::slot(read_position)) }),
            Err(_) => None,
        }
    }

    /// Pop the oldest value
    ///
    /// Must only be called from the single consumer.
    pub fn pop(&self) -> Option<T> {
        let mut read_position = self.read_position.load(Ordering::Relaxed);
        loop {
            if read_position == self.write_position.load(Ordering::Acquire) {
                // Re-validate: the producer may have overflowed past us between the
                // two loads, in which case the queue was not empty.
                match self.read_position.compare_exchange_weak(
                    read_position,
                    read_position,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return None,
                    Err(actual) => {
                        read_position = actual;
                        continue;
                    }
                }
            }

            // SAFETY: the position is behind the published write position; the copy
            // is only kept if the CAS below proves no overwrite happened.
            let value = unsafe { self.storage.read_racy(Self::slot(read_position)) };
            match self.read_position.compare_exchange_weak(
                read_position,
                read_position.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(value),
                Err(actual) => read_position = actual,
            }
        }
    }

    /// Consistent snapshot of the number of queued values
    pub fn size(&self) -> u64 {
        loop {
            let read_position = self.read_position.load(Ordering::Relaxed);
            let write_position = self.write_position.load(Ordering::Relaxed);
            if self.write_position.load(Ordering::Relaxed) == write_position
                && self.read_position.load(Ordering::Relaxed) == read_position
            {
                return write_position
                    .wrapping_sub(read_position)
                    .min(self.capacity());
            }
        }
    }

    /// Check if no value is queued
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

unsafe impl<T: Copy + AddressIndependent, const N: usize> AddressIndependent for SpscSofi<T, N> {}

impl<T: Copy, const N: usize> Default for SpscSofi<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty() {
        let sofi = SpscSofi::<u64, 8>::new();
        assert_eq!(sofi.capacity(), 7);
        assert_eq!(sofi.size(), 0);
        assert_eq!(sofi.pop(), None);
    }

    #[test]
    fn test_overflow_returns_oldest() {
        let sofi = SpscSofi::<u32, 4>::new();
        assert_eq!(sofi.push(1), None);
        assert_eq!(sofi.push(2), None);
        assert_eq!(sofi.push(3), None);
        assert_eq!(sofi.size(), 3);

        assert_eq!(sofi.push(4), Some(1));
        assert_eq!(sofi.push(5), Some(2));
        assert_eq!(sofi.size(), 3);

        assert_eq!(sofi.pop(), Some(3));
        assert_eq!(sofi.pop(), Some(4));
        assert_eq!(sofi.pop(), Some(5));
        assert_eq!(sofi.pop(), None);
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(
            SpscSofi::<u8, 1>::try_new(),
            Err(VenomError::InvalidCapacity { capacity: 1, .. })
        ));
        assert!(matches!(
            SpscSofi::<u8, 5>::try_new(),
            Err(VenomError::InvalidCapacity { capacity: 5, .. })
        ));
    }

    #[test]
    fn test_concurrent_values_stay_ordered() {
        const COUNT: u64 = 100_000;
        let sofi = Arc::new(SpscSofi::<u64, 16>::new());

        let producer = {
            let sofi = Arc::clone(&sofi);
            thread::spawn(move || {
                let mut overwritten = 0u64;
                for value in 1..=COUNT {
                    if sofi.push(value).is_some() {
                        overwritten += 1;
                    }
                }
                overwritten
            })
        };

        let mut received = 0u64;
        let mut last = 0u64;
        while last < COUNT {
            if let Some(value) = sofi.pop() {
                assert!(value > last, "got {value} after {last}");
                last = value;
                received += 1;
            } else if producer.is_finished() && sofi.is_empty() {
                break;
            }
        }

        let overwritten = producer.join().unwrap();
        let mut drained = 0u64;
        while let Some(value) = sofi.pop() {
            assert!(value > last);
            last = value;
            drained += 1;
        }
        // Each value is popped, handed back by an overflowing push, or still queued.
        assert_eq!(received + overwritten + drained, COUNT);
    }
}
