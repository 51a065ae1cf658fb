//! Process-wide unique identifiers
//!
//! Triggers carry a [`UniqueId`] so that a fired flag index can be mapped back to
//! the condition that raised it even after the flag index was reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::VenomError;
use crate::report;
use crate::shm::AddressIndependent;

/// Identifier drawn once from a [`UniqueIdGenerator`]
///
/// Zero is reserved as "no id". Ids are distinct within the lifetime of their
/// generator but neither contiguous nor small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct UniqueId(u64);

impl UniqueId {
    /// The reserved "no id" value
    pub const INVALID: UniqueId = UniqueId(0);

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Rebuild an id read back from shared memory
    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

// SAFETY: a plain integer.
unsafe impl AddressIndependent for UniqueId {}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic id counter starting at 1
pub struct UniqueIdGenerator {
    next: AtomicU64,
}

/// Generator shared by everything in this process that asks for
/// [`UniqueIdGenerator::process`]. It is never torn down.
static PROCESS_IDS: UniqueIdGenerator = UniqueIdGenerator::new();

impl UniqueIdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// The process-wide generator
    #[inline]
    pub fn process() -> &'static UniqueIdGenerator {
        &PROCESS_IDS
    }

    /// Draw the next id
    #[inline]
    pub fn next(&self) -> UniqueId {
        // Relaxed: only distinctness is promised, not ordering against other memory.
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        if raw == 0 {
            report::fatal(VenomError::UniqueIdsExhausted);
        }
        UniqueId(raw)
    }
}

impl Default for UniqueIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_first_id_is_one() {
        let ids = UniqueIdGenerator::new();
        assert_eq!(ids.next().as_u64(), 1);
        assert_eq!(ids.next().as_u64(), 2);
        assert!(!UniqueId::INVALID.is_valid());
    }

    #[test]
    fn test_concurrent_ids_are_distinct_and_nonzero() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 10_000;

        let ids = Arc::new(UniqueIdGenerator::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let ids = Arc::clone(&ids);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..PER_THREAD).map(|_| ids.next()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id.is_valid());
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_ids_increase_within_a_thread() {
        let ids = UniqueIdGenerator::process();
        let a = ids.next();
        let b = ids.next();
        assert!(b > a);
    }
}
