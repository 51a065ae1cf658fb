//! Homes of wait set condition variables
//!
//! A wait set blocks on one [`ConditionSlot`]: the condition variable plus the id
//! of the trigger owning each flag and a generation. The slot either sits in the
//! process-wide pool or is placed in a shared memory region, where triggers of
//! other processes can reach it.
//!
//! Triggers never hold a pointer to the slot. They store a packed [`Binding`] and
//! resolve it on every use:
//! - [`Home::Process`] names an entry of the process pool and only means
//!   something inside the process that leased it
//! - [`Home::Relative`] is the distance from the trigger to a slot in the same
//!   segment, so it resolves in every process that maps the segment
//!
//! A pool entry may forward to a slot in a shared region; local triggers of the
//! owning process reach a shared wait set that way. Releasing a slot bumps its
//! generation, so every binding that still names the old generation resolves to
//! nothing and the trigger holding it is inert.

use std::hint;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

use tracing::debug;

use crate::condition_variable::{ConditionVariableData, MAX_NOTIFICATIONS};
use crate::error::{Result, VenomError};
use crate::shm::AddressIndependent;
use crate::unique_id::UniqueId;

/// Number of pool entries (and therefore live wait sets) per process
pub const CONDITION_VARIABLE_SLOTS: usize = 256;

const LOCATION_MASK: u64 = (1 << 32) - 1;
const GENERATION_SHIFT: u32 = 32;
const GENERATION_BITS: u32 = 23;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const FLAG_SHIFT: u32 = GENERATION_SHIFT + GENERATION_BITS;
const FLAG_MASK: u64 = 0x7F;
const RELATIVE: u64 = 1 << 62;
const BOUND: u64 = 1 << 63;

/// Where the condition slot of a binding lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Home {
    /// Entry of this process's pool
    Process { entry: usize },
    /// Byte distance from the trigger to the slot, both in one mapping
    Relative { offset: i32 },
}

/// Where a trigger is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Binding {
    pub(crate) home: Home,
    pub(crate) flag: usize,
    pub(crate) generation: u64,
}

impl Binding {
    /// Packed value of "not attached anywhere"
    pub(crate) const UNBOUND: u64 = 0;

    pub(crate) fn pack(self) -> u64 {
        let (kind, location) = match self.home {
            Home::Process { entry } => (0, entry as u64 & LOCATION_MASK),
            Home::Relative { offset } => (RELATIVE, offset as u32 as u64),
        };
        BOUND
            | kind
            | ((self.flag as u64 & FLAG_MASK) << FLAG_SHIFT)
            | ((self.generation & GENERATION_MASK) << GENERATION_SHIFT)
            | location
    }

    pub(crate) fn unpack(raw: u64) -> Option<Self> {
        if raw & BOUND == 0 {
            return None;
        }
        let location = raw & LOCATION_MASK;
        let home = if raw & RELATIVE == 0 {
            Home::Process {
                entry: location as usize,
            }
        } else {
            Home::Relative {
                offset: location as u32 as i32,
            }
        };
        Some(Self {
            home,
            flag: ((raw >> FLAG_SHIFT) & FLAG_MASK) as usize,
            generation: (raw >> GENERATION_SHIFT) & GENERATION_MASK,
        })
    }
}

/// Condition variable of one wait set, with flag ownership
///
/// Plain atomics only. Place one in a [`ShmRegion`](crate::ShmRegion) next to
/// shared triggers and build the wait set with
/// [`WaitSet::in_region`](crate::WaitSet::in_region).
#[repr(C)]
pub struct ConditionSlot {
    generation: AtomicU64,
    in_use: AtomicBool,
    data: ConditionVariableData,
    owners: [AtomicU64; MAX_NOTIFICATIONS],
}

// SAFETY: only atomics and a ConditionVariableData.
unsafe impl AddressIndependent for ConditionSlot {}

#[allow(clippy::declare_interior_mutable_const)]
const NO_OWNER: AtomicU64 = AtomicU64::new(0);

impl ConditionSlot {
    /// An unclaimed slot
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(1),
            in_use: AtomicBool::new(false),
            data: ConditionVariableData::new(),
            owners: [NO_OWNER; MAX_NOTIFICATIONS],
        }
    }

    /// Check if a wait set currently uses this slot
    pub fn is_claimed(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn data(&self) -> &ConditionVariableData {
        &self.data
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst) & GENERATION_MASK
    }

    /// Id of the trigger owning `flag`, [`UniqueId::INVALID`] if none
    #[inline]
    pub(crate) fn owner(&self, flag: usize) -> UniqueId {
        self.owners
            .get(flag)
            .map_or(UniqueId::INVALID, |owner| {
                UniqueId::from_raw(owner.load(Ordering::Acquire))
            })
    }

    pub(crate) fn set_owner(&self, flag: usize, id: UniqueId) {
        if let Some(owner) = self.owners.get(flag) {
            owner.store(id.as_u64(), Ordering::Release);
        }
    }

    /// Give `flag` back if `id` still owns it
    pub(crate) fn release_owner(&self, flag: usize, id: UniqueId) -> bool {
        self.owners.get(flag).is_some_and(|owner| {
            owner
                .compare_exchange(id.as_u64(), 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        })
    }

    /// Take the slot for one wait set, returning its generation
    pub(crate) fn claim(&self) -> Option<u64> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| self.generation())
    }

    /// Make every binding into the current generation inert
    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Hand the slot back, clearing owners and flags and waking any waiter
    pub(crate) fn release(&self) {
        for owner in &self.owners {
            owner.store(0, Ordering::Release);
        }
        self.data.reset();
        self.data.wake();
        self.in_use.store(false, Ordering::Release);
    }
}

impl Default for ConditionSlot {
    fn default() -> Self {
        Self::new()
    }
}

struct PoolEntry {
    slot: ConditionSlot,
    /// Slot in a shared region this entry forwards to; null for `slot` itself
    remote: AtomicPtr<ConditionSlot>,
    /// Resolutions currently dereferencing `remote`
    in_flight: AtomicU32,
}

#[allow(clippy::declare_interior_mutable_const)]
const FREE_ENTRY: PoolEntry = PoolEntry::new();

impl PoolEntry {
    const fn new() -> Self {
        Self {
            slot: ConditionSlot::new(),
            remote: AtomicPtr::new(ptr::null_mut()),
            in_flight: AtomicU32::new(0),
        }
    }

    #[inline]
    fn target(&self) -> &ConditionSlot {
        let remote = self.remote.load(Ordering::Acquire);
        // SAFETY: a non-null target is kept mapped by the lease holder until it
        // is swapped back to null, which waits for every in-flight resolution.
        unsafe { remote.as_ref() }.unwrap_or(&self.slot)
    }
}

/// A resolved slot, pinned against release while it is held
pub(crate) struct SlotRef<'a> {
    slot: &'a ConditionSlot,
    in_flight: Option<&'a AtomicU32>,
}

impl<'a> SlotRef<'a> {
    /// A slot that stays valid for `'a` without pinning
    pub(crate) fn direct(slot: &'a ConditionSlot) -> Self {
        Self {
            slot,
            in_flight: None,
        }
    }
}

impl Deref for SlotRef<'_> {
    type Target = ConditionSlot;

    fn deref(&self) -> &ConditionSlot {
        self.slot
    }
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        if let Some(in_flight) = self.in_flight {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub(crate) struct ConditionVariablePool<const SLOTS: usize = CONDITION_VARIABLE_SLOTS> {
    entries: [PoolEntry; SLOTS],
}

static PROCESS_POOL: ConditionVariablePool = ConditionVariablePool::new();

impl ConditionVariablePool {
    #[inline]
    pub(crate) fn process() -> &'static ConditionVariablePool {
        &PROCESS_POOL
    }
}

impl<const SLOTS: usize> ConditionVariablePool<SLOTS> {
    pub(crate) const fn new() -> Self {
        Self {
            entries: [FREE_ENTRY; SLOTS],
        }
    }

    /// Lease a free entry, forwarding to `remote` when given
    ///
    /// The caller keeps `remote` mapped until the lease is dropped.
    pub(crate) fn acquire(&self, remote: Option<NonNull<ConditionSlot>>) -> Result<Lease<'_, SLOTS>> {
        for (index, entry) in self.entries.iter().enumerate() {
            if let Some(generation) = entry.slot.claim() {
                let remote = remote.map_or(ptr::null_mut(), NonNull::as_ptr);
                entry.remote.store(remote, Ordering::Release);
                debug!(
                    slot = index,
                    generation,
                    shared = !remote.is_null(),
                    "Leased condition variable"
                );
                return Ok(Lease {
                    pool: self,
                    index,
                    generation,
                });
            }
        }
        Err(VenomError::ConditionVariablesExhausted { slots: SLOTS })
    }

    /// The slot behind entry `index`, if its lease of `generation` is alive
    pub(crate) fn resolve(&self, index: usize, generation: u64) -> Option<SlotRef<'_>> {
        let entry = self.entries.get(index)?;
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        // Checked after pinning: a release that starts later waits for us.
        if entry.slot.generation() != generation {
            entry.in_flight.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(SlotRef {
            slot: entry.target(),
            in_flight: Some(&entry.in_flight),
        })
    }
}

/// Exclusive use of one pool entry, given back on drop
pub(crate) struct Lease<'a, const SLOTS: usize = CONDITION_VARIABLE_SLOTS> {
    pool: &'a ConditionVariablePool<SLOTS>,
    index: usize,
    generation: u64,
}

impl<const SLOTS: usize> Lease<'_, SLOTS> {
    fn entry(&self) -> &PoolEntry {
        &self.pool.entries[self.index]
    }

    /// The slot the wait set blocks on
    #[inline]
    pub(crate) fn slot(&self) -> &ConditionSlot {
        self.entry().target()
    }

    /// Binding through the pool entry, valid inside this process
    pub(crate) fn binding(&self, flag: usize) -> Binding {
        Binding {
            home: Home::Process { entry: self.index },
            flag,
            generation: self.generation,
        }
    }
}

impl<const SLOTS: usize> Drop for Lease<'_, SLOTS> {
    fn drop(&mut self) {
        let entry = self.entry();
        // Invalidate every local binding first; from here on raises are no-ops.
        entry.slot.invalidate();
        while entry.in_flight.load(Ordering::SeqCst) != 0 {
            hint::spin_loop();
        }

        let remote = entry.remote.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: still mapped, see `acquire`.
        if let Some(remote) = unsafe { remote.as_ref() } {
            remote.invalidate();
            remote.release();
        }
        entry.slot.release();
        debug!(slot = self.index, generation = self.generation, "Released condition variable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unique_id::UniqueIdGenerator;

    #[test]
    fn test_binding_packing() {
        let local = Binding {
            home: Home::Process { entry: 255 },
            flag: 127,
            generation: GENERATION_MASK,
        };
        assert_eq!(Binding::unpack(local.pack()), Some(local));

        let shared = Binding {
            home: Home::Relative { offset: -4096 },
            flag: 3,
            generation: 17,
        };
        assert_eq!(Binding::unpack(shared.pack()), Some(shared));
        assert_eq!(Binding::unpack(Binding::UNBOUND), None);
    }

    #[test]
    fn test_exhaustion_and_reuse() {
        let pool = ConditionVariablePool::<2>::new();
        let first = pool.acquire(None).unwrap();
        let second = pool.acquire(None).unwrap();
        assert!(matches!(
            pool.acquire(None),
            Err(VenomError::ConditionVariablesExhausted { slots: 2 })
        ));

        drop(first);
        let third = pool.acquire(None).unwrap();
        assert_eq!(third.index, 0);
        drop(second);
    }

    #[test]
    fn test_release_invalidates_bindings() {
        let pool = ConditionVariablePool::<1>::new();
        let lease = pool.acquire(None).unwrap();
        let Binding { generation, .. } = lease.binding(3);
        assert!(pool.resolve(0, generation).is_some());

        drop(lease);
        assert!(pool.resolve(0, generation).is_none());

        let lease = pool.acquire(None).unwrap();
        assert!(pool.resolve(0, generation).is_none());
        assert!(pool.resolve(0, lease.binding(3).generation).is_some());
    }

    #[test]
    fn test_entry_forwards_to_remote_slot() {
        let pool = ConditionVariablePool::<1>::new();
        let remote = ConditionSlot::new();
        let generation = remote.claim().unwrap();
        assert!(remote.is_claimed());

        let lease = pool.acquire(Some(NonNull::from(&remote))).unwrap();
        assert!(ptr::eq(lease.slot(), &remote));
        let resolved = pool.resolve(0, lease.binding(0).generation).unwrap();
        assert!(ptr::eq(&*resolved, &remote));
        drop(resolved);

        drop(lease);
        assert!(!remote.is_claimed());
        assert_ne!(remote.generation(), generation);
        assert_eq!(pool.entries[0].in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_owner_release_is_conditional() {
        let ids = UniqueIdGenerator::new();
        let (a, b) = (ids.next(), ids.next());
        let slot = ConditionSlot::new();

        slot.set_owner(4, a);
        assert!(!slot.release_owner(4, b));
        assert_eq!(slot.owner(4), a);
        assert!(slot.release_owner(4, a));
        assert_eq!(slot.owner(4), UniqueId::INVALID);
    }
}
