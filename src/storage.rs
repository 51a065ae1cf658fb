//! Fixed-capacity, placement-stable slot array
//!
//! Slots are addressed by index only. The storage never moves a value once it is
//! written, holds no pointers and can therefore live in a shared memory segment
//! mapped at different addresses in different processes.
//!
//! The storage does not track which slots are occupied; the owner of an index
//! (a queue handing indices around) decides that.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

use crate::error::{Result, VenomError};
use crate::report;

#[repr(C)]
pub struct IndexedStorage<T, const N: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; N],
}

// SAFETY: slot access is coordinated by whoever owns the indices; the storage
// itself only hands out raw access through unsafe methods.
unsafe impl<T: Send, const N: usize> Sync for IndexedStorage<T, N> {}

impl<T, const N: usize> IndexedStorage<T, N> {
    /// Storage with every slot unconstructed
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
        }
    }

    #[inline(always)]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Bounds-checked raw slot pointer
    #[inline]
    pub fn slot_ptr(&self, index: usize) -> Result<*mut T> {
        self.slots
            .get(index)
            .map(|slot| slot.get().cast::<T>())
            .ok_or(VenomError::IndexOutOfBounds { index, capacity: N })
    }

    #[inline(always)]
    #[track_caller]
    fn checked(&self, index: usize) -> *mut T {
        match self.slot_ptr(index) {
            Ok(slot) => slot,
            Err(err) => report::fatal(err),
        }
    }

    /// Construct a value in slot `index`
    ///
    /// # Safety
    /// The caller must own `index` exclusively and the slot must be unconstructed
    /// (or hold a value that needs no drop).
    #[inline]
    #[track_caller]
    pub unsafe fn emplace(&self, index: usize, value: T) {
        ptr::write(self.checked(index), value);
    }

    /// Move the value out of slot `index`, leaving it unconstructed
    ///
    /// # Safety
    /// The caller must own `index` exclusively and the slot must be constructed.
    #[inline]
    #[track_caller]
    pub unsafe fn take(&self, index: usize) -> T {
        ptr::read(self.checked(index))
    }

    /// Borrow the value in slot `index`
    ///
    /// # Safety
    /// The slot must be constructed and must not be written while the borrow lives.
    #[inline]
    #[track_caller]
    pub unsafe fn get(&self, index: usize) -> &T {
        &*self.checked(index)
    }

    /// Run the destructor of slot `index`
    ///
    /// # Safety
    /// The caller must own `index` exclusively and the slot must be constructed.
    #[inline]
    #[track_caller]
    pub unsafe fn destroy(&self, index: usize) {
        ptr::drop_in_place(self.checked(index));
    }
}

impl<T: Copy, const N: usize> IndexedStorage<T, N> {
    /// Copy a value out of a slot that a concurrent writer may be overwriting
    ///
    /// The result is only meaningful if the caller afterwards confirms, through its
    /// own synchronization, that no write overlapped the read.
    ///
    /// # Safety
    /// The slot must have been constructed at least once.
    #[inline]
    #[track_caller]
    pub unsafe fn read_racy(&self, index: usize) -> T {
        ptr::read_volatile(self.checked(index))
    }

    /// Overwrite a slot that a concurrent reader may be copying
    ///
    /// # Safety
    /// Only a single writer may use this on a given slot at a time.
    #[inline]
    #[track_caller]
    pub unsafe fn write_racy(&self, index: usize, value: T) {
        ptr::write_volatile(self.checked(index), value);
    }
}

impl<T, const N: usize> Default for IndexedStorage<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_emplace_and_take() {
        let storage = IndexedStorage::<u64, 4>::new();
        assert_eq!(storage.capacity(), 4);
        unsafe {
            storage.emplace(3, 0xDEAD_BEEF);
            assert_eq!(*storage.get(3), 0xDEAD_BEEF);
            assert_eq!(storage.take(3), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn test_out_of_bounds_is_reported() {
        let storage = IndexedStorage::<u8, 2>::new();
        assert!(matches!(
            storage.slot_ptr(2),
            Err(VenomError::IndexOutOfBounds { index: 2, capacity: 2 })
        ));
    }

    #[test]
    fn test_destroy_runs_destructor() {
        let tracker = Rc::new(());
        let storage = IndexedStorage::<Rc<()>, 2>::new();
        unsafe {
            storage.emplace(0, Rc::clone(&tracker));
            assert_eq!(Rc::strong_count(&tracker), 2);
            storage.destroy(0);
        }
        assert_eq!(Rc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_slots_do_not_move() {
        let storage = IndexedStorage::<u32, 8>::new();
        let before = storage.slot_ptr(5).unwrap();
        unsafe {
            storage.emplace(5, 1);
            storage.emplace(5, 2);
        }
        assert_eq!(storage.slot_ptr(5).unwrap(), before);
    }
}
