//! Producer and consumer halves of one event source
//!
//! A [`Trigger`] lives inside the data source (a queue, a port, a user flag). A wait
//! set attaches it by giving it a flag index in the wait set's condition variable
//! and keeps a [`TriggerHandle`] describing that attachment.
//!
//! The trigger refers to the condition variable only through a packed binding word
//! that is re-validated on every raise, so it can outlive its wait set safely. A
//! trigger made with [`Trigger::new_shared`] may be placed in a shared memory
//! region and raised from every process that maps it, as long as the wait set's
//! condition variable sits in the same region.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cv_pool::{Binding, ConditionSlot, ConditionVariablePool, Home, SlotRef};
use crate::shm::AddressIndependent;
use crate::unique_id::{UniqueId, UniqueIdGenerator};
use crate::waitset::NotificationCallback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Attached,
    Detached,
}

/// Event source that can be raised into a wait set
#[repr(C)]
pub struct Trigger {
    id: UniqueId,
    binding: AtomicU64,
    shared: bool,
}

// SAFETY: an id, a packed binding and a flag; relative bindings are distances
// inside one mapping.
unsafe impl AddressIndependent for Trigger {}

impl Trigger {
    /// Process-local trigger with an id from the process-wide generator
    pub fn new() -> Self {
        Self::from_generator(UniqueIdGenerator::process())
    }

    /// Process-local trigger with an id from `ids`
    pub fn from_generator(ids: &UniqueIdGenerator) -> Self {
        Self {
            id: ids.next(),
            binding: AtomicU64::new(Binding::UNBOUND),
            shared: false,
        }
    }

    /// Trigger meant to be placed in a shared memory region
    ///
    /// It can only be attached to a wait set whose condition variable lives in
    /// the same region.
    pub fn new_shared() -> Self {
        Self {
            id: UniqueIdGenerator::process().next(),
            binding: AtomicU64::new(Binding::UNBOUND),
            shared: true,
        }
    }

    #[inline]
    pub fn id(&self) -> UniqueId {
        self.id
    }

    /// Check if the trigger was made for shared memory
    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    fn resolve(&self, binding: Binding) -> Option<SlotRef<'_>> {
        match binding.home {
            Home::Process { entry } => {
                ConditionVariablePool::process().resolve(entry, binding.generation)
            }
            Home::Relative { offset } => {
                let origin = (self as *const Self).cast::<u8>();
                // SAFETY: relative bindings are only made when the trigger and the
                // slot sit in one mapping, which stays mapped while `self` is
                // borrowed.
                let slot = unsafe { &*origin.offset(offset as isize).cast::<ConditionSlot>() };
                (slot.generation() == binding.generation).then(|| SlotRef::direct(slot))
            }
        }
    }

    /// The binding and slot if this trigger still owns its flag
    fn live(&self) -> Option<(Binding, SlotRef<'_>)> {
        let binding = Binding::unpack(self.binding.load(Ordering::Acquire))?;
        let slot = self.resolve(binding)?;
        (slot.owner(binding.flag) == self.id).then_some((binding, slot))
    }

    pub fn state(&self) -> TriggerState {
        match self.live() {
            Some(_) => TriggerState::Attached,
            None => TriggerState::Detached,
        }
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.state() == TriggerState::Attached
    }

    /// Signal the wait set this trigger is attached to; no-op when detached
    #[inline]
    pub fn raise(&self) {
        if let Some((binding, slot)) = self.live() {
            // The flag index came from a wait set, it is in range.
            let _ = slot.data().notify(binding.flag);
        }
    }

    /// Give up the flag index
    ///
    /// The wait set notices on its next attach, wait or size query. Returns `false`
    /// if the trigger was not attached.
    pub fn detach(&self) -> bool {
        let raw = self.binding.swap(Binding::UNBOUND, Ordering::AcqRel);
        let Some(binding) = Binding::unpack(raw) else {
            return false;
        };
        let Some(slot) = self.resolve(binding) else {
            return false;
        };
        if slot.release_owner(binding.flag, self.id) {
            // Raise the released flag so a blocked wait re-evaluates its entries.
            let _ = slot.data().notify(binding.flag);
            true
        } else {
            false
        }
    }

    /// Point the trigger at `binding`
    ///
    /// Fails if the trigger is attached somewhere else or a concurrent attach won.
    pub(crate) fn bind(&self, binding: Binding) -> bool {
        let current = self.binding.load(Ordering::Acquire);
        if current == binding.pack() {
            return true;
        }
        if self.live().is_some() {
            return false;
        }
        self.binding
            .compare_exchange(current, binding.pack(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the binding if it still is `binding`
    pub(crate) fn unbind(&self, binding: Binding) {
        let _ = self.binding.compare_exchange(
            binding.pack(),
            Binding::UNBOUND,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    #[cfg(test)]
    pub(crate) fn binding(&self) -> Option<Binding> {
        Binding::unpack(self.binding.load(Ordering::Acquire))
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("id", &self.id)
            .field("shared", &self.shared)
            .field("state", &self.state())
            .finish()
    }
}

/// How a wait set reports an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    /// Reported once per raise
    Event,
    /// Reported by every wait while the condition holds
    State,
}

/// The wait set's record of one attached trigger
#[derive(Debug, Clone, Copy)]
pub struct TriggerHandle {
    trigger_id: UniqueId,
    event_id: u64,
    notification_index: usize,
    attach_sequence: u64,
    kind: AttachmentKind,
    callback: Option<NotificationCallback>,
}

impl TriggerHandle {
    pub(crate) fn new(
        trigger_id: UniqueId,
        event_id: u64,
        notification_index: usize,
        attach_sequence: u64,
        kind: AttachmentKind,
        callback: Option<NotificationCallback>,
    ) -> Self {
        Self {
            trigger_id,
            event_id,
            notification_index,
            attach_sequence,
            kind,
            callback,
        }
    }

    #[inline]
    pub fn trigger_id(&self) -> UniqueId {
        self.trigger_id
    }

    #[inline]
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Flag index in the wait set's condition variable
    #[inline]
    pub fn notification_index(&self) -> usize {
        self.notification_index
    }

    #[inline]
    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    /// Callback stored with the attachment
    #[inline]
    pub fn callback(&self) -> Option<NotificationCallback> {
        self.callback
    }

    #[inline]
    pub(crate) fn attach_sequence(&self) -> u64 {
        self.attach_sequence
    }
}
