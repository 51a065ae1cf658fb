//! Wait set: block until one of several conditions fires
//!
//! A wait set blocks on one condition variable and hands each attached condition
//! its own flag index. `wait` translates the fired flags back into
//! [`NotificationInfo`]s, ordered by attachment (first attached, first reported)
//! no matter which flag indices were used.
//!
//! # Attachments
//! - Event: reported once per raise
//! - State: reported by every wait for as long as the condition holds
//!
//! # Where the condition variable lives
//! - [`WaitSet::new`] leases one from the process pool; only triggers of this
//!   process can reach it
//! - [`WaitSet::in_region`] claims a [`ConditionSlot`] placed in a shared memory
//!   region; shared triggers in that region are raised from any process that
//!   maps it
//!
//! # Detaching
//! - `detach_condition` releases the flag right away
//! - A trigger that detaches itself (or is dropped) gives its flag back on its
//!   own; the wait set reclaims it on the next attach or wait
//! - Dropping the wait set releases the condition variable, which turns every
//!   trigger still bound to it inert

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::debug;

use crate::condition::Condition;
use crate::condition_variable::{
    ConditionListener, Countdown, Deadline, NotificationSet, Remaining, MAX_NOTIFICATIONS,
};
use crate::cv_pool::{Binding, ConditionSlot, ConditionVariablePool, Home, Lease};
use crate::error::{Result, VenomError};
use crate::report;
use crate::shm::{RelativeRef, ShmRegion};
use crate::trigger::{AttachmentKind, Trigger, TriggerHandle};
use crate::unique_id::UniqueId;

/// Capacity of a [`WaitSet`] when none is given
pub const DEFAULT_WAITSET_CAPACITY: usize = MAX_NOTIFICATIONS;

/// Function stored with an attachment and run by [`NotificationInfo::call`]
pub type NotificationCallback = fn(&NotificationInfo);

/// One fired condition, as returned by [`WaitSet::wait`]
#[derive(Debug, Clone, Copy)]
pub struct NotificationInfo {
    trigger_id: UniqueId,
    event_id: u64,
    callback: Option<NotificationCallback>,
}

impl NotificationInfo {
    #[inline]
    pub fn trigger_id(&self) -> UniqueId {
        self.trigger_id
    }

    /// The id given when the condition was attached
    #[inline]
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Check if `condition` raised this notification
    pub fn originates_from<C: Condition + ?Sized>(&self, condition: &C) -> bool {
        condition.trigger().id() == self.trigger_id
    }

    /// Run the callback stored with the attachment, returning `false` if there
    /// is none
    pub fn call(&self) -> bool {
        match self.callback {
            Some(callback) => {
                callback(self);
                true
            }
            None => false,
        }
    }
}

impl From<TriggerHandle> for NotificationInfo {
    fn from(handle: TriggerHandle) -> Self {
        Self {
            trigger_id: handle.trigger_id(),
            event_id: handle.event_id(),
            callback: handle.callback(),
        }
    }
}

/// Up to `CAPACITY` conditions a thread can block on together
///
/// State attachments borrow their condition for `'a`; event attachments do not
/// borrow at all.
pub struct WaitSet<'a, const CAPACITY: usize = DEFAULT_WAITSET_CAPACITY> {
    lease: Lease<'static>,
    /// Keeps a shared condition variable mapped; dropped after `lease`
    region: Option<Arc<ShmRegion>>,
    /// Indexed by flag index
    entries: [Option<TriggerHandle>; CAPACITY],
    /// Origins of state attachments, indexed by flag index
    states: [Option<&'a (dyn Condition + Sync)>; CAPACITY],
    next_sequence: u64,
}

impl<'a, const CAPACITY: usize> WaitSet<'a, CAPACITY> {
    #[track_caller]
    fn check_capacity() {
        if CAPACITY == 0 || CAPACITY > MAX_NOTIFICATIONS {
            report::fatal(VenomError::InvalidCapacity {
                capacity: CAPACITY,
                reason: "wait set capacity must be within 1..=MAX_NOTIFICATIONS",
            });
        }
    }

    fn with_lease(lease: Lease<'static>, region: Option<Arc<ShmRegion>>) -> Self {
        Self {
            lease,
            region,
            entries: [None; CAPACITY],
            states: [None; CAPACITY],
            next_sequence: 0,
        }
    }

    /// Create a wait set with a condition variable from the process pool
    ///
    /// A `CAPACITY` of zero or above [`MAX_NOTIFICATIONS`] is fatal. Running out of
    /// pooled condition variables is returned as an error.
    #[track_caller]
    pub fn new() -> Result<Self> {
        Self::check_capacity();
        let lease = ConditionVariablePool::process()
            .acquire(None)
            .map_err(report::recoverable)?;
        debug!(capacity = CAPACITY, "Created wait set");
        Ok(Self::with_lease(lease, None))
    }

    /// Create a wait set blocking on the [`ConditionSlot`] at `home` in `region`
    ///
    /// Shared triggers placed in `region` can then be raised from every process
    /// that maps it. Fails with [`VenomError::ConditionVariableInUse`] while
    /// another wait set holds the slot.
    ///
    /// # Safety
    /// A `ConditionSlot` must have been placed at `home`, through this or any
    /// other mapping of the region.
    #[track_caller]
    pub unsafe fn in_region(region: Arc<ShmRegion>, home: RelativeRef<ConditionSlot>) -> Result<Self> {
        Self::check_capacity();
        let slot = region.get(home)?;
        if slot.claim().is_none() {
            return Err(report::recoverable(VenomError::ConditionVariableInUse));
        }
        let lease = match ConditionVariablePool::process().acquire(Some(NonNull::from(slot))) {
            Ok(lease) => lease,
            Err(err) => {
                slot.release();
                return Err(report::recoverable(err));
            }
        };
        debug!(
            capacity = CAPACITY,
            region = region.name(),
            offset = home.offset(),
            "Created shared wait set"
        );
        Ok(Self::with_lease(lease, Some(region)))
    }

    /// Maximum number of attached conditions
    #[inline]
    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Number of attached conditions
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|handle| self.is_live(handle))
            .count()
    }

    /// Check if nothing is attached
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn is_live(&self, handle: &TriggerHandle) -> bool {
        self.lease.slot().owner(handle.notification_index()) == handle.trigger_id()
    }

    /// Drop entries whose trigger gave its flag back
    fn reclaim(&mut self) {
        let slot = self.lease.slot();
        for (flag, entry) in self.entries.iter_mut().enumerate() {
            let Some(handle) = *entry else { continue };
            if slot.owner(flag) != handle.trigger_id() {
                let _ = slot.data().detach(flag);
                *entry = None;
                self.states[flag] = None;
                debug!(
                    trigger = %handle.trigger_id(),
                    notification_index = flag,
                    "Reclaimed released notification"
                );
            }
        }
    }

    /// How `trigger` refers to the condition variable from flag `flag`
    fn binding_for(&self, trigger: &Trigger, flag: usize) -> Result<Binding> {
        let slot = self.lease.slot();
        if let Some(region) = &self.region {
            if let (Some(trigger_at), Some(slot_at)) =
                (region.offset_of(trigger), region.offset_of(slot))
            {
                if let Ok(offset) = i32::try_from(slot_at as i64 - trigger_at as i64) {
                    return Ok(Binding {
                        home: Home::Relative { offset },
                        flag,
                        generation: slot.generation(),
                    });
                }
            }
        }
        if trigger.is_shared() {
            return Err(report::recoverable(VenomError::ForeignTrigger { id: trigger.id() }));
        }
        Ok(self.lease.binding(flag))
    }

    fn attach<C: Condition + ?Sized>(
        &mut self,
        condition: &C,
        event_id: u64,
        callback: Option<NotificationCallback>,
        state: Option<&'a (dyn Condition + Sync)>,
    ) -> Result<()> {
        self.reclaim();

        let trigger = condition.trigger();
        let id = trigger.id();
        let attached_here = self
            .entries
            .iter()
            .flatten()
            .any(|handle| handle.trigger_id() == id);
        if attached_here || trigger.is_attached() {
            return Err(report::recoverable(VenomError::AlreadyAttached { id }));
        }

        let Some(flag) = self.entries.iter().position(Option::is_none) else {
            return Err(report::recoverable(VenomError::CapacityExceeded {
                capacity: CAPACITY,
            }));
        };
        let binding = self.binding_for(trigger, flag)?;

        let slot = self.lease.slot();
        let data = slot.data();
        data.attach(flag)?;
        data.clear(flag);
        slot.set_owner(flag, id);
        if !trigger.bind(binding) {
            slot.release_owner(flag, id);
            let _ = data.detach(flag);
            return Err(report::recoverable(VenomError::AlreadyAttached { id }));
        }

        let kind = match state {
            Some(_) => AttachmentKind::State,
            None => AttachmentKind::Event,
        };
        self.entries[flag] = Some(TriggerHandle::new(
            id,
            event_id,
            flag,
            self.next_sequence,
            kind,
            callback,
        ));
        self.states[flag] = state;
        self.next_sequence += 1;
        debug!(trigger = %id, event_id, notification_index = flag, ?kind, "Attached condition");

        if condition.is_satisfied() {
            trigger.raise();
        }
        Ok(())
    }

    /// Attach `condition` as an event with event id 0
    pub fn attach_condition<C: Condition + ?Sized>(&mut self, condition: &C) -> Result<()> {
        self.attach_condition_with_id(condition, 0)
    }

    /// Attach `condition` as an event; notifications from it carry `event_id`
    ///
    /// Fails with [`VenomError::CapacityExceeded`] when every flag index is taken
    /// and [`VenomError::AlreadyAttached`] when the condition is attached here or
    /// to another wait set. A condition that is already satisfied is reported by
    /// the next wait.
    pub fn attach_condition_with_id<C: Condition + ?Sized>(
        &mut self,
        condition: &C,
        event_id: u64,
    ) -> Result<()> {
        self.attach(condition, event_id, None, None)
    }

    /// Attach `condition` as an event and store `callback` with it
    pub fn attach_condition_with_callback<C: Condition + ?Sized>(
        &mut self,
        condition: &C,
        event_id: u64,
        callback: NotificationCallback,
    ) -> Result<()> {
        self.attach(condition, event_id, Some(callback), None)
    }

    /// Attach `condition` as a state with event id 0
    pub fn attach_state<C: Condition + Sync>(&mut self, condition: &'a C) -> Result<()> {
        self.attach_state_with_id(condition, 0)
    }

    /// Attach `condition` as a state
    ///
    /// Every wait reports it, without blocking, for as long as
    /// [`Condition::is_satisfied`] holds.
    pub fn attach_state_with_id<C: Condition + Sync>(
        &mut self,
        condition: &'a C,
        event_id: u64,
    ) -> Result<()> {
        self.attach(condition, event_id, None, Some(condition as &'a (dyn Condition + Sync)))
    }

    /// Detach `condition`, returning `false` if it was not attached here
    pub fn detach_condition<C: Condition + ?Sized>(&mut self, condition: &C) -> bool {
        self.reclaim();

        let trigger = condition.trigger();
        let id = trigger.id();
        let Some(flag) = self
            .entries
            .iter()
            .position(|entry| entry.is_some_and(|handle| handle.trigger_id() == id))
        else {
            return false;
        };
        let Some(handle) = self.entries[flag].take() else {
            return false;
        };
        self.states[flag] = None;

        let slot = self.lease.slot();
        if let Ok(binding) = self.binding_for(trigger, flag) {
            trigger.unbind(binding);
        }
        slot.release_owner(flag, id);
        let _ = slot.data().detach(flag);
        debug!(trigger = %id, notification_index = handle.notification_index(), "Detached condition");
        true
    }

    /// Handle of the attachment of `condition`, if attached here
    pub fn handle_of<C: Condition + ?Sized>(&self, condition: &C) -> Option<TriggerHandle> {
        let id = condition.trigger().id();
        self.entries
            .iter()
            .flatten()
            .find(|handle| handle.trigger_id() == id && self.is_live(handle))
            .copied()
    }

    /// Block until at least one attached condition fires or the deadline passes
    ///
    /// Returns the fired conditions in attachment order; empty on timeout or when
    /// nothing is attached. Each raise of an event is reported once; a state is
    /// reported by every call while it holds.
    pub fn wait(&mut self, deadline: Deadline) -> Vec<NotificationInfo> {
        let countdown = deadline.start();
        loop {
            self.reclaim();
            if self.entries.iter().all(Option::is_none) {
                return Vec::new();
            }

            let held = self.held_states();
            let round = if held.is_empty() {
                countdown
            } else {
                Countdown::Immediate
            };
            let mut fired = ConditionListener::new(self.lease.slot().data()).wait_until(round);
            held.iter().for_each(|flag| fired.insert(flag));

            let notifications = self.translate(&fired);
            if !notifications.is_empty() {
                return notifications;
            }
            // Only released flags fired; look again unless time is up.
            if matches!(countdown.remaining(), Remaining::Expired) {
                return notifications;
            }
        }
    }

    /// Wait once and pass every notification to `handler`, returning how many fired
    pub fn wait_and_handle<F>(&mut self, deadline: Deadline, mut handler: F) -> usize
    where
        F: FnMut(&NotificationInfo),
    {
        let notifications = self.wait(deadline);
        notifications.iter().for_each(&mut handler);
        notifications.len()
    }

    /// Flags of state attachments whose condition holds right now
    fn held_states(&self) -> NotificationSet {
        let mut held = NotificationSet::new();
        for (flag, state) in self.states.iter().enumerate() {
            if let Some(condition) = state {
                if condition.is_satisfied() {
                    held.insert(flag);
                }
            }
        }
        held
    }

    fn translate(&self, fired: &NotificationSet) -> Vec<NotificationInfo> {
        let mut handles: Vec<TriggerHandle> = fired
            .iter()
            .filter_map(|flag| self.entries.get(flag).copied().flatten())
            .filter(|handle| self.is_live(handle))
            .collect();
        handles.sort_unstable_by_key(TriggerHandle::attach_sequence);
        handles.into_iter().map(NotificationInfo::from).collect()
    }
}

impl<const CAPACITY: usize> Drop for WaitSet<'_, CAPACITY> {
    fn drop(&mut self) {
        // Releasing the lease invalidates every binding into it.
        debug!(
            attached = self.len(),
            shared = self.region.is_some(),
            "Dropping wait set"
        );
    }
}
