//! Conditions a wait set can wait on

use std::sync::atomic::{AtomicBool, Ordering};

use crate::trigger::Trigger;

/// A predicate with a trigger that is raised whenever it may have become true
///
/// The default [`is_satisfied`](Condition::is_satisfied) never holds; a data
/// source overrides it so that attaching it while it already holds (data queued
/// before the attach) is reported by the next wait.
pub trait Condition {
    fn trigger(&self) -> &Trigger;

    fn is_satisfied(&self) -> bool {
        false
    }
}

impl Condition for Trigger {
    fn trigger(&self) -> &Trigger {
        self
    }
}

impl<C: Condition + ?Sized> Condition for &C {
    fn trigger(&self) -> &Trigger {
        (**self).trigger()
    }

    fn is_satisfied(&self) -> bool {
        (**self).is_satisfied()
    }
}

/// Condition fired by hand, e.g. to stop a thread blocked in a wait
#[derive(Debug, Default)]
pub struct UserTrigger {
    trigger: Trigger,
    fired: AtomicBool,
}

impl UserTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.trigger.raise();
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Clear the fired state, returning whether it was set
    pub fn reset(&self) -> bool {
        self.fired.swap(false, Ordering::AcqRel)
    }
}

impl Condition for UserTrigger {
    fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    fn is_satisfied(&self) -> bool {
        self.has_fired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_trigger_state() {
        let stop = UserTrigger::new();
        assert!(!stop.is_satisfied());
        stop.fire();
        assert!(stop.is_satisfied());
        assert!(stop.reset());
        assert!(!stop.reset());
    }

    #[test]
    fn test_plain_trigger_is_never_satisfied() {
        let trigger = Trigger::new();
        assert!(!trigger.is_satisfied());
        assert_eq!(Condition::trigger(&trigger).id(), trigger.id());
    }
}
