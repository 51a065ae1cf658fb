//! Error reporting
//!
//! Recoverable errors travel to the caller as [`VenomError`] values. Fatal errors
//! (broken construction parameters, violated internal invariants) go through
//! [`fatal`], which logs the report with its source location, hands it to the
//! interception hook of the current thread and then panics.
//!
//! Tests observe the fatal path with [`with_fatal_hook`]:
//!
//! ```
//! use venom_sync::report;
//! use venom_sync::{ErrorCategory, LockFreeFifoQueue, QueueFullPolicy};
//! use std::cell::Cell;
//! use std::rc::Rc;
//!
//! let seen = Rc::new(Cell::new(None));
//! let sink = seen.clone();
//! let outcome = report::with_fatal_hook(
//!     move |r| sink.set(Some(r.error().category())),
//!     || std::panic::catch_unwind(|| LockFreeFifoQueue::<u32, 6>::new(QueueFullPolicy::RejectNewest)),
//! );
//! assert!(outcome.is_err());
//! assert_eq!(seen.get(), Some(ErrorCategory::Construction));
//! ```

use std::cell::RefCell;
use std::fmt;
use std::panic::Location;

use crate::error::{Severity, VenomError};

type FatalHook = Box<dyn Fn(&ErrorReport)>;

thread_local! {
    static FATAL_HOOK: RefCell<Option<FatalHook>> = const { RefCell::new(None) };
}

/// An error together with where it was raised
#[derive(Debug)]
pub struct ErrorReport {
    error: VenomError,
    location: &'static Location<'static>,
}

impl ErrorReport {
    /// Report `error` at the caller's location
    #[track_caller]
    pub fn new(error: VenomError) -> Self {
        Self {
            error,
            location: Location::caller(),
        }
    }

    /// The reported error
    pub fn error(&self) -> &VenomError {
        &self.error
    }

    pub fn severity(&self) -> Severity {
        self.error.severity()
    }

    /// Where the error was raised
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {} at {}:{}",
            self.severity(),
            self.error,
            self.location.file(),
            self.location.line()
        )
    }
}

/// Report an unrecoverable error and abort the current operation by panicking
#[track_caller]
pub fn fatal(error: VenomError) -> ! {
    let report = ErrorReport::new(error);
    tracing::error!(
        file = report.location.file(),
        line = report.location.line(),
        "fatal: {}",
        report.error
    );
    FATAL_HOOK.with(|hook| {
        if let Some(hook) = hook.borrow().as_ref() {
            hook(&report);
        }
    });
    panic!("{report}");
}

/// Report an internal invariant violation if `condition` does not hold
#[track_caller]
#[inline]
pub fn enforce(condition: bool, error: impl FnOnce() -> VenomError) {
    if !condition {
        fatal(error());
    }
}

/// Log a recoverable error at its origin and hand it back for propagation
#[track_caller]
pub fn recoverable(error: VenomError) -> VenomError {
    let location = Location::caller();
    tracing::debug!(
        file = location.file(),
        line = location.line(),
        "{}",
        error
    );
    error
}

/// Run `f` with `hook` observing every fatal report raised on this thread
///
/// The previous hook is restored afterwards, also when `f` unwinds.
pub fn with_fatal_hook<H, F, R>(hook: H, f: F) -> R
where
    H: Fn(&ErrorReport) + 'static,
    F: FnOnce() -> R,
{
    struct Restore(Option<FatalHook>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let previous = self.0.take();
            FATAL_HOOK.with(|slot| *slot.borrow_mut() = previous);
        }
    }

    let previous = FATAL_HOOK.with(|slot| slot.borrow_mut().replace(Box::new(hook)));
    let _restore = Restore(previous);
    f()
}
