//! Address-based wait/wake on a 32-bit word
//!
//! On Linux the kernel futex is used without `FUTEX_PRIVATE_FLAG`, so a waiter and
//! a waker may live in different processes mapping the same page. Other targets
//! fall back to polling with a short sleep.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

/// Block while `*word == expected`, for at most `timeout`
///
/// Returns early on wake-up, on a changed value, on a signal or spuriously. The
/// caller re-checks its own condition.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let timespec = timeout.map(|timeout| libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as _,
    });
    let timespec_ptr = timespec
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

    // SAFETY: `word` is a valid, aligned u32 for the duration of the call. The
    // result is ignored: EAGAIN, EINTR and ETIMEDOUT all mean "re-check".
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            timespec_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// Wake every thread blocked in [`wait`] on `word`
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn wake_all(word: &AtomicU32) {
    // SAFETY: see `wait`.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POLL_INTERVAL: Duration = Duration::from_micros(50);

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;

    if word.load(Ordering::Acquire) != expected {
        return;
    }
    let nap = timeout.map_or(POLL_INTERVAL, |timeout| timeout.min(POLL_INTERVAL));
    std::thread::sleep(nap);
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn wake_all(_word: &AtomicU32) {}
