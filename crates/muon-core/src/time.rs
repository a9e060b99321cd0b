//! Monotonic time source registration.
//!
//! Bounded waits (`SpinLock::lock_usleep`, the `sleep` syscall) need a
//! microsecond counter, but which hardware provides it is a driver decision
//! made late in boot. Drivers publish a source here; consumers read it and
//! must cope with `None` before one exists.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Registered `fn() -> u64` returning microseconds since an arbitrary epoch.
static SOURCE: AtomicUsize = AtomicUsize::new(0);

/// Publishes the monotonic microsecond source. Last writer wins; timer
/// drivers with better resolution may re-register.
pub fn set_monotonic_source(f: fn() -> u64) {
    SOURCE.store(f as usize, Ordering::Release);
}

/// Current monotonic time in microseconds, or `None` if no timer driver
/// has registered yet.
#[inline]
pub fn monotonic_usec() -> Option<u64> {
    let raw = SOURCE.load(Ordering::Acquire);
    if raw == 0 {
        return None;
    }
    // SAFETY: The word was stored from a `fn() -> u64` in
    // `set_monotonic_source` and fn pointers are never dangling.
    let f: fn() -> u64 = unsafe { core::mem::transmute::<usize, fn() -> u64>(raw) };
    Some(f())
}
