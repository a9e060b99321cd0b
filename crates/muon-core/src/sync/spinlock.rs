//! Spin-based mutual exclusion.
//!
//! Test-and-test-and-set with a pause hint in the contended path. Acquiring
//! disables preemption on the current CPU for the lifetime of the guard, so
//! a holder can never be migrated or preempted mid-critical-section; it
//! follows that a holder must not sleep.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu;
use crate::errno::Errno;
use crate::time;

/// A spin-based mutual exclusion lock.
///
/// Const-constructable so it can live in `static` items.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The lock word serializes all access to `data`; `T: Send` is
// required because the data moves between CPUs with the lock.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T: ?Sized> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Preemption stays disabled on this CPU until the guard drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        cpu::preempt_disable(cpu::current_cpu());
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SpinLockGuard { lock: self };
            }

            // TTAS: spin on plain loads until the line looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire without spinning.
    ///
    /// Returns `None` on contention so the caller can decide whether a spin
    /// is worth it.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.locked.load(Ordering::Relaxed) {
            return None;
        }
        cpu::preempt_disable(cpu::current_cpu());
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            cpu::preempt_enable(cpu::current_cpu());
            None
        }
    }

    /// Bounded acquire: spins until the lock is taken or `usec_max`
    /// microseconds of monotonic time elapse.
    ///
    /// # Errors
    ///
    /// [`Errno::Nosup`] if no monotonic time source is registered,
    /// [`Errno::Timedout`] if the budget runs out.
    pub fn lock_usleep(&self, usec_max: u64) -> Result<SpinLockGuard<'_, T>, Errno> {
        let start = time::monotonic_usec().ok_or(Errno::Nosup)?;

        cpu::preempt_disable(cpu::current_cpu());
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(SpinLockGuard { lock: self });
            }

            let now = time::monotonic_usec().ok_or_else(|| {
                cpu::preempt_enable(cpu::current_cpu());
                Errno::Nosup
            })?;
            if now.wrapping_sub(start) > usec_max {
                cpu::preempt_enable(cpu::current_cpu());
                return Err(Errno::Timedout);
            }
            core::hint::spin_loop();
        }
    }

    /// Returns a mutable reference without taking the lock.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no concurrent access. Escape hatch for the
    /// panic path only.
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard releasing the [`SpinLock`] (and re-enabling preemption) on drop.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SpinLockGuard").field("data", &&**self).finish()
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holds the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        cpu::preempt_enable(cpu::current_cpu());
    }
}
