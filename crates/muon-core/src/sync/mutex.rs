//! Yielding mutual exclusion lock.
//!
//! Unlike [`SpinLock`](super::SpinLock), a contended [`Mutex`] gives the CPU
//! back to the scheduler, so it is the right lock for paths that may sleep
//! (vnode I/O, capsule access). Carries a short fixed-size name for
//! diagnostics.

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::cpu;

/// Capacity of the embedded lock name, including NUL padding.
pub const MUTEX_NAME_LEN: usize = 32;

/// A yielding mutual exclusion lock.
pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    name: [u8; MUTEX_NAME_LEN],
    data: UnsafeCell<T>,
}

// SAFETY: The lock word serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

/// Copies `name` into a fixed buffer, truncating oversized names.
const fn pack_name(name: &str) -> [u8; MUTEX_NAME_LEN] {
    let bytes = name.as_bytes();
    let mut buf = [0u8; MUTEX_NAME_LEN];
    let mut i = 0;
    while i < bytes.len() && i < MUTEX_NAME_LEN - 1 {
        buf[i] = bytes[i];
        i += 1;
    }
    buf
}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex` named `name` wrapping `value`.
    pub const fn new(name: &str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name: pack_name(name),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, yielding to the scheduler while contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            cpu::yield_now();
        }
    }

    /// Attempts to acquire without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// The diagnostic name given at construction.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(MUTEX_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<bad utf8>")
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(g) => f.debug_struct("Mutex").field("name", &self.name()).field("data", &&*g).finish(),
            None => f.debug_struct("Mutex").field("name", &self.name()).field("data", &"<locked>").finish(),
        }
    }
}

/// RAII guard releasing the [`Mutex`] on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_is_truncated_and_readable() {
        let m = Mutex::new("capsule", 0u8);
        assert_eq!(m.name(), "capsule");
        let long = Mutex::new("a-very-long-name-that-overflows-the-buffer", ());
        assert_eq!(long.name().len(), MUTEX_NAME_LEN - 1);
    }

    #[test]
    fn exclusion_across_threads() {
        use std::sync::Arc;
        let m = Arc::new(Mutex::new("counter", 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 2000);
    }

    #[test]
    fn try_lock_reports_contention() {
        let m = Mutex::new("busy", ());
        let g = m.try_lock().expect("uncontended");
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
