//! Initialized-once cells for kernel singletons.

use core::cell::UnsafeCell;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// A cell written at most once, readable from any context afterwards.
pub struct Once<T> {
    state: AtomicU8,
    data: UnsafeCell<Option<T>>,
}

// SAFETY: Writes are serialized by the state machine; after READY the data
// is only read.
unsafe impl<T: Send + Sync> Sync for Once<T> {}
unsafe impl<T: Send> Send for Once<T> {}

impl<T> Once<T> {
    /// Creates an empty cell.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            data: UnsafeCell::new(None),
        }
    }

    /// Stores `value` if the cell is still empty.
    ///
    /// Returns `Err(value)` if another writer got there first.
    pub fn set(&self, value: T) -> Result<(), T> {
        match self
            .state
            .compare_exchange(UNINIT, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                // SAFETY: BUSY excludes every other writer and readers only
                // look after READY.
                unsafe { *self.data.get() = Some(value) };
                self.state.store(READY, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    /// Returns the stored value, or `None` if the cell is still empty.
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY means the write completed and no further writes
            // can happen.
            unsafe { (*self.data.get()).as_ref() }
        } else {
            None
        }
    }

    /// Returns the stored value, initializing it with `init` on first use.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }
        let _ = self.set(init());
        loop {
            // A racing writer may still be between BUSY and READY.
            if let Some(v) = self.get() {
                return v;
            }
            core::hint::spin_loop();
        }
    }
}

impl<T> Default for Once<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A value computed on first dereference.
pub struct Lazy<T, F = fn() -> T> {
    cell: Once<T>,
    init: F,
}

// SAFETY: Same argument as `Once`; `F` is only called once under BUSY.
unsafe impl<T: Send + Sync, F: Send> Sync for Lazy<T, F> {}

impl<T, F: Fn() -> T> Lazy<T, F> {
    /// Creates a lazy cell that will run `init` on first access.
    pub const fn new(init: F) -> Self {
        Self {
            cell: Once::new(),
            init,
        }
    }

    /// Forces initialization and returns the value.
    pub fn force(&self) -> &T {
        self.cell.get_or_init(&self.init)
    }
}

impl<T, F: Fn() -> T> Deref for Lazy<T, F> {
    type Target = T;

    fn deref(&self) -> &T {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_accepts_single_writer() {
        let cell: Once<u32> = Once::new();
        assert!(cell.get().is_none());
        assert!(cell.set(1).is_ok());
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }

    #[test]
    fn lazy_initializes_once() {
        use core::sync::atomic::AtomicUsize;
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        static CELL: Lazy<u32> = Lazy::new(|| {
            RUNS.fetch_add(1, Ordering::SeqCst);
            7
        });
        assert_eq!(*CELL, 7);
        assert_eq!(*CELL, 7);
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    }
}
