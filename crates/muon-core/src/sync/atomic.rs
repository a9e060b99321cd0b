//! Thin atomic helpers.
//!
//! Wrappers with the orderings this kernel uses everywhere, so callers do
//! not sprinkle `Ordering` choices across the tree. The scheduler uses these
//! for run-queue and thread counters; the VM layer for page and object
//! refcounts.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Relaxed 32-bit load.
#[inline]
pub fn load_u32(a: &AtomicU32) -> u32 {
    a.load(Ordering::Relaxed)
}

/// Relaxed 32-bit store.
#[inline]
pub fn store_u32(a: &AtomicU32, v: u32) {
    a.store(v, Ordering::Relaxed);
}

/// 32-bit add-and-fetch (returns the new value).
#[inline]
pub fn add_fetch_u32(a: &AtomicU32, v: u32) -> u32 {
    a.fetch_add(v, Ordering::AcqRel).wrapping_add(v)
}

/// 32-bit sub-and-fetch (returns the new value).
#[inline]
pub fn sub_fetch_u32(a: &AtomicU32, v: u32) -> u32 {
    a.fetch_sub(v, Ordering::AcqRel).wrapping_sub(v)
}

/// Relaxed 64-bit load.
#[inline]
pub fn load_u64(a: &AtomicU64) -> u64 {
    a.load(Ordering::Relaxed)
}

/// Relaxed 64-bit store.
#[inline]
pub fn store_u64(a: &AtomicU64, v: u64) {
    a.store(v, Ordering::Relaxed);
}

/// 64-bit add-and-fetch (returns the new value).
#[inline]
pub fn add_fetch_u64(a: &AtomicU64, v: u64) -> u64 {
    a.fetch_add(v, Ordering::AcqRel).wrapping_add(v)
}

/// 64-bit sub-and-fetch (returns the new value).
#[inline]
pub fn sub_fetch_u64(a: &AtomicU64, v: u64) -> u64 {
    a.fetch_sub(v, Ordering::AcqRel).wrapping_sub(v)
}

/// Test-and-set; returns the previous value.
#[inline]
pub fn test_and_set(a: &AtomicBool) -> bool {
    a.swap(true, Ordering::Acquire)
}

/// Clears a flag set by [`test_and_set`].
#[inline]
pub fn clear(a: &AtomicBool) {
    a.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_report_new_value() {
        let a = AtomicU32::new(10);
        assert_eq!(add_fetch_u32(&a, 5), 15);
        assert_eq!(sub_fetch_u32(&a, 3), 12);
        assert_eq!(load_u32(&a), 12);

        let b = AtomicU64::new(0);
        assert_eq!(add_fetch_u64(&b, 1), 1);
        store_u64(&b, 9);
        assert_eq!(load_u64(&b), 9);
        assert_eq!(sub_fetch_u64(&b, 9), 0);
    }

    #[test]
    fn tas_clear() {
        let f = AtomicBool::new(false);
        assert!(!test_and_set(&f));
        assert!(test_and_set(&f));
        clear(&f);
        assert!(!test_and_set(&f));
    }
}
