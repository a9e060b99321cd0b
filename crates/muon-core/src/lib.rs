//! Muon kernel foundation crate.
//!
//! Home of the pieces every other kernel crate leans on: typed physical and
//! virtual addresses, the kernel-wide error taxonomy, CPU-local bookkeeping
//! (preemption depth, logical CPU ids), the monotonic time-source hook, the
//! synchronization primitives, and the sink-based kernel logger behind the
//! `log` facade.
//!
//! Everything here is pure `no_std + alloc` logic; nothing touches hardware
//! directly, which keeps the crate (and its dependents) testable on the host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod cpu;
pub mod errno;
pub mod hash;
pub mod klog;
pub mod sync;
pub mod time;

pub use addr::{PAGE_SHIFT, PAGE_SIZE, PhysAddr, VirtAddr};
pub use errno::Errno;
