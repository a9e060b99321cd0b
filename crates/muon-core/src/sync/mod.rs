//! Kernel synchronization primitives.
//!
//! Three tiers, by how long the holder may keep the resource:
//!
//! - [`SpinLock`] — short critical sections; acquisition disables preemption
//!   on the current CPU and the holder must not sleep.
//! - [`Mutex`] — sleepable paths; contended acquirers yield to the scheduler
//!   instead of burning the CPU.
//! - [`atomic`] — lock-free counters used by the scheduler and the VM layer.
//!
//! [`Lazy`] and [`Once`] cover the initialized-once kernel singletons.

pub mod atomic;
mod lazy;
mod mutex;
mod spinlock;

pub use lazy::{Lazy, Once};
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
