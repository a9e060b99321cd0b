//! Muon thread scheduler.
//!
//! Multi-level queues per logical CPU, drawn round-robin within a level,
//! highest level first. The build-time policy decides what a timeslice
//! expiry does: under MLFQ (default feature) the thread drops one level,
//! under plain RR it keeps its level. FIFO order within a level is a
//! guarantee, not an accident — wakers enqueue at the tail.
//!
//! The crate is generic over the thread type: anything [`Schedulable`] can
//! be queued, which keeps the queue mechanics free of process-lifecycle
//! concerns (and testable with throwaway stub threads). The kernel
//! instantiates one [`Scheduler`] over its `Proc` and wires the two hooks:
//! the one-shot preemption timer and the remote-CPU kick IPI.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod queue;
pub mod stat;

pub use queue::{CpuQueue, Scheduler};
pub use stat::SchedStat;

use core::sync::atomic::{AtomicUsize, Ordering};

use muon_core::cpu::{self, CpuId};
use static_assertions::const_assert;

/// Number of run-queue levels per CPU.
pub const SCHED_NQUEUE: usize = 4;

const_assert!(SCHED_NQUEUE > 0);
const_assert!(SCHED_NQUEUE <= 8);

/// The regular preemption quantum.
pub const DEFAULT_TIMESLICE_USEC: u32 = 9000;

/// The "kick the scheduler now" quantum.
pub const SHORT_TIMESLICE_USEC: u32 = 10;

/// Scheduling policy, fixed at build time by crate features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Multi-level feedback queues.
    Mlfq,
    /// Plain round robin.
    Rr,
}

/// The policy this kernel was built with.
pub const fn sched_policy() -> SchedPolicy {
    if cfg!(feature = "rr") && !cfg!(feature = "mlfq") {
        SchedPolicy::Rr
    } else {
        SchedPolicy::Mlfq
    }
}

/// What the scheduler needs to know about a thread.
pub trait Schedulable: Send + Sync + 'static {
    /// Current queue level (0 = highest).
    fn priority(&self) -> usize;

    /// Moves the thread to a queue level.
    fn set_priority(&self, prio: usize);

    /// The CPU this thread is pinned to, if any.
    fn pinned_cpu(&self) -> Option<CpuId>;

    /// Whether the thread may run at all (sleeping and exiting threads are
    /// skipped and silently dropped from the queues).
    fn is_runnable(&self) -> bool;
}

/// One-shot preemption-timer hook: `f(usec)` programs the current CPU's
/// timer to fire once after `usec` microseconds.
static TIMER_FN: AtomicUsize = AtomicUsize::new(0);

/// Remote-kick hook: `f(cpu)` nudges `cpu` (an IPI on real hardware) so it
/// notices freshly queued work.
static KICK_FN: AtomicUsize = AtomicUsize::new(0);

/// Installs the one-shot timer hook.
pub fn set_timer_fn(f: fn(u32)) {
    TIMER_FN.store(f as usize, Ordering::Release);
}

/// Installs the remote-kick hook.
pub fn set_kick_fn(f: fn(CpuId)) {
    KICK_FN.store(f as usize, Ordering::Release);
}

/// Arms the current CPU's preemption timer: the short quantum when `now`,
/// else the full one.
pub fn sched_oneshot(now: bool) {
    let raw = TIMER_FN.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Stored from a `fn(u32)` in `set_timer_fn`.
        let f: fn(u32) = unsafe { core::mem::transmute::<usize, fn(u32)>(raw) };
        f(if now {
            SHORT_TIMESLICE_USEC
        } else {
            DEFAULT_TIMESLICE_USEC
        });
    }
}

pub(crate) fn kick_cpu(target: CpuId) {
    let raw = KICK_FN.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Stored from a `fn(CpuId)` in `set_kick_fn`.
        let f: fn(CpuId) = unsafe { core::mem::transmute::<usize, fn(CpuId)>(raw) };
        f(target);
    }
}

/// Enables or disables preemption on the current CPU.
///
/// `false` pins the running thread until the matching `true`; spinlocks do
/// the same implicitly for their critical sections.
pub fn sched_preempt_set(enabled: bool) {
    let me = cpu::current_cpu();
    if enabled {
        cpu::preempt_enable(me);
    } else {
        cpu::preempt_disable(me);
    }
}

/// Whether the current CPU may preempt its running thread.
pub fn sched_preempt_allowed() -> bool {
    cpu::preempt_allowed(cpu::current_cpu())
}
