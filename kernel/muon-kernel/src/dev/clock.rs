//! The system clock: the preemption timer behind the scheduler.
//!
//! Registers the `IPL_CLOCK` interrupt whose handler is the scheduler
//! tick, owns the one-shot hook the scheduler arms its quanta with
//! (`sched_oneshot` lands in [`clock_oneshot`]), and accumulates a
//! monotonic microsecond count from the programmed intervals, which it
//! publishes as the kernel's time source.
//!
//! On x86-64 metal the one-shot is the LAPIC timer; on aarch64 the EL1
//! generic timer. Hosted builds only record the armed interval — the
//! test harness delivers "interrupts" by dispatching the clock vector.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use muon_core::errno::Errno;
use muon_core::time;

use crate::arch;
use crate::intr::{IPL_CLOCK, IntrRequest, intr_register};
use crate::ksched;

/// Clock interrupts observed.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic microseconds accumulated from elapsed intervals.
static ELAPSED_USEC: AtomicU64 = AtomicU64::new(0);

/// The currently programmed one-shot interval.
static ARMED_USEC: AtomicU32 = AtomicU32::new(0);

/// Assigned interrupt vector (0 until init).
static VECTOR: AtomicU32 = AtomicU32::new(0);

/// Clock interrupts observed so far.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// The interval the one-shot is currently armed with.
pub fn armed_usec() -> u32 {
    ARMED_USEC.load(Ordering::Relaxed)
}

/// The clock's interrupt vector.
pub fn vector() -> u8 {
    VECTOR.load(Ordering::Relaxed) as u8
}

/// Monotonic time source: interval-accumulated microseconds.
fn clock_usec() -> u64 {
    ELAPSED_USEC.load(Ordering::Relaxed)
}

/// One-shot hook for the scheduler: remembers the interval and arms the
/// hardware timer to deliver our vector once it elapses.
fn clock_oneshot(usec: u32) {
    ARMED_USEC.store(usec, Ordering::Relaxed);
    arch::md_timer_oneshot(vector(), usec);
}

/// The clock interrupt body: account for the elapsed interval, then
/// hand the CPU to the scheduler tick (which re-arms the quantum).
fn clock_intr(_data: u64) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    ELAPSED_USEC.fetch_add(u64::from(armed_usec()), Ordering::Relaxed);
    ksched::sched_tick();
}

/// Registers the clock interrupt, installs the scheduler's timer hook
/// and the kernel time source, and arms the first quantum.
///
/// # Errors
///
/// Propagates vector-band exhaustion.
pub fn init() -> Result<(), Errno> {
    let hand = intr_register(
        "clock",
        &IntrRequest {
            func: clock_intr,
            ipl: IPL_CLOCK,
            irq: -1, // delivered by the local timer, not a routed line
            data: 0,
        },
    )?;
    VECTOR.store(u32::from(hand.vector), Ordering::Relaxed);

    muon_sched::set_timer_fn(clock_oneshot);
    time::set_monotonic_source(clock_usec);
    muon_sched::sched_oneshot(false);
    Ok(())
}
