//! CPU dispatch: the glue between the run queues and the metal.
//!
//! `muon-sched` owns the queue mechanics; this module owns the acts of
//! scheduling — taking the CPU away from one thread and giving it to
//! another. Three entry points:
//!
//! - [`sched_tick`], the body of the clock interrupt: re-queues the
//!   running thread (MLFQ demotion applies), switches to the next one,
//!   and re-arms the quantum.
//! - [`sched_yield`], the voluntary give-up used by mutexes, `waitpid`,
//!   and the `sleep` syscall (installed as the core yield hook).
//! - [`sched_enter`], the per-CPU idle dispatch loop the boot path
//!   parks itself in.
//!
//! A switch is bookkeeping (current-thread slot), then the address
//! space ([`Vas::activate`]), then the register state
//! ([`arch::cpu_switch`]). The hosted build stops after the address
//! space — there is no second kernel stack to jump onto — which is what
//! lets tests drive ticks and observe every dispatch decision
//! synchronously.
//!
//! Remote CPUs are nudged through a dedicated reschedule IPI: a wakeup
//! queued onto another CPU raises it so that CPU re-dispatches promptly
//! instead of riding out its quantum.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use muon_core::cpu::{self, CpuId};
use muon_core::errno::Errno;

use crate::boot::try_kernel;
use crate::ipi;
use crate::proc::{self, Proc};
use crate::syscall;

/// IPI id carrying remote reschedule kicks, fixed at init.
static RESCHED_ID: AtomicUsize = AtomicUsize::new(usize::MAX);

/// Reschedule IPI body: flag the CPU and kick its timer so the running
/// thread is preempted at once.
fn resched_ipi(me: CpuId) {
    syscall::set_resched_on(me);
    muon_sched::sched_oneshot(true);
}

/// Remote-kick hook handed to the scheduler: wakeups that land on
/// another CPU's queue raise the reschedule IPI there.
fn kick_remote(target: CpuId) {
    let id = RESCHED_ID.load(Ordering::Acquire);
    if id != usize::MAX {
        ipi::ipi_send(target, id as u8);
    }
}

/// Yield hook handed to `muon-core` (mutexes and friends call
/// `cpu::yield_now`, which lands here once the kernel is up).
fn yield_hook() {
    sched_yield();
}

/// Hardware IPI delivery for [`ipi`]: CPU ids map 1:1 onto APIC ids
/// during bring-up.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn hw_send_ipi(target: CpuId, vector: u8) {
    crate::arch::x86_64::lapic_send_ipi(target.0, vector);
}

/// Wires the dispatch hooks: the reschedule IPI, the scheduler's
/// remote-kick, the core yield hook, and (on hardware) the low-level
/// IPI sender. The one-shot timer hook is installed by the clock
/// driver, which owns the hardware.
///
/// # Errors
///
/// Propagates IPI id exhaustion.
pub fn init() -> Result<(), Errno> {
    let id = ipi::ipi_alloc(resched_ipi)?;
    RESCHED_ID.store(usize::from(id), Ordering::Release);
    muon_sched::set_kick_fn(kick_remote);
    cpu::set_yield_fn(yield_hook);
    #[cfg(all(target_os = "none", target_arch = "x86_64"))]
    ipi::set_send_fn(hw_send_ipi);
    Ok(())
}

/// Timeslice expiry, called by the clock interrupt handler.
///
/// With preemption disabled (a spinlock is held somewhere above us) the
/// slice is extended by the short kick interval instead; otherwise the
/// running thread is re-queued — demoted one level under MLFQ — the
/// next thread takes the CPU, and the full quantum is re-armed.
pub fn sched_tick() {
    let Some(k) = try_kernel() else { return };
    let me = cpu::current_cpu();

    if !muon_sched::sched_preempt_allowed() {
        muon_sched::sched_oneshot(true);
        return;
    }

    syscall::set_resched_on(me);
    let next = k.sched.slice_expired(me);
    switch_to(me, next);
    muon_sched::sched_oneshot(false);
}

/// Voluntary yield: the running thread goes to the tail of its level
/// (no demotion) and the next thread runs.
pub fn sched_yield() {
    let Some(k) = try_kernel() else {
        core::hint::spin_loop();
        return;
    };
    let me = cpu::current_cpu();
    let next = k.sched.yield_current(me);
    switch_to(me, next);
}

/// Hands the CPU over: current-thread slot, address space, registers.
///
/// Returns (to the *previous* thread's context) when that thread is
/// eventually switched back in; on the hosted build it returns
/// immediately after the bookkeeping.
fn switch_to(me: CpuId, next: Option<Arc<Proc>>) {
    let prev = proc::this_td();
    proc::set_current(next.clone());
    let _ = me;

    let Some(next) = next else {
        // Idle: nothing to run; the caller (tick handler or idle loop)
        // decides whether to halt.
        return;
    };

    if let Some(vas) = next.vas.lock().clone() {
        vas.activate();
    }

    #[cfg(target_os = "none")]
    {
        if let Some(p) = &prev {
            if Arc::ptr_eq(p, &next) {
                return;
            }
        }
        // SAFETY: This CPU is the sole user of both PCBs (interrupts are
        // off in the tick path, and a yielding thread is parked before
        // anything else can run it); `next` was built by the spawn path
        // or a previous switch.
        unsafe {
            let prev_pcb: *mut crate::arch::Pcb = match &prev {
                Some(p) => p.pcb.force_get(),
                None => core::ptr::null_mut(),
            };
            let next_pcb: *const crate::arch::Pcb = next.pcb.force_get();
            crate::arch::cpu_switch(prev_pcb, next_pcb);
        }
    }
    #[cfg(not(target_os = "none"))]
    let _ = prev;
}

/// The per-CPU dispatch loop. The boot path enters it once bring-up is
/// done and never returns; every CPU parks here whenever it has nothing
/// to run.
#[cfg(target_os = "none")]
pub fn sched_enter() -> ! {
    loop {
        let me = cpu::current_cpu();
        if let Some(k) = try_kernel() {
            if let Some(next) = k.sched.dequeue_td(me) {
                muon_sched::sched_oneshot(false);
                switch_to(me, Some(next));
                continue;
            }
        }
        // Nothing runnable: wait for an interrupt to change that.
        #[cfg(target_arch = "x86_64")]
        // SAFETY: hlt with interrupts enabled; the next interrupt resumes.
        unsafe {
            core::arch::asm!("sti; hlt")
        };
        #[cfg(not(target_arch = "x86_64"))]
        core::hint::spin_loop();
    }
}

/// Landing pad for kernel threads whose entry function returned (the
/// trampoline calls it). Exits the thread and re-enters dispatch.
#[cfg(target_os = "none")]
#[unsafe(no_mangle)]
extern "C" fn muon_kthread_exit() -> ! {
    if let Some(td) = proc::this_td() {
        let _ = proc::exit1(&td, 0);
    }
    sched_enter()
}
