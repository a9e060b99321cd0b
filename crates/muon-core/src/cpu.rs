//! Logical CPU identity and preemption bookkeeping.
//!
//! The scheduler and the spinlocks both need two per-CPU facts: which
//! logical CPU is executing, and whether that CPU may currently be
//! preempted. Both live here so the lock primitives do not have to depend
//! on the scheduler crate.
//!
//! On bare metal the current CPU id is published by the arch bring-up path
//! (one call per AP). Hosted tests run everything on "CPU 0" unless they
//! say otherwise.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Upper bound on logical CPUs the kernel will track.
pub const MAX_CPUS: usize = 64;

/// A logical CPU identifier, 0-based and dense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CpuId(pub u32);

impl CpuId {
    /// Returns the id as an index into per-CPU arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Id of the CPU executing the caller.
///
/// Bare metal reads this from the per-CPU segment set up at bring-up; the
/// hosted build keeps a single published value (tests are free to move it).
static CURRENT_CPU: AtomicU32 = AtomicU32::new(0);

/// Number of CPUs brought online, published once by the boot path.
static ONLINE_CPUS: AtomicU32 = AtomicU32::new(1);

/// Per-CPU preemption-disable depth. Non-zero means the CPU must not be
/// preempted (spinlock held or an explicit `sched_preempt_set(false)`).
static PREEMPT_DEPTH: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

/// Returns the id of the CPU executing the caller.
#[inline]
pub fn current_cpu() -> CpuId {
    CpuId(CURRENT_CPU.load(Ordering::Relaxed))
}

/// Publishes the caller's CPU id. Called once per CPU during bring-up.
pub fn set_current_cpu(id: CpuId) {
    CURRENT_CPU.store(id.0, Ordering::Relaxed);
}

/// Number of CPUs online.
#[inline]
pub fn cpu_count() -> u32 {
    ONLINE_CPUS.load(Ordering::Relaxed)
}

/// Publishes the online CPU count. Called once when SMP bring-up finishes.
pub fn set_cpu_count(n: u32) {
    assert!(n >= 1 && (n as usize) <= MAX_CPUS);
    ONLINE_CPUS.store(n, Ordering::Relaxed);
}

/// Pushes one level of preemption disablement on `cpu`.
#[inline]
pub fn preempt_disable(cpu: CpuId) {
    PREEMPT_DEPTH[cpu.index()].fetch_add(1, Ordering::Acquire);
}

/// Pops one level of preemption disablement on `cpu`.
///
/// # Panics
///
/// Panics if the depth is already zero; an unbalanced enable is an
/// invariant break.
#[inline]
pub fn preempt_enable(cpu: CpuId) {
    let prev = PREEMPT_DEPTH[cpu.index()].fetch_sub(1, Ordering::Release);
    assert!(prev != 0, "preempt_enable: unbalanced on CPU {}", cpu.0);
}

/// Returns `true` if `cpu` may currently be preempted.
#[inline]
pub fn preempt_allowed(cpu: CpuId) -> bool {
    PREEMPT_DEPTH[cpu.index()].load(Ordering::Acquire) == 0
}

/// Scheduler yield hook.
///
/// The mutex sleeps through this instead of spinning; the scheduler crate
/// installs the real implementation at boot. Until then contended mutexes
/// degrade to a polite spin.
static YIELD_FN: AtomicUsize = AtomicUsize::new(0);

/// Installs the scheduler's yield entry point.
pub fn set_yield_fn(f: fn()) {
    YIELD_FN.store(f as usize, Ordering::Release);
}

/// Gives up the CPU if a scheduler is running, else emits a spin hint.
#[inline]
pub fn yield_now() {
    let raw = YIELD_FN.load(Ordering::Acquire);
    if raw == 0 {
        core::hint::spin_loop();
    } else {
        // SAFETY: The word was stored from a `fn()` in `set_yield_fn` and
        // fn pointers are never dangling.
        let f: fn() = unsafe { core::mem::transmute::<usize, fn()>(raw) };
        f();
    }
}
