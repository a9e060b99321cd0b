//! Inter-processor interrupts.
//!
//! Four vectors at the top of the space are reserved for IPIs; up to 16
//! IPI ids share each vector through a per-CPU pending bitmap, so a burst
//! of sends coalesces into one hardware interrupt. Dispatch drains the
//! bitmap in a loop and a per-CPU flag keeps nested deliveries from
//! recursing — a nested send just sets new bits for the running drain to
//! pick up.
//!
//! The TLB-shootdown protocol lives here too: the originator posts the
//! victim address in each target's `cpu_info` slot, sends the shootdown
//! IPI, and spins until every target clears its slot.

use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use muon_core::addr::VirtAddr;
use muon_core::cpu::{self, CpuId, MAX_CPUS};
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

/// Vectors reserved for IPIs.
pub const N_IPIVEC: usize = 4;

/// IPI ids per vector.
pub const IPI_PER_VEC: usize = 16;

/// Highest allocatable IPI id (two vectors' worth, matching the
/// original's 0..31 id space; the other two vectors are headroom).
pub const IPI_MAX_ID: usize = 32;

/// First reserved vector (top of the space).
pub const IPI_VECTOR_BASE: u8 = 0xFC;

/// An IPI callback: runs on the target CPU with that CPU's id.
pub type IpiHandler = fn(CpuId);

/// Registered handlers by IPI id.
static HANDLERS: SpinLock<[Option<IpiHandler>; IPI_MAX_ID]> =
    SpinLock::new([const { None }; IPI_MAX_ID]);

/// Per-CPU pending bitmap, one word per reserved vector.
static PENDING: [[AtomicU16; N_IPIVEC]; MAX_CPUS] =
    [const { [const { AtomicU16::new(0) }; N_IPIVEC] }; MAX_CPUS];

/// Per-CPU "drain in progress" flag.
static DISPATCHING: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Hook delivering the low-level IPI: `f(cpu, vector)`. On hardware this
/// pokes the LAPIC ICR; hosted builds dispatch synchronously instead.
static SEND_FN: AtomicUsize = AtomicUsize::new(0);

/// Installs the hardware IPI-delivery hook.
pub fn set_send_fn(f: fn(CpuId, u8)) {
    SEND_FN.store(f as usize, Ordering::Release);
}

/// Allocates an IPI id and binds `handler` to it.
///
/// # Errors
///
/// [`Errno::Again`] when all ids are taken.
pub fn ipi_alloc(handler: IpiHandler) -> Result<u8, Errno> {
    let mut handlers = HANDLERS.lock();
    let id = handlers.iter().position(Option::is_none).ok_or(Errno::Again)?;
    handlers[id] = Some(handler);
    Ok(id as u8)
}

/// Releases an IPI id allocated with [`ipi_alloc`].
pub fn ipi_free(id: u8) {
    HANDLERS.lock()[usize::from(id)] = None;
}

/// Sends IPI `id` to `target`.
///
/// Sets the pending bit first, then raises the hardware interrupt; with
/// no hardware hook installed (hosted build, or before SMP bring-up) the
/// target's queue is drained synchronously on the calling CPU.
pub fn ipi_send(target: CpuId, id: u8) {
    let id = usize::from(id);
    assert!(id < IPI_MAX_ID, "ipi_send: bad id {id}");
    let vec_idx = id / IPI_PER_VEC;
    PENDING[target.index()][vec_idx].fetch_or(1 << (id % IPI_PER_VEC), Ordering::AcqRel);

    let raw = SEND_FN.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: Stored from a `fn(CpuId, u8)` in `set_send_fn`.
        let send: fn(CpuId, u8) = unsafe { core::mem::transmute::<usize, fn(CpuId, u8)>(raw) };
        send(target, IPI_VECTOR_BASE + vec_idx as u8);
    } else {
        ipi_dispatch(target, vec_idx);
    }
}

/// Drains the pending bitmap for `vector` on `me`. Called from the IPI
/// vector's trap stub (or synchronously, hosted).
///
/// Reentry is coalesced: if a drain is already running on this CPU the
/// new bits are left for it.
pub fn ipi_dispatch(me: CpuId, vec_idx: usize) {
    loop {
        if DISPATCHING[me.index()].swap(true, Ordering::Acquire) {
            return;
        }
        loop {
            let bits = PENDING[me.index()][vec_idx].swap(0, Ordering::AcqRel);
            if bits == 0 {
                break;
            }
            for bit in 0..IPI_PER_VEC {
                if bits & (1 << bit) == 0 {
                    continue;
                }
                let id = vec_idx * IPI_PER_VEC + bit;
                let handler = HANDLERS.lock()[id];
                if let Some(f) = handler {
                    f(me);
                }
            }
        }
        DISPATCHING[me.index()].store(false, Ordering::Release);

        // A bit set between the final swap and the flag clear would
        // otherwise strand its sender; go around once more.
        if PENDING[me.index()][vec_idx].load(Ordering::Acquire) == 0 {
            return;
        }
    }
}

// ── TLB shootdown ───────────────────────────────────────────────────

/// Per-CPU shootdown mailbox: the address to invalidate, zero when idle.
static SHOOTDOWN_VA: [AtomicU64; MAX_CPUS] = [const { AtomicU64::new(0) }; MAX_CPUS];

/// The IPI id used for shootdowns, fixed at init.
static SHOOTDOWN_ID: AtomicUsize = AtomicUsize::new(usize::MAX);

fn shootdown_handler(me: CpuId) {
    let va = SHOOTDOWN_VA[me.index()].swap(0, Ordering::AcqRel);
    if va != 0 {
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        // SAFETY: invlpg only drops a TLB entry.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
        }
        #[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
        let _ = va;
    }
}

/// Reserves the shootdown IPI and points the pmap layer's hook at us.
/// Called once at boot.
///
/// # Errors
///
/// Propagates [`ipi_alloc`] failure.
pub fn shootdown_init() -> Result<(), Errno> {
    let id = ipi_alloc(shootdown_handler)?;
    SHOOTDOWN_ID.store(usize::from(id), Ordering::Release);
    muon_mm::pmap::set_shootdown_fn(tlb_shootdown);
    Ok(())
}

/// Invalidates `va` on every other online CPU and waits for each to
/// acknowledge by clearing its mailbox.
pub fn tlb_shootdown(va: VirtAddr) {
    let id = SHOOTDOWN_ID.load(Ordering::Acquire);
    if id == usize::MAX {
        // Single-CPU boot stage; local flushes already happened.
        return;
    }
    let me = cpu::current_cpu();
    let ncpu = cpu::cpu_count();
    for i in 0..ncpu {
        let target = CpuId(i);
        if target == me {
            continue;
        }
        // Wait for the mailbox: a concurrent originator's address must
        // not be overwritten before its target acknowledges.
        while SHOOTDOWN_VA[target.index()]
            .compare_exchange(0, va.as_u64(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            core::hint::spin_loop();
        }
        ipi_send(target, id as u8);
        while SHOOTDOWN_VA[target.index()].load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static IPI_TEST_LOCK: Mutex<()> = Mutex::new(());

    use core::sync::atomic::AtomicU32;
    static HITS: AtomicU32 = AtomicU32::new(0);

    fn count_handler(_me: CpuId) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn each_send_is_delivered_exactly_once() {
        let _g = IPI_TEST_LOCK.lock().unwrap();
        let id = ipi_alloc(count_handler).unwrap();
        HITS.store(0, Ordering::SeqCst);

        // No hardware hook in hosted builds: sends dispatch synchronously.
        ipi_send(CpuId(2), id);
        ipi_send(CpuId(2), id);
        ipi_send(CpuId(3), id);
        assert_eq!(HITS.load(Ordering::SeqCst), 3);

        // Nothing left pending.
        let vec_idx = usize::from(id) / IPI_PER_VEC;
        assert_eq!(PENDING[2][vec_idx].load(Ordering::SeqCst), 0);
        assert_eq!(PENDING[3][vec_idx].load(Ordering::SeqCst), 0);
        ipi_free(id);
    }

    #[test]
    fn nested_sends_coalesce_without_recursion() {
        let _g = IPI_TEST_LOCK.lock().unwrap();
        static NESTED_HITS: AtomicU32 = AtomicU32::new(0);
        fn nested(me: CpuId) {
            if NESTED_HITS.fetch_add(1, Ordering::SeqCst) == 0 {
                // Re-send to ourselves mid-dispatch; the running drain
                // must pick it up instead of recursing.
                let id = NESTED_TEST_ID.load(Ordering::SeqCst);
                ipi_send(me, id as u8);
            }
        }
        static NESTED_TEST_ID: AtomicU32 = AtomicU32::new(0);

        let id = ipi_alloc(nested).unwrap();
        NESTED_TEST_ID.store(u32::from(id), Ordering::SeqCst);
        NESTED_HITS.store(0, Ordering::SeqCst);

        ipi_send(CpuId(5), id);
        assert_eq!(NESTED_HITS.load(Ordering::SeqCst), 2);
        ipi_free(id);
    }

    #[test]
    fn id_space_is_bounded() {
        let _g = IPI_TEST_LOCK.lock().unwrap();
        let mut taken = Vec::new();
        let err = loop {
            match ipi_alloc(count_handler) {
                Ok(id) => taken.push(id),
                Err(e) => break e,
            }
            assert!(taken.len() <= IPI_MAX_ID);
        };
        assert_eq!(err, Errno::Again);
        for id in taken {
            ipi_free(id);
        }
    }
}
