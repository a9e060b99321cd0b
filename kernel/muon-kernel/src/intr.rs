//! Interrupt vector registry and IPL core.
//!
//! Vector space 0x00–0xFF with the top nibble as the interrupt priority
//! level: registering at IPL `p` allocates a free slot in the 16-vector
//! band `[p << 4, (p << 4) + 15]`. `splraise`/`splx` gate the current
//! CPU's IPL; raising is monotonic and an out-of-order restore is an
//! invariant break, not an error.
//!
//! The registry also feeds `/proc/interrupts`: one row per handler with
//! its hit count.

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use muon_core::cpu::{self, MAX_CPUS};
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;

/// Defer nothing.
pub const IPL_NONE: u8 = 0;
/// Block I/O.
pub const IPL_BIO: u8 = 1;
/// Clock.
pub const IPL_CLOCK: u8 = 2;
/// Defer everything.
pub const IPL_HIGH: u8 = 3;

/// Bits of a vector occupied by the in-band index.
pub const IPL_SHIFT: u8 = 4;

/// Vectors per IPL band.
const BAND_SIZE: usize = 16;

/// Total vector space.
const NVECTORS: usize = 256;

/// A registered interrupt handler.
pub struct IntrHand {
    /// Device name (shows in `/proc/interrupts`).
    pub name: String,
    /// Interrupt source description (`ioapic` routed or `msi`).
    pub source: &'static str,
    /// Handler function; receives the opaque data word.
    pub func: fn(u64),
    /// Priority level requested.
    pub ipl: u8,
    /// Requested legacy IRQ line, or -1 for message-signalled.
    pub irq: i16,
    /// Assigned vector.
    pub vector: u8,
    /// CPU this handler is steered to.
    pub affinity: u32,
    /// Opaque data word passed to `func`.
    pub data: u64,
    /// Times the handler has run.
    nintr: AtomicU64,
}

impl IntrHand {
    /// Times this handler has run.
    pub fn nintr(&self) -> u64 {
        self.nintr.load(Ordering::Relaxed)
    }
}

/// The vector table.
static VECTORS: SpinLock<[Option<Arc<IntrHand>>; NVECTORS]> =
    SpinLock::new([const { None }; NVECTORS]);

/// Per-CPU current IPL.
static CPU_IPL: [AtomicU8; MAX_CPUS] = [const { AtomicU8::new(IPL_NONE) }; MAX_CPUS];

/// Hook programming the external interrupt router (I/O APIC or GIC):
/// `f(irq, vector)`.
static ROUTE_FN: AtomicUsize = AtomicUsize::new(0);

/// Installs the IRQ-routing hook.
pub fn set_irq_route_fn(f: fn(u8, u8)) {
    ROUTE_FN.store(f as usize, Ordering::Release);
}

/// A request to register an interrupt handler.
pub struct IntrRequest {
    /// Handler function.
    pub func: fn(u64),
    /// Requested IPL.
    pub ipl: u8,
    /// Legacy IRQ line to route, or -1 for MSI.
    pub irq: i16,
    /// Opaque data word for the handler.
    pub data: u64,
}

/// Registers a handler, allocating a free vector in the IPL's band.
///
/// When `irq >= 0` the external router is programmed to deliver that line
/// to the assigned vector.
///
/// # Errors
///
/// [`Errno::Inval`] for an IPL beyond the vector space,
/// [`Errno::Again`] when the band is full.
pub fn intr_register(name: &str, req: &IntrRequest) -> Result<Arc<IntrHand>, Errno> {
    if usize::from(req.ipl) >= NVECTORS / BAND_SIZE {
        return Err(Errno::Inval);
    }
    let base = usize::from(req.ipl) << IPL_SHIFT;

    let mut vectors = VECTORS.lock();
    let slot = (base..base + BAND_SIZE)
        .find(|&v| vectors[v].is_none())
        .ok_or(Errno::Again)?;

    let hand = Arc::new(IntrHand {
        name: name.to_string(),
        source: if req.irq >= 0 { "ioapic" } else { "msi" },
        func: req.func,
        ipl: req.ipl,
        irq: req.irq,
        vector: slot as u8,
        affinity: cpu::current_cpu().0,
        data: req.data,
        nintr: AtomicU64::new(0),
    });
    vectors[slot] = Some(Arc::clone(&hand));
    drop(vectors);

    if req.irq >= 0 {
        let raw = ROUTE_FN.load(Ordering::Acquire);
        if raw != 0 {
            // SAFETY: Stored from a `fn(u8, u8)` in `set_irq_route_fn`.
            let route: fn(u8, u8) = unsafe { core::mem::transmute::<usize, fn(u8, u8)>(raw) };
            route(req.irq as u8, slot as u8);
        }
    }

    log::debug!(target: "intr", "{name}: vector {slot:#04x} ipl {}", req.ipl);
    Ok(hand)
}

/// Removes the handler on `vector`.
pub fn intr_unregister(vector: u8) {
    VECTORS.lock()[usize::from(vector)] = None;
}

/// Delivers the interrupt on `vector`: raises the IPL to the vector's
/// band, runs the handler, restores.
///
/// # Panics
///
/// Panics on a vector with no registered handler — stray vectors are an
/// invariant break.
pub fn intr_dispatch(vector: u8) {
    let hand = VECTORS.lock()[usize::from(vector)]
        .as_ref()
        .map(Arc::clone)
        .unwrap_or_else(|| panic!("intr: stray vector {vector:#04x}"));

    let old = splraise(hand.ipl);
    hand.nintr.fetch_add(1, Ordering::Relaxed);
    (hand.func)(hand.data);
    splx(old);
}

/// Snapshot of all registered handlers, vector order.
pub fn intr_list() -> Vec<Arc<IntrHand>> {
    VECTORS.lock().iter().flatten().cloned().collect()
}

/// Renders `/proc/interrupts`.
pub fn render_proc_interrupts() -> String {
    let mut out = String::new();
    for hand in intr_list() {
        out.push_str(&format!(
            "CPU{}\t{}\t{}\t{}\n",
            hand.affinity,
            hand.nintr(),
            hand.source,
            hand.name
        ));
    }
    out
}

/// Raises the current CPU's IPL to `ipl`, returning the previous level
/// for the matching [`splx`].
///
/// Raising to a level below the current one is a no-op (the level stays);
/// the IPL is monotonically non-decreasing between a raise and its
/// restore.
pub fn splraise(ipl: u8) -> u8 {
    let me = cpu::current_cpu().index();
    let old = CPU_IPL[me].load(Ordering::Acquire);
    if ipl > old {
        CPU_IPL[me].store(ipl, Ordering::Release);
    }
    old
}

/// Restores the IPL saved by [`splraise`].
///
/// # Panics
///
/// Panics when `old` exceeds the current level — releasing to a *higher*
/// IPL means the raise/restore pairs are crossed.
pub fn splx(old: u8) {
    let me = cpu::current_cpu().index();
    let cur = CPU_IPL[me].load(Ordering::Acquire);
    assert!(old <= cur, "splx: bad IPL release ({old} > {cur})");
    CPU_IPL[me].store(old, Ordering::Release);
}

/// The current CPU's IPL.
pub fn current_ipl() -> u8 {
    CPU_IPL[cpu::current_cpu().index()].load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// The vector table and IPL are process-globals; serialize the tests
    /// that touch them.
    static INTR_TEST_LOCK: Mutex<()> = Mutex::new(());

    fn nop(_: u64) {}

    #[test]
    fn bio_registration_lands_in_band_and_counts_hits() {
        let _g = INTR_TEST_LOCK.lock().unwrap();
        let hand = intr_register(
            "i8042",
            &IntrRequest {
                func: nop,
                ipl: IPL_BIO,
                irq: 1,
                data: 0,
            },
        )
        .unwrap();
        assert!((0x10..=0x1F).contains(&hand.vector));
        assert_ne!(hand.vector, 0);
        assert_eq!(hand.source, "ioapic");

        for _ in 0..3 {
            intr_dispatch(hand.vector);
        }
        assert_eq!(hand.nintr(), 3);
        intr_unregister(hand.vector);
    }

    #[test]
    fn band_exhaustion_reports_again() {
        let _g = INTR_TEST_LOCK.lock().unwrap();
        let mut hands = Vec::new();
        loop {
            match intr_register(
                "filler",
                &IntrRequest {
                    func: nop,
                    ipl: IPL_CLOCK,
                    irq: -1,
                    data: 0,
                },
            ) {
                Ok(h) => hands.push(h),
                Err(e) => {
                    assert_eq!(e, Errno::Again);
                    break;
                }
            }
            assert!(hands.len() <= 16, "band should cap at 16 vectors");
        }
        for h in hands {
            intr_unregister(h.vector);
        }
    }

    #[test]
    fn spl_pairs_restore_exactly() {
        let _g = INTR_TEST_LOCK.lock().unwrap();
        let base = current_ipl();
        let old = splraise(IPL_CLOCK);
        assert_eq!(old, base);
        let old2 = splraise(IPL_HIGH);
        assert_eq!(old2, IPL_CLOCK.max(base));
        // Raising to a lower level must not lower the IPL.
        let old3 = splraise(IPL_BIO);
        assert_eq!(current_ipl(), IPL_HIGH);
        splx(old3);
        splx(old2);
        splx(old);
        assert_eq!(current_ipl(), base);
    }

    #[test]
    fn proc_interrupts_rows() {
        let _g = INTR_TEST_LOCK.lock().unwrap();
        let hand = intr_register(
            "rtc",
            &IntrRequest {
                func: nop,
                ipl: IPL_CLOCK,
                irq: 8,
                data: 0,
            },
        )
        .unwrap();
        intr_dispatch(hand.vector);

        let text = render_proc_interrupts();
        let row = text
            .lines()
            .find(|l| l.ends_with("rtc"))
            .expect("rtc row present");
        let mut cols = row.split('\t');
        assert!(cols.next().unwrap().starts_with("CPU"));
        assert_eq!(cols.next().unwrap(), "1");
        assert_eq!(cols.next().unwrap(), "ioapic");
        intr_unregister(hand.vector);
    }
}
