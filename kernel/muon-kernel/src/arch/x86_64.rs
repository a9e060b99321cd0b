//! x86-64 machine-dependent state.

/// Saved register state at a trap boundary.
///
/// Byte-for-byte what lands in a coredump, so the layout is `#[repr(C)]`
/// and append-only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    /// General-purpose registers in push order.
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Trap number.
    pub trapno: u64,
    /// Hardware error code (0 when the vector pushes none).
    pub error_code: u64,
    /// Interrupted instruction pointer.
    pub rip: u64,
    /// Code segment selector.
    pub cs: u64,
    /// Saved flags.
    pub rflags: u64,
    /// Interrupted stack pointer.
    pub rsp: u64,
    /// Stack segment selector.
    pub ss: u64,
}

impl TrapFrame {
    /// The frame as raw bytes (coredump payload).
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) struct of plain u64s; any byte pattern is valid.
        unsafe {
            core::slice::from_raw_parts(
                (self as *const Self).cast::<u8>(),
                core::mem::size_of::<Self>(),
            )
        }
    }
}

/// Per-thread kernel register save area (callee-saved set + stack).
///
/// `#[repr(C)]` with fixed field order: the switch stub addresses the
/// fields by byte offset (`ksp` 0x00, `kip` 0x08, `rbx` 0x10, `rbp`
/// 0x18, `r12` 0x20 ... `r15` 0x38).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Pcb {
    /// Kernel stack pointer.
    pub ksp: u64,
    /// Instruction pointer to resume at.
    pub kip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Page-table root (CR3 image).
    pub cr3: u64,
}

// ── context switch ──────────────────────────────────────────────────
//
// `muon_cpu_switch` parks the callee-saved state of the running thread
// in `prev` (skipped when null: first dispatch on a CPU abandons the
// boot stack) and resumes `next` at its saved `kip`/`ksp`. A previously
// parked thread resumes at the `2:` label and simply returns to its
// caller in `switch_to`.
//
// `muon_kthread_entry` is the first `kip` of every kernel thread: the
// spawn path parks the entry function in r12 and its argument in r13;
// the stub shuffles them into the SysV argument register and falls into
// `muon_kthread_exit` when the entry returns.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
core::arch::global_asm!(
    r#"
.global muon_cpu_switch
muon_cpu_switch:
    test rdi, rdi
    jz 1f
    mov [rdi + 0x00], rsp
    lea rax, [rip + 2f]
    mov [rdi + 0x08], rax
    mov [rdi + 0x10], rbx
    mov [rdi + 0x18], rbp
    mov [rdi + 0x20], r12
    mov [rdi + 0x28], r13
    mov [rdi + 0x30], r14
    mov [rdi + 0x38], r15
1:
    mov rsp, [rsi + 0x00]
    mov rbx, [rsi + 0x10]
    mov rbp, [rsi + 0x18]
    mov r12, [rsi + 0x20]
    mov r13, [rsi + 0x28]
    mov r14, [rsi + 0x30]
    mov r15, [rsi + 0x38]
    jmp [rsi + 0x08]
2:
    ret

.global muon_kthread_entry
muon_kthread_entry:
    mov rdi, r13
    call r12
    call muon_kthread_exit
"#
);

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
unsafe extern "C" {
    fn muon_cpu_switch(prev: *mut Pcb, next: *const Pcb);
    fn muon_kthread_entry();
}

/// Parks the current context in `prev` (skipped when null) and resumes
/// `next`.
///
/// # Safety
///
/// Interrupts must be off on this CPU, both PCBs must be exclusively
/// owned for the duration, and `next` must describe a context built by
/// this switch or by the spawn path.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub unsafe fn cpu_switch(prev: *mut Pcb, next: *const Pcb) {
    // SAFETY: Forwarded to the caller.
    unsafe { muon_cpu_switch(prev, next) };
}

/// Initial instruction pointer of a fresh kernel thread.
///
/// Hosted builds never enter a parked context, so they carry a null
/// sentinel instead of the trampoline address.
pub fn kthread_entry_ip() -> u64 {
    #[cfg(target_os = "none")]
    {
        muon_kthread_entry as usize as u64
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

// ── local APIC pokes (timer + IPI delivery) ─────────────────────────

/// Local APIC MMIO base (the firmware default; an MSR probe would
/// confirm it).
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
const LAPIC_BASE: u64 = 0xFEE0_0000;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
unsafe fn lapic_write(reg: u64, val: u32) {
    use muon_core::addr::PhysAddr;
    let ptr = crate::boot::kernel()
        .pmm
        .phys_to_virt(PhysAddr::new(LAPIC_BASE + reg))
        .cast::<u32>();
    // SAFETY: The LAPIC register window is direct-mapped and `reg` is a
    // register offset supplied by this module.
    unsafe { ptr.write_volatile(val) };
}

/// Arms the LAPIC timer to fire `vector` once after roughly `usec`
/// microseconds.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn lapic_timer_oneshot(vector: u8, usec: u32) {
    // Nominal bus clock at divide-by-16. A calibration pass against the
    // PIT or HPET would refine this constant.
    const TICKS_PER_USEC: u32 = 64;
    // SAFETY: Register offsets are the architectural LAPIC layout.
    unsafe {
        lapic_write(0x3E0, 0b0011); // divide configuration: 16
        lapic_write(0x320, u32::from(vector)); // LVT timer, one-shot, unmasked
        lapic_write(0x380, usec.saturating_mul(TICKS_PER_USEC));
    }
}

/// Sends `vector` to the CPU with the given APIC id.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn lapic_send_ipi(apic_id: u32, vector: u8) {
    // SAFETY: ICR high then low, per the architectural protocol; the
    // write to the low word issues the IPI.
    unsafe {
        lapic_write(0x310, apic_id << 24);
        lapic_write(0x300, u32::from(vector) | (1 << 14)); // assert
    }
}

/// Signals end-of-interrupt.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub fn lapic_eoi() {
    // SAFETY: The EOI register ignores its value.
    unsafe { lapic_write(0xB0, 0) };
}
