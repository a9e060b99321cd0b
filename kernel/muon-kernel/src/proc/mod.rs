//! Process/thread lifecycle.
//!
//! Threads are the unit of scheduling; a process is its root thread plus
//! the leaf threads hanging off its `leafq`. Creation goes through
//! [`spawn`] (kernel thread or user entry) or [`fork1`]; teardown through
//! [`exit1`], which leaves a zombie for a live parent to reap with
//! [`waitpid`]. A fatal user trap drops a coredump in `/tmp` before the
//! thread is released.

pub mod exec;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use muon_core::addr::{PAGE_SIZE, PhysAddr};
use muon_core::cpu::{self, CpuId, MAX_CPUS};
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;
use muon_fs::{FdTable, OpenFlags, Vcache};
use muon_mm::{MmapLedger, Vas};
use muon_sched::Schedulable;

use crate::arch::{Pcb, TrapFrame};
use crate::boot::kernel;
use crate::config::{PROC_STACK_PAGES, PROC_SIGMAX};
use crate::signal::{SigSet, SignalState, sigaddset};
use crate::vsr::VsrDomains;

/// Process identifier.
pub type Pid = u32;

/// Thread is tearing down.
pub const PROC_EXITING: u32 = 1 << 0;
/// `execve` replaced the image (cleared by the scheduler).
pub const PROC_EXEC: u32 = 1 << 1;
/// Dead but not yet reaped.
pub const PROC_ZOMB: u32 = 1 << 2;
/// Leaf queue is active.
pub const PROC_LEAFQ: u32 = 1 << 3;
/// A parent is blocked in `waitpid` on this thread.
pub const PROC_WAITED: u32 = 1 << 4;
/// Kernel thread (never returns to user mode).
pub const PROC_KTD: u32 = 1 << 5;
/// Sleeping; not on any run queue.
pub const PROC_SLEEP: u32 = 1 << 6;
/// Pinned to the CPU in `affinity`.
pub const PROC_PINNED: u32 = 1 << 7;

/// Process credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ucred {
    /// Effective user id.
    pub uid: u32,
    /// Effective group id.
    pub gid: u32,
}

/// How a spawned thread starts.
pub enum SpawnEntry {
    /// Kernel thread entering `f(arg)`.
    Kernel(fn(usize), usize),
    /// User thread entering at a virtual address (set up by `execve`).
    User(u64),
}

/// A thread (and, for root threads, the process around it).
pub struct Proc {
    /// Process id.
    pub pid: Pid,
    /// Parent thread (empty for proc0 and orphans).
    pub parent: SpinLock<Weak<Proc>>,
    /// Credentials.
    pub cred: SpinLock<Ucred>,
    /// `PROC_*` flags.
    flags: AtomicU32,
    /// Scheduler queue level.
    priority: AtomicUsize,
    /// Pinned CPU (valid with `PROC_PINNED`).
    affinity: AtomicI32,
    /// Exit status latched by `exit1`.
    exit_status: AtomicI32,
    /// Physical base of the thread stack.
    stack_base: AtomicU64,
    /// Open files.
    pub fds: SpinLock<FdTable>,
    /// VSR domain tables.
    pub vsr: SpinLock<VsrDomains>,
    /// Per-process vnode cache.
    pub vcache: SpinLock<Vcache>,
    /// The mmap ledger.
    pub mlgdr: SpinLock<MmapLedger>,
    /// User address space (kernel threads have none).
    pub vas: SpinLock<Option<Arc<Vas>>>,
    /// Trap-frame snapshot (coredumps, signal delivery).
    pub tf: SpinLock<TrapFrame>,
    /// MD register save area.
    pub pcb: SpinLock<Pcb>,
    /// Signal queue + actions.
    pub sig: SpinLock<SignalState>,
    /// Child threads.
    pub leafq: SpinLock<Vec<Arc<Proc>>>,
    /// Exec image record (set by `execve`).
    pub exec: SpinLock<Option<exec::ExecProg>>,
}

impl Proc {
    /// Current `PROC_*` flags.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Sets flag bits.
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clears flag bits.
    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Exit status (meaningful once `PROC_ZOMB`).
    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// Physical base of the thread stack (zero once released).
    pub fn stack_base(&self) -> PhysAddr {
        PhysAddr::new(self.stack_base.load(Ordering::Acquire))
    }

    /// Marks the thread sleeping (dispatchers will skip it).
    pub fn sleep(&self) {
        self.set_flags(PROC_SLEEP);
    }

    /// Clears the sleep flag and re-queues the thread. A thread that was
    /// not sleeping is left alone, so a racing waker cannot double-queue
    /// it.
    pub fn wakeup(self: &Arc<Self>) {
        let prev = self.flags.fetch_and(!PROC_SLEEP, Ordering::AcqRel);
        if prev & PROC_SLEEP != 0 {
            kernel().sched.wakeup(Arc::clone(self));
        }
    }
}

impl Schedulable for Proc {
    fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    fn set_priority(&self, prio: usize) {
        self.priority.store(prio, Ordering::Relaxed);
    }

    fn pinned_cpu(&self) -> Option<CpuId> {
        if self.flags() & PROC_PINNED != 0 {
            let aff = self.affinity.load(Ordering::Relaxed);
            (aff >= 0).then(|| CpuId(aff as u32))
        } else {
            None
        }
    }

    fn is_runnable(&self) -> bool {
        self.flags() & (PROC_SLEEP | PROC_EXITING | PROC_ZOMB) == 0
    }
}

/// Next PID to assign.
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// PID → thread, every live (and zombie) thread.
static PROC_TABLE: SpinLock<BTreeMap<Pid, Arc<Proc>>> = SpinLock::new(BTreeMap::new());

/// Per-CPU current thread.
static CURRENT: [SpinLock<Option<Arc<Proc>>>; MAX_CPUS] = [const { SpinLock::new(None) }; MAX_CPUS];

/// The thread running on the calling CPU.
pub fn this_td() -> Option<Arc<Proc>> {
    CURRENT[cpu::current_cpu().index()].lock().clone()
}

/// Installs `td` as the calling CPU's current thread.
pub fn set_current(td: Option<Arc<Proc>>) {
    *CURRENT[cpu::current_cpu().index()].lock() = td;
}

/// Looks a thread up by pid.
pub fn lookup_proc(pid: Pid) -> Option<Arc<Proc>> {
    PROC_TABLE.lock().get(&pid).cloned()
}

/// Number of threads in the table (live + zombie).
pub fn proc_count() -> usize {
    PROC_TABLE.lock().len()
}

/// Pins `td` to a logical CPU.
pub fn proc_pin(td: &Proc, cpu_id: CpuId) {
    td.affinity.store(cpu_id.0 as i32, Ordering::Relaxed);
    td.set_flags(PROC_PINNED);
}

/// Releases a pin.
pub fn proc_unpin(td: &Proc) {
    td.clear_flags(PROC_PINNED);
    td.affinity.store(-1, Ordering::Relaxed);
}

/// Prepares the MD state of a fresh thread: stack pointer at the top of
/// the new stack, entry in the saved context. Kernel threads start in
/// the arch trampoline, which unpacks the entry function and argument
/// from the PCB's callee-saved slots.
fn md_spawn(td: &Proc, entry: &SpawnEntry, stack_top: u64) {
    let mut pcb = td.pcb.lock();
    pcb.ksp = stack_top;
    match entry {
        SpawnEntry::Kernel(f, arg) => {
            crate::arch::pcb_set_kthread(&mut pcb, *f, *arg);
        }
        SpawnEntry::User(ip) => {
            pcb.kip = 0;
            let mut tf = td.tf.lock();
            tf.set_entry(*ip, stack_top);
        }
    }
}

impl TrapFrame {
    /// Points the frame at a user entry.
    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    pub fn set_entry(&mut self, ip: u64, sp: u64) {
        self.rip = ip;
        self.rsp = sp;
    }

    /// Points the frame at a user entry.
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    pub fn set_entry(&mut self, ip: u64, sp: u64) {
        self.elr = ip;
        self.sp = sp;
    }
}

/// Creates a thread.
///
/// The new thread gets cloned credentials, empty fd/VSR/vcache/ledger
/// state, a `PROC_STACK_PAGES` stack, and a seat on the run queues. It is
/// linked onto `parent`'s leaf queue when a parent is given.
///
/// # Errors
///
/// [`Errno::Nomem`] when the stack cannot be allocated.
pub fn spawn(
    parent: Option<&Arc<Proc>>,
    entry: SpawnEntry,
    flags: u32,
) -> Result<Arc<Proc>, Errno> {
    let k = kernel();
    let stack = k.pmm.alloc_pageframe(PROC_STACK_PAGES);
    if stack.is_zero() {
        return Err(Errno::Nomem);
    }
    let stack_top = k.pmm.phys_to_virt(stack) as u64 + (PROC_STACK_PAGES * PAGE_SIZE) as u64;

    let cred = parent.map_or_else(Ucred::default, |p| *p.cred.lock());
    let td = Arc::new(Proc {
        pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        parent: SpinLock::new(parent.map_or_else(Weak::new, Arc::downgrade)),
        cred: SpinLock::new(cred),
        flags: AtomicU32::new(flags),
        priority: AtomicUsize::new(0),
        affinity: AtomicI32::new(-1),
        exit_status: AtomicI32::new(0),
        stack_base: AtomicU64::new(stack.as_u64()),
        fds: SpinLock::new(FdTable::new()),
        vsr: SpinLock::new(VsrDomains::new()),
        vcache: SpinLock::new(Vcache::new()),
        mlgdr: SpinLock::new(MmapLedger::new()),
        vas: SpinLock::new(None),
        tf: SpinLock::new(TrapFrame::default()),
        pcb: SpinLock::new(Pcb::default()),
        sig: SpinLock::new(SignalState::new()),
        leafq: SpinLock::new(Vec::new()),
        exec: SpinLock::new(None),
    });

    md_spawn(&td, &entry, stack_top);

    if let Some(parent) = parent {
        parent.set_flags(PROC_LEAFQ);
        parent.leafq.lock().push(Arc::clone(&td));
    }

    PROC_TABLE.lock().insert(td.pid, Arc::clone(&td));
    k.sched.admit(Arc::clone(&td));
    log::debug!(target: "proc", "spawned pid {}", td.pid);
    Ok(td)
}

/// Forks `parent`: clones the address space copy-on-write, duplicates the
/// fd table (with vnode references) and the VSR shadows, and starts the
/// child where the parent trapped with a zero return value.
///
/// # Errors
///
/// Allocation failures unwind and propagate.
pub fn fork1(parent: &Arc<Proc>) -> Result<Arc<Proc>, Errno> {
    let k = kernel();
    let child = spawn(Some(parent), SpawnEntry::User(0), 0)?;

    // Address space: fresh tree, ledger cloned COW against the parent's.
    let parent_vas = parent.vas.lock().clone();
    if let Some(pvas) = parent_vas {
        let cvas = Arc::new(Vas::new(Arc::clone(&k.pmm), true)?);
        let child_lgdr = parent.mlgdr.lock().clone_for_fork(&pvas, &k.pmm)?;
        *child.mlgdr.lock() = child_lgdr;
        *child.vas.lock() = Some(cvas);
    }

    *child.fds.lock() = parent.fds.lock().clone_for_fork();
    *child.vsr.lock() = parent.vsr.lock().clone_for_fork();
    // The exec image (its frames are owned, not COW objects) stays with
    // the parent; a forked child is expected to execve.

    // The child resumes at the parent's trap point, reporting zero.
    let mut tf = *parent.tf.lock();
    tf.set_retval(0);
    *child.tf.lock() = tf;

    Ok(child)
}

impl TrapFrame {
    /// Sets the syscall return-value register.
    #[cfg(not(all(target_os = "none", target_arch = "aarch64")))]
    pub fn set_retval(&mut self, v: u64) {
        self.rax = v;
    }

    /// Sets the syscall return-value register.
    #[cfg(all(target_os = "none", target_arch = "aarch64"))]
    pub fn set_retval(&mut self, v: u64) {
        self.x[0] = v;
    }
}

/// Terminates `td`: exits its leaves, releases user memory and files,
/// and either zombifies it (live parent) or frees it outright.
///
/// # Errors
///
/// Propagates nothing today; the signature leaves room for teardown
/// failures that must reach `waitpid`.
pub fn exit1(td: &Arc<Proc>, status: i32) -> Result<(), Errno> {
    let k = kernel();
    td.set_flags(PROC_EXITING);
    td.exit_status.store(status, Ordering::Release);

    // Leaves go down with the root; nobody is left to reap them.
    let leaves: Vec<Arc<Proc>> = core::mem::take(&mut *td.leafq.lock());
    for leaf in leaves {
        if leaf.flags() & (PROC_EXITING | PROC_ZOMB) == 0 {
            let _ = exit1(&leaf, status);
        }
        PROC_TABLE.lock().remove(&leaf.pid);
    }

    // Release the user side: mappings, then the address space.
    {
        let vas = td.vas.lock().take();
        if let Some(vas) = vas {
            td.mlgdr.lock().clear(&vas);
        }
    }
    exec::release_loadmap(td);
    td.fds.lock().close_all(Some(&td.vcache));
    td.vsr.lock().destroy();

    // The thread stack.
    let stack = td.stack_base.swap(0, Ordering::AcqRel);
    if stack != 0 {
        k.pmm.free_frame(PhysAddr::new(stack), PROC_STACK_PAGES);
    }

    k.sched.retire();

    let parent = td.parent.lock().upgrade();
    match parent {
        Some(parent) => {
            td.set_flags(PROC_ZOMB);
            // The reaper may be asleep in waitpid on us.
            parent.wakeup();
        }
        None => {
            PROC_TABLE.lock().remove(&td.pid);
        }
    }
    log::debug!(target: "proc", "pid {} exited ({})", td.pid, status);
    Ok(())
}

/// Finds `parent`'s child with the given pid.
pub fn get_child(parent: &Proc, pid: Pid) -> Option<Arc<Proc>> {
    parent.leafq.lock().iter().find(|c| c.pid == pid).cloned()
}

/// Blocks until child `pid` exits, then reaps it.
///
/// The parent sleeps off the run queues; the child's `exit1` wakes it.
///
/// # Errors
///
/// [`Errno::Child`] when `pid` is not a child of `parent`.
pub fn waitpid(parent: &Arc<Proc>, pid: Pid) -> Result<(Pid, i32), Errno> {
    let child = get_child(parent, pid).ok_or(Errno::Child)?;
    child.set_flags(PROC_WAITED);

    while child.flags() & PROC_ZOMB == 0 {
        parent.sleep();
        // The child may have zombified between the check and the sleep
        // flag going up; re-check before actually leaving the CPU.
        if child.flags() & PROC_ZOMB != 0 {
            break;
        }
        cpu::yield_now();
    }
    parent.clear_flags(PROC_SLEEP);

    // Reap: out of the table, off the leaf queue.
    PROC_TABLE.lock().remove(&pid);
    parent.leafq.lock().retain(|c| c.pid != pid);
    Ok((pid, child.exit_status()))
}

/// Writes `/tmp/core.<pid>`: `{u32 pid, u64 fault_addr, trapframe,
/// u32 crc32}` with the CRC taken over everything before it.
///
/// # Errors
///
/// Filesystem errors propagate (a missing `/tmp` means no dump).
pub fn proc_coredump(td: &Proc, fault_addr: u64) -> Result<(), Errno> {
    let k = kernel();
    let mut body: Vec<u8> = Vec::new();
    body.extend_from_slice(&td.pid.to_le_bytes());
    body.extend_from_slice(&fault_addr.to_le_bytes());
    body.extend_from_slice(td.tf.lock().as_bytes());

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    body.extend_from_slice(&hasher.finalize().to_le_bytes());

    let path = format!("/tmp/core.{}", td.pid);
    let mut fds = FdTable::new();
    let fd = fds.open(&k.ns, &path, OpenFlags::WRITE | OpenFlags::CREATE)?;
    fds.write(fd, &body)?;
    fds.close(fd, None)?;
    log::info!(target: "proc", "core dumped: {path}");
    Ok(())
}

/// Delivers a fatal signal to `td` and, for faults, drops a coredump.
/// Used by the trap layer when a fault cannot be resolved.
pub fn proc_fatal(td: &Arc<Proc>, signo: usize, fault_addr: u64) {
    if signo == crate::signal::SIGSEGV {
        let _ = proc_coredump(td, fault_addr);
    }
    let mut set = SigSet::default();
    let _ = sigaddset(&mut set, signo.min(PROC_SIGMAX - 1));
    td.sig.lock().sendsig(set, 2);
}
