//! Syscall dispatch.
//!
//! The architecture trap stub deposits the six register arguments in a
//! [`SyscallArgs`] and calls [`syscall_dispatch`]. The number indexes a
//! fixed table; out-of-range numbers answer `-EINVAL`. Handlers return a
//! signed value with negative meaning errno. The dispatcher runs at
//! `IPL_HIGH`, drains pending signals on the way out, and honors a
//! pending reschedule before user mode resumes.

mod memory;
mod process;
mod vfs;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use muon_core::cpu::{self, CpuId, MAX_CPUS};
use muon_core::errno::Errno;

use crate::intr::{IPL_HIGH, splraise, splx};
use crate::proc::{Proc, exit1};
use crate::signal::SigDisposition;
use crate::sysctl;
use crate::usercopy::{copyin, copyout};

/// Arguments as deposited by the trap stub.
pub struct SyscallArgs {
    /// The six register-passed arguments.
    pub args: [usize; 6],
    /// The calling thread.
    pub td: Arc<Proc>,
}

impl SyscallArgs {
    /// Argument `i` as a u64.
    pub fn u64(&self, i: usize) -> u64 {
        self.args[i] as u64
    }
}

/// Syscall return type: negative values are errno codes.
pub type ScRet = i64;

type Handler = fn(&SyscallArgs) -> ScRet;

pub const SYS_EXIT: usize = 0;
pub const SYS_OPEN: usize = 1;
pub const SYS_READ: usize = 2;
pub const SYS_CLOSE: usize = 3;
pub const SYS_STAT: usize = 4;
pub const SYS_SYSCTL: usize = 5;
pub const SYS_WRITE: usize = 6;
pub const SYS_SPAWN: usize = 7;
pub const SYS_REBOOT: usize = 8;
pub const SYS_MMAP: usize = 9;
pub const SYS_MUNMAP: usize = 10;
pub const SYS_ACCESS: usize = 11;
pub const SYS_LSEEK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_INJECT: usize = 14;
pub const SYS_GETPID: usize = 15;
pub const SYS_GETPPID: usize = 16;
pub const SYS_SETUID: usize = 17;
pub const SYS_GETUID: usize = 18;
pub const SYS_WAITPID: usize = 19;

/// Number of defined syscalls.
pub const NSYSCALL: usize = 20;

static SYSCALL_TABLE: [Handler; NSYSCALL] = [
    process::sys_exit,
    vfs::sys_open,
    vfs::sys_read,
    vfs::sys_close,
    vfs::sys_stat,
    sys_sysctl,
    vfs::sys_write,
    process::sys_spawn,
    process::sys_reboot,
    memory::sys_mmap,
    memory::sys_munmap,
    vfs::sys_access,
    vfs::sys_lseek,
    process::sys_sleep,
    process::sys_inject,
    process::sys_getpid,
    process::sys_getppid,
    process::sys_setuid,
    process::sys_getuid,
    process::sys_waitpid,
];

/// Per-CPU "reschedule before returning to user mode" flag, set by the
/// preemption timer.
static RESCHED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Requests a reschedule on `cpu` at its next user return.
pub fn set_resched_on(cpu: CpuId) {
    RESCHED[cpu.index()].store(true, Ordering::Release);
}

/// Requests a reschedule on the current CPU at the next user return.
pub fn set_resched() {
    set_resched_on(cpu::current_cpu());
}

fn take_resched() -> bool {
    RESCHED[cpu::current_cpu().index()].swap(false, Ordering::AcqRel)
}

/// Drains `td`'s signal queue; a terminating disposition exits the
/// process. Returns `true` when the thread was terminated.
pub fn dispatch_signals(td: &Arc<Proc>) -> bool {
    loop {
        let next = td.sig.lock().dispatch_one();
        match next {
            None => return false,
            Some((ksig, SigDisposition::Terminate)) => {
                let _ = exit1(td, 128 + ksig.signo as i32);
                return true;
            }
            Some(_) => {}
        }
    }
}

/// The syscall entry: dispatches `nr`, then performs the return-to-user
/// duties (signals, pending reschedule).
pub fn syscall_dispatch(td: &Arc<Proc>, nr: usize, args: [usize; 6]) -> ScRet {
    let old = splraise(IPL_HIGH);
    let ret = if nr >= NSYSCALL {
        Errno::Inval.as_neg()
    } else {
        let sc = SyscallArgs {
            args,
            td: Arc::clone(td),
        };
        SYSCALL_TABLE[nr](&sc)
    };
    splx(old);

    dispatch_signals(td);
    if take_resched() {
        muon_sched::sched_oneshot(true);
    }
    ret
}

/// `sysctl(name, oldp, oldlenp, newp, newlen)`.
fn sys_sysctl(sc: &SyscallArgs) -> ScRet {
    let name = sc.args[0] as u32;
    let oldp = sc.u64(1);
    let oldlenp = sc.u64(2);
    let newp = sc.u64(3);
    let newlen = sc.args[4];

    let new_bytes = if newp != 0 && newlen > 0 {
        let mut buf = alloc::vec![0u8; newlen.min(256)];
        if let Err(e) = copyin(&sc.td, newp, &mut buf) {
            return e.as_neg();
        }
        Some(buf)
    } else {
        None
    };

    let old = match sysctl::kernel_sysctl(name, new_bytes.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.as_neg(),
    };

    if oldp != 0 && oldlenp != 0 {
        let mut lenbuf = [0u8; 8];
        if let Err(e) = copyin(&sc.td, oldlenp, &mut lenbuf) {
            return e.as_neg();
        }
        let cap = u64::from_le_bytes(lenbuf) as usize;
        let n = old.len().min(cap);
        if let Err(e) = copyout(&sc.td, oldp, &old[..n]) {
            return e.as_neg();
        }
        if let Err(e) = copyout(&sc.td, oldlenp, &(old.len() as u64).to_le_bytes()) {
            return e.as_neg();
        }
    }
    0
}
