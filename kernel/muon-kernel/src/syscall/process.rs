//! Process syscalls: exit/spawn/waitpid/ids/sleep/reboot/inject.

use alloc::vec::Vec;

use muon_core::errno::Errno;
use muon_core::{cpu, time};
use muon_fs::PATH_MAX;

use super::{ScRet, SyscallArgs};
use crate::arch::md_reboot;
use crate::driver::driver_blacklist;
use crate::proc::{self, SpawnEntry, exec, exit1, waitpid};
use crate::usercopy::{copyin, copyinstr, copyout};

/// Reboot flag: power the machine off.
pub const REBOOT_POWEROFF: usize = 1 << 0;
/// Reboot flag: halt without power-off.
pub const REBOOT_HALT: usize = 1 << 1;

pub fn sys_exit(sc: &SyscallArgs) -> ScRet {
    let status = sc.args[0] as i32;
    match exit1(&sc.td, status) {
        // On hardware this never returns; the scheduler picks the next
        // thread. Hosted callers observe the zero.
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}

/// `spawn(path, argv, argc)`: new process running `path`.
///
/// `argv` is an array of `argc` user string pointers; an empty vector
/// defaults to `[path]`.
pub fn sys_spawn(sc: &SyscallArgs) -> ScRet {
    let path = match copyinstr(&sc.td, sc.u64(0), PATH_MAX) {
        Ok(p) => p,
        Err(e) => return e.as_neg(),
    };

    let argc = sc.args[2].min(32);
    let mut argv: Vec<alloc::string::String> = Vec::new();
    for i in 0..argc {
        let mut ptr_bytes = [0u8; 8];
        if let Err(e) = copyin(&sc.td, sc.u64(1) + (i * 8) as u64, &mut ptr_bytes) {
            return e.as_neg();
        }
        match copyinstr(&sc.td, u64::from_le_bytes(ptr_bytes), PATH_MAX) {
            Ok(s) => argv.push(s),
            Err(e) => return e.as_neg(),
        }
    }
    if argv.is_empty() {
        argv.push(path.clone());
    }
    let argv_refs: Vec<&str> = argv.iter().map(alloc::string::String::as_str).collect();

    let child = match proc::spawn(Some(&sc.td), SpawnEntry::User(0), 0) {
        Ok(c) => c,
        Err(e) => return e.as_neg(),
    };
    if let Err(e) = exec::execve(&child, &path, &argv_refs, &[]) {
        let _ = exit1(&child, -1);
        return e.as_neg();
    }
    ScRet::from(child.pid)
}

pub fn sys_reboot(sc: &SyscallArgs) -> ScRet {
    let flags = sc.args[0];
    if flags & (REBOOT_POWEROFF | REBOOT_HALT) == 0 {
        return Errno::Inval.as_neg();
    }
    log::warn!(target: "reboot", "going down (flags {flags:#x})");
    md_reboot(flags & REBOOT_POWEROFF != 0);
    // Only the hosted build gets here.
    Errno::Nosup.as_neg()
}

/// `sleep(usec)`: bounded wait on the monotonic clock, yielding while it
/// passes.
pub fn sys_sleep(sc: &SyscallArgs) -> ScRet {
    let usec = sc.u64(0);
    let Some(start) = time::monotonic_usec() else {
        return Errno::Nosup.as_neg();
    };
    sc.td.sleep();
    loop {
        match time::monotonic_usec() {
            Some(now) if now.wrapping_sub(start) >= usec => break,
            Some(_) => cpu::yield_now(),
            None => break,
        }
    }
    // Dispatchers dropped us from the queues while asleep; wake re-queues.
    sc.td.wakeup();
    0
}

/// `inject(name)`: blacklist a driver before boot completes.
pub fn sys_inject(sc: &SyscallArgs) -> ScRet {
    let name = match copyinstr(&sc.td, sc.u64(0), 64) {
        Ok(n) => n,
        Err(e) => return e.as_neg(),
    };
    match driver_blacklist(&name) {
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}

pub fn sys_getpid(sc: &SyscallArgs) -> ScRet {
    ScRet::from(sc.td.pid)
}

pub fn sys_getppid(sc: &SyscallArgs) -> ScRet {
    match sc.td.parent.lock().upgrade() {
        Some(parent) => ScRet::from(parent.pid),
        None => 0,
    }
}

pub fn sys_setuid(sc: &SyscallArgs) -> ScRet {
    let mut cred = sc.td.cred.lock();
    if cred.uid != 0 {
        return Errno::Acces.as_neg();
    }
    cred.uid = sc.args[0] as u32;
    0
}

pub fn sys_getuid(sc: &SyscallArgs) -> ScRet {
    ScRet::from(sc.td.cred.lock().uid)
}

/// `waitpid(pid, status_ptr)`.
pub fn sys_waitpid(sc: &SyscallArgs) -> ScRet {
    let pid = sc.args[0] as u32;
    let (reaped, status) = match waitpid(&sc.td, pid) {
        Ok(r) => r,
        Err(e) => return e.as_neg(),
    };
    let status_ptr = sc.u64(1);
    if status_ptr != 0 {
        if let Err(e) = copyout(&sc.td, status_ptr, &status.to_le_bytes()) {
            return e.as_neg();
        }
    }
    ScRet::from(reaped)
}
