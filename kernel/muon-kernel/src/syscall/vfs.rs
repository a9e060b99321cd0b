//! File syscalls: open/read/write/close/stat/lseek/access.

use muon_core::errno::Errno;
use muon_fs::{OpenFlags, PATH_MAX, Whence, namei};

use super::{ScRet, SyscallArgs};
use crate::boot::kernel;
use crate::usercopy::{copyin, copyinstr, copyout};

/// Largest single read/write transfer the kernel will stage.
const IO_MAX: usize = 1 << 20;

pub fn sys_open(sc: &SyscallArgs) -> ScRet {
    let path = match copyinstr(&sc.td, sc.u64(0), PATH_MAX) {
        Ok(p) => p,
        Err(e) => return e.as_neg(),
    };
    let flags = OpenFlags::from_bits_truncate(sc.args[1] as u32);
    match sc.td.fds.lock().open(&kernel().ns, &path, flags) {
        Ok(fd) => fd as ScRet,
        Err(e) => e.as_neg(),
    }
}

pub fn sys_close(sc: &SyscallArgs) -> ScRet {
    let res = sc.td.fds.lock().close(sc.args[0], Some(&sc.td.vcache));
    match res {
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}

pub fn sys_read(sc: &SyscallArgs) -> ScRet {
    let len = sc.args[2].min(IO_MAX);
    let mut staging = alloc::vec![0u8; len];
    let n = match sc.td.fds.lock().read(sc.args[0], &mut staging) {
        Ok(n) => n,
        Err(e) => return e.as_neg(),
    };
    if let Err(e) = copyout(&sc.td, sc.u64(1), &staging[..n]) {
        return e.as_neg();
    }
    n as ScRet
}

pub fn sys_write(sc: &SyscallArgs) -> ScRet {
    let len = sc.args[2].min(IO_MAX);
    let mut staging = alloc::vec![0u8; len];
    if let Err(e) = copyin(&sc.td, sc.u64(1), &mut staging) {
        return e.as_neg();
    }
    match sc.td.fds.lock().write(sc.args[0], &staging) {
        Ok(n) => n as ScRet,
        Err(e) => e.as_neg(),
    }
}

/// `stat(fd, out)` writes `{mode u32, vtype u32, size u64}` (16 bytes).
pub fn sys_stat(sc: &SyscallArgs) -> ScRet {
    let attr = match sc.td.fds.lock().stat(sc.args[0]) {
        Ok(a) => a,
        Err(e) => return e.as_neg(),
    };
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&attr.mode.to_le_bytes());
    out[4..8].copy_from_slice(&(attr.vtype as u32).to_le_bytes());
    out[8..16].copy_from_slice(&attr.size.to_le_bytes());
    match copyout(&sc.td, sc.u64(1), &out) {
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}

pub fn sys_lseek(sc: &SyscallArgs) -> ScRet {
    let Some(whence) = Whence::from_u32(sc.args[2] as u32) else {
        return Errno::Inval.as_neg();
    };
    match sc.td.fds.lock().lseek(sc.args[0], sc.args[1] as i64, whence) {
        Ok(off) => off as ScRet,
        Err(e) => e.as_neg(),
    }
}

/// `access(path, mode)`: existence (and nothing subtler yet).
pub fn sys_access(sc: &SyscallArgs) -> ScRet {
    let path = match copyinstr(&sc.td, sc.u64(0), PATH_MAX) {
        Ok(p) => p,
        Err(e) => return e.as_neg(),
    };
    match namei(&kernel().ns, &path) {
        Ok(_) => 0,
        Err(e) => e.as_neg(),
    }
}
