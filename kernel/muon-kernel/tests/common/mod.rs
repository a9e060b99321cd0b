//! Shared fixtures for the kernel integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use muon_kernel::boot::{Kernel, kernel_init_hosted};
use muon_kernel::proc::{Proc, SpawnEntry, spawn};

/// Boots (or returns) the hosted kernel over a 16 MiB arena.
pub fn kinit() -> &'static Kernel {
    kernel_init_hosted(4096)
}

fn idle(_: usize) {}

/// Spawns a kernel thread to act as the calling context for syscalls.
pub fn ktd() -> Arc<Proc> {
    spawn(None, SpawnEntry::Kernel(idle, 0), muon_kernel::proc::PROC_KTD).expect("spawn ktd")
}

/// Spawns a kernel thread as a child of `parent`.
pub fn ktd_child(parent: &Arc<Proc>) -> Arc<Proc> {
    spawn(
        Some(parent),
        SpawnEntry::Kernel(idle, 0),
        muon_kernel::proc::PROC_KTD,
    )
    .expect("spawn child")
}

/// Builds a minimal valid ELF64 `ET_EXEC` image with one `PT_LOAD`
/// text segment at `vaddr` containing `payload`, entry at `vaddr`.
pub fn make_exec_elf(payload: &[u8], vaddr: u64) -> Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const PHDR_SIZE: usize = 56;

    let mut buf = vec![0u8; EHDR_SIZE];
    buf[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    buf[4] = 2; // ELFCLASS64
    buf[5] = 1; // little endian
    buf[6] = 1; // EV_CURRENT
    buf[7] = 0; // SYSV
    buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    buf[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    buf[24..32].copy_from_slice(&vaddr.to_le_bytes()); // entry
    buf[32..40].copy_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // phoff
    buf[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
    buf[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum

    let data_off = (EHDR_SIZE + PHDR_SIZE) as u64;
    let mut ph = vec![0u8; PHDR_SIZE];
    ph[..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&(4u32 | 1).to_le_bytes()); // PF_R | PF_X
    ph[8..16].copy_from_slice(&data_off.to_le_bytes());
    ph[16..24].copy_from_slice(&vaddr.to_le_bytes());
    ph[32..40].copy_from_slice(&(payload.len() as u64).to_le_bytes()); // filesz
    ph[40..48].copy_from_slice(&(payload.len() as u64).to_le_bytes()); // memsz
    buf.extend_from_slice(&ph);
    buf.extend_from_slice(payload);
    buf
}

/// Writes `bytes` to `path` through the VFS (creating the file).
pub fn write_file(k: &Kernel, path: &str, bytes: &[u8]) {
    use muon_fs::{FdTable, OpenFlags};
    let mut fds = FdTable::new();
    let fd = fds
        .open(&k.ns, path, OpenFlags::WRITE | OpenFlags::CREATE)
        .expect("create file");
    assert_eq!(fds.write(fd, bytes).expect("write file"), bytes.len());
    fds.close(fd, None).expect("close");
}

/// Reads the whole file at `path` through the VFS.
pub fn read_file(k: &Kernel, path: &str) -> Vec<u8> {
    use muon_fs::{FdTable, OpenFlags, Whence};
    let mut fds = FdTable::new();
    let fd = fds.open(&k.ns, path, OpenFlags::READ).expect("open file");
    let size = fds.lseek(fd, 0, Whence::End).expect("seek end") as usize;
    fds.lseek(fd, 0, Whence::Set).expect("seek set");
    let mut data = vec![0u8; size];
    let n = fds.read(fd, &mut data).expect("read file");
    data.truncate(n);
    fds.close(fd, None).expect("close");
    data
}

/// A real microsecond clock for tests that need `spinlock_usleep`-style
/// bounded waits or the `sleep` syscall.
pub fn install_test_clock() {
    fn clock() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64
    }
    muon_core::time::set_monotonic_source(clock);
}
