//! Coredump on fault: a child writes to address zero, the parent reaps
//! it, and `/tmp/core.<pid>` verifies.

mod common;

use common::{kinit, ktd, ktd_child, read_file};
use muon_core::VirtAddr;
use muon_mm::pmap::Prot;
use muon_kernel::proc::waitpid;
use muon_kernel::signal::SIGSEGV;
use muon_kernel::trap::trap_page_fault;

#[test]
fn fault_leaves_a_verifiable_core() {
    let k = kinit();
    let parent = ktd();
    let child = ktd_child(&parent);
    let pid = child.pid;

    // The child dereferences NULL: no mapping, SIGSEGV, coredump, exit.
    assert!(!trap_page_fault(&child, VirtAddr::zero(), Prot::WRITE));

    let (reaped, status) = waitpid(&parent, pid).expect("waitpid");
    assert_eq!(reaped, pid);
    assert_eq!(status, 128 + SIGSEGV as i32);

    // The dump exists and checks out: pid, fault address, trap frame,
    // CRC-32 over everything before the checksum.
    let dump = read_file(k, &format!("/tmp/core.{pid}"));
    assert!(dump.len() > 16);
    let (body, crc_bytes) = dump.split_at(dump.len() - 4);
    assert_eq!(
        u32::from_le_bytes(crc_bytes.try_into().unwrap()),
        crc32fast::hash(body)
    );
    assert_eq!(u32::from_le_bytes(body[0..4].try_into().unwrap()), pid);
    assert_eq!(u64::from_le_bytes(body[4..12].try_into().unwrap()), 0);
}

#[test]
fn waitpid_rejects_strangers() {
    let _ = kinit();
    let parent = ktd();
    assert!(waitpid(&parent, 999_999).is_err());
}
