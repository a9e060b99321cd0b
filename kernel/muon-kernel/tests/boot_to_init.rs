//! Boot-to-init: bring the kernel up hosted, install an init binary, and
//! exec it into a fresh thread.

mod common;

use common::{kinit, ktd, make_exec_elf, write_file};
use muon_fs::{VnodeType, namei};
use muon_kernel::proc::exec::execve;
use muon_kernel::proc::{PROC_EXEC, PROC_ZOMB};
use muon_sched::Schedulable;

#[test]
fn boot_reaches_a_running_init() {
    let k = kinit();

    // The namespace looks like a Unix root.
    let root = k.ns.root().expect("root vnode");
    assert_eq!(root.vtype(), VnodeType::Dir);
    assert!(k.devfs.contains("fb0"));
    assert!(namei(&k.ns, "/dev/fb0").is_ok());
    assert!(namei(&k.ns, "/dev/random").is_ok());
    assert!(namei(&k.ns, "/proc/version").is_ok());
    assert!(namei(&k.ns, "/ctl/sched/stat").is_ok());

    // Install a synthetic shell and exec it.
    let image = make_exec_elf(&[0x90, 0x90, 0xC3], 0x40_0000);
    write_file(k, "/usr/osh", &image);

    let init = ktd();
    execve(&init, "/usr/osh", &["osh"], &[]).expect("execve");

    // The thread is runnable, flagged as exec'd, and its image record is
    // in place.
    assert!(init.is_runnable());
    assert_ne!(init.flags() & PROC_EXEC, 0);
    assert_eq!(init.flags() & PROC_ZOMB, 0);
    let exec = init.exec.lock();
    let prog = exec.as_ref().expect("exec record");
    assert_eq!(prog.entry, 0x40_0000);
    assert_eq!(prog.loadmap.len(), 1);
    assert!(prog.stack_ptr < muon_kernel::proc::exec::USER_STACK_TOP);
    drop(exec);

    // p_memsz == p_filesz: the in-memory image is byte-identical to the
    // file content of the segment.
    let vas = init.vas.lock().clone().expect("user vas");
    let pa = vas
        .translate(muon_core::VirtAddr::new(0x40_0000))
        .expect("text mapped");
    // SAFETY: The frame belongs to the image we just loaded.
    let text = unsafe { core::slice::from_raw_parts(k.pmm.phys_to_virt(pa), 3) };
    assert_eq!(text, &[0x90, 0x90, 0xC3]);
}

#[test]
fn control_and_proc_files_render() {
    let k = kinit();

    // /ctl/vm/stat: {avail, used, total} u64 LE, and they add up.
    let blob = common::read_file(k, "/ctl/vm/stat");
    assert_eq!(blob.len(), 24);
    let avail = u64::from_le_bytes(blob[0..8].try_into().unwrap());
    let used = u64::from_le_bytes(blob[8..16].try_into().unwrap());
    let total = u64::from_le_bytes(blob[16..24].try_into().unwrap());
    assert_eq!(avail + used, total);

    // /ctl/sched/stat: header + per-cpu switch counters.
    let blob = common::read_file(k, "/ctl/sched/stat");
    let ncpu = u32::from_le_bytes(blob[8..12].try_into().unwrap());
    assert_eq!(ncpu, 2);
    assert_eq!(blob.len(), 20 + 4 * ncpu as usize);
    let quantum = u32::from_le_bytes(blob[12..16].try_into().unwrap());
    assert_eq!(quantum, 9000);

    // /ctl/fb0/attr: four u32 fields.
    let blob = common::read_file(k, "/ctl/fb0/attr");
    assert_eq!(blob.len(), 16);
    let width = u32::from_le_bytes(blob[0..4].try_into().unwrap());
    let bpp = u32::from_le_bytes(blob[12..16].try_into().unwrap());
    assert!(width > 0 && bpp >= 8);

    // /ctl/dmi/board: five NUL-terminated strings.
    let blob = common::read_file(k, "/ctl/dmi/board");
    assert_eq!(blob.iter().filter(|&&b| b == 0).count(), 5);

    // /proc/version and /proc/memstat text forms.
    let version = String::from_utf8(common::read_file(k, "/proc/version")).unwrap();
    assert!(version.starts_with("Muon/"), "version: {version}");
    assert!(version.contains('('));

    let memstat = String::from_utf8(common::read_file(k, "/proc/memstat")).unwrap();
    for label in [
        "TotalMem:",
        "ReservedMem:",
        "AvailableMem:",
        "AllocatedMem:",
        "VMemObjCount:",
    ] {
        assert!(memstat.contains(label), "missing {label} in {memstat}");
    }
}

#[test]
fn affinity_pins_stick() {
    let _k = kinit();
    let td = ktd();
    use muon_core::cpu::CpuId;
    assert_eq!(td.pinned_cpu(), None);
    muon_kernel::proc::proc_pin(&td, CpuId(1));
    assert_eq!(td.pinned_cpu(), Some(CpuId(1)));
    muon_kernel::proc::proc_unpin(&td);
    assert_eq!(td.pinned_cpu(), None);
}

#[test]
fn exec_rejects_non_elf_images() {
    let k = kinit();
    write_file(k, "/usr/notelf", b"#!/bin/sh\necho no\n");
    let td = ktd();
    assert!(execve(&td, "/usr/notelf", &[], &[]).is_err());
    // The thread keeps running with its old (empty) image.
    assert!(td.is_runnable());
    assert!(td.exec.lock().is_none());
}
