//! Deferred drivers and the end of boot: the ramdisk comes up on the
//! post-boot pass, after which the blacklist is sealed.

mod common;

use common::kinit;
use muon_core::errno::Errno;
use muon_fs::{FdTable, OpenFlags, VnodeType, namei};
use muon_kernel::boot::finish_boot;
use muon_kernel::dev::ramdisk::RAMDISK_BSIZE;
use muon_kernel::driver::driver_blacklist;
use muon_fs::devfs::DevSw;

#[test]
fn deferred_set_runs_then_blacklist_seals() {
    let k = kinit();

    // Not there during boot proper.
    assert!(!k.devfs.contains("rd0"));

    // While boot is open the blacklist accepts entries.
    driver_blacklist("xhci").expect("boot-time blacklist");

    let ran = finish_boot();
    assert!(ran >= 1, "ramdisk should have come up");
    assert!(k.devfs.contains("rd0"));

    // Sealed now.
    assert_eq!(driver_blacklist("late-entry").unwrap_err(), Errno::Again);

    // Block I/O through the fd layer round-trips.
    let mut fds = FdTable::new();
    let fd = fds
        .open(&k.ns, "/dev/rd0", OpenFlags::READ | OpenFlags::WRITE)
        .expect("open rd0");
    assert_eq!(fds.write(fd, b"superblock").unwrap(), 10);
    fds.lseek(fd, 0, muon_fs::Whence::Set).unwrap();
    let mut buf = [0u8; 10];
    assert_eq!(fds.read(fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"superblock");

    // The node is a block device whose devsw reports its block size.
    let vp = namei(&k.ns, "/dev/rd0").unwrap();
    assert_eq!(vp.vtype(), VnodeType::Blk);
    let attr = vp.vop_getattr().unwrap();
    let (major, minor) = ((attr.size >> 8) as u32, (attr.size & 0xFF) as u32);
    match k.devtab.get(major, minor).expect("devsw registered") {
        DevSw::Blk(b) => assert_eq!(b.bsize().unwrap(), RAMDISK_BSIZE),
        DevSw::Chr(_) => panic!("rd0 must be a block device"),
    }

    fds.close(fd, None).unwrap();
}
