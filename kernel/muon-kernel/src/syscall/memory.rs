//! Memory syscalls: mmap/munmap.

use alloc::sync::Arc;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::errno::Errno;
use muon_fs::VnodeType;
use muon_fs::devfs;
use muon_fs::vnode::Vnode;
use muon_mm::pmap::Prot;
use muon_mm::{DevMmap, MAP_FAILED, MapFlags, VmObject};

use super::{ScRet, SyscallArgs};
use crate::boot::kernel;

/// Device pager hook for a mapped device file: offsets resolve through
/// the devfs node's character device.
struct VnodeDevMmap {
    vnode: Arc<Vnode>,
}

impl DevMmap for VnodeDevMmap {
    fn dev_mmap(&self, off: u64) -> Option<PhysAddr> {
        devfs::dev_mmap(&self.vnode, off)
    }
}

/// `mmap(addr, len, prot, flags, fd, off)`.
///
/// Returns the mapped base address; on failure the errno rides in the
/// sign and userland sees [`MAP_FAILED`].
pub fn sys_mmap(sc: &SyscallArgs) -> ScRet {
    let k = kernel();
    let addr = VirtAddr::new_truncate(sc.u64(0));
    let len = sc.args[1];
    let prot = Prot::from_bits_truncate(sc.args[2] as u32) | Prot::USER;
    let flags = MapFlags::from_bits_truncate(sc.args[3] as u32);
    let fd = sc.args[4] as isize;
    let off = sc.u64(5);

    let object: Option<Arc<VmObject>> = if flags.contains(MapFlags::ANON) {
        None
    } else {
        let fds = sc.td.fds.lock();
        let desc = match fds.get(fd as usize) {
            Ok(d) => d,
            Err(e) => return e.as_neg(),
        };
        let obj = match desc.vnode.vtype() {
            VnodeType::Reg => desc.vnode.object(&k.pmm),
            VnodeType::Chr => Ok(VmObject::new_device(
                Arc::clone(&k.pmm),
                Arc::new(VnodeDevMmap {
                    vnode: Arc::clone(&desc.vnode),
                }),
                prot,
            )),
            _ => Err(Errno::Nodev),
        };
        match obj {
            Ok(o) => Some(o),
            Err(e) => return e.as_neg(),
        }
    };

    match sc
        .td
        .mlgdr
        .lock()
        .map_at(&k.pmm, addr, len, prot, flags, object, off)
    {
        Ok(base) => base.as_u64() as ScRet,
        Err(e) => {
            log::debug!(target: "vm", "mmap failed: {e} (sentinel {MAP_FAILED:#x})");
            e.as_neg()
        }
    }
}

/// `munmap(addr, len)`.
pub fn sys_munmap(sc: &SyscallArgs) -> ScRet {
    let vas = sc.td.vas.lock().clone();
    let Some(vas) = vas else {
        return Errno::Inval.as_neg();
    };
    let res = sc
        .td
        .mlgdr
        .lock()
        .unmap_at(&vas, VirtAddr::new_truncate(sc.u64(0)), sc.args[1]);
    match res {
        Ok(()) => 0,
        Err(e) => e.as_neg(),
    }
}
