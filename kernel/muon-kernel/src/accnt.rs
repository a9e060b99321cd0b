//! Kernel accounting: the stock ctlfs and procfs entries.
//!
//! Registers `/ctl/sched/stat`, `/ctl/vm/stat`, `/proc/version`,
//! `/proc/memstat`, and `/proc/interrupts` against the live kernel
//! singleton. All of them render on demand from the owning subsystem's
//! counters.

use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;

use muon_core::errno::Errno;
use muon_fs::SioTxn;
use muon_fs::ctlfs::{CtlNode, read_bytes_at};
use muon_fs::procfs::ProcNode;
use muon_mm::stat::{encode_ctl_blob, vm_stat};
use muon_sched::SchedStat;

use crate::boot::kernel;
use crate::config::{BRANCH, BUILDDATE, OSRELEASE, OSTYPE};
use crate::{arch, intr, proc};

struct SchedStatNode;

impl CtlNode for SchedStatNode {
    fn ctl_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let blob = SchedStat::sample(&kernel().sched).encode();
        read_bytes_at(&blob, txn)
    }
}

struct VmStatNode;

impl CtlNode for VmStatNode {
    fn ctl_read(&self, txn: &mut SioTxn<'_>) -> Result<usize, Errno> {
        let blob = encode_ctl_blob(&vm_stat(&kernel().pmm));
        read_bytes_at(&blob, txn)
    }
}

struct VersionNode;

impl ProcNode for VersionNode {
    fn render(&self) -> String {
        format!(
            "{}/{} v{}: {} ({})\n",
            OSTYPE,
            arch::arch_name(),
            OSRELEASE,
            BUILDDATE,
            BRANCH
        )
    }
}

struct MemstatNode;

impl ProcNode for MemstatNode {
    fn render(&self) -> String {
        let stat = vm_stat(&kernel().pmm);
        format!(
            "TotalMem: {} KiB\n\
             ReservedMem: {} KiB\n\
             AvailableMem: {} KiB\n\
             AllocatedMem: {} KiB\n\
             VMemObjCount: {}\n",
            stat.mem_total / 1024,
            stat.mem_reserved / 1024,
            stat.mem_avail / 1024,
            stat.mem_used / 1024,
            stat.object_count
        )
    }
}

struct InterruptsNode;

impl ProcNode for InterruptsNode {
    fn render(&self) -> String {
        intr::render_proc_interrupts()
    }
}

/// Number of threads tracked by the scheduler, for external consumers.
pub fn nproc() -> usize {
    proc::proc_count()
}

/// Registers all the stock entries. Runs once at boot.
///
/// # Errors
///
/// Duplicate registration reports [`Errno::Exist`].
pub fn register() -> Result<(), Errno> {
    let k = kernel();
    k.ctlfs.register("sched", "stat", Arc::new(SchedStatNode))?;
    k.ctlfs.register("vm", "stat", Arc::new(VmStatNode))?;
    k.procfs.add_entry("version", Arc::new(VersionNode))?;
    k.procfs.add_entry("memstat", Arc::new(MemstatNode))?;
    k.procfs.add_entry("interrupts", Arc::new(InterruptsNode))?;
    Ok(())
}
