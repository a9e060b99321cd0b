//! Kernel bring-up and the initialized-once kernel singleton.
//!
//! Every process-wide table — the frame allocator, the mount namespace,
//! the pseudo filesystems, the device table, the driver registry, the
//! scheduler — lives in one [`Kernel`] value initialized exactly once and
//! reached through [`kernel()`]. Bare-metal boot calls
//! [`kernel_init`] with the firmware memory map; hosted harnesses call
//! [`kernel_init_hosted`], which fabricates "RAM" from a leaked aligned
//! heap arena and then runs the very same bring-up.

use alloc::alloc::Layout;
use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::addr::{PAGE_SIZE, PhysAddr};
use muon_core::errno::Errno;
use muon_core::sync::Once;
use muon_core::{cpu, klog};
use muon_fs::ctlfs::{Ctlfs, CtlfsMount};
use muon_fs::devfs::{Devfs, DevfsMount};
use muon_fs::procfs::{Procfs, ProcfsMount};
use muon_fs::tmpfs::Tmpfs;
use muon_fs::{Namespace, VnodeType};
use muon_mm::{PhysMemoryRegion, Pmm};
use muon_sched::Scheduler;

use crate::device::DevTable;
use crate::driver::{Driver, DriverRegistry};
use crate::proc::Proc;
use crate::{accnt, dev, ipi, ksched};

/// The process-wide kernel state.
pub struct Kernel {
    /// Physical frame allocator.
    pub pmm: Arc<Pmm>,
    /// Mount namespace (root vnode + mount table).
    pub ns: Namespace,
    /// `/dev` instance.
    pub devfs: Arc<Devfs>,
    /// `/ctl` instance.
    pub ctlfs: Arc<Ctlfs>,
    /// `/proc` instance.
    pub procfs: Arc<Procfs>,
    /// Device major/minor space.
    pub devtab: Arc<DevTable>,
    /// Driver registry.
    pub drivers: DriverRegistry,
    /// The scheduler.
    pub sched: Scheduler<Proc>,
}

static KERNEL: Once<Kernel> = Once::new();

/// Serializes bring-up so a racing second caller waits for the first
/// instead of re-registering built-ins on the winner's kernel.
static INIT_LOCK: muon_core::sync::SpinLock<()> = muon_core::sync::SpinLock::new(());

/// The kernel singleton.
///
/// # Panics
///
/// Panics before initialization; nothing meaningful can run then anyway.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel not initialized")
}

/// The kernel singleton, if bring-up already happened.
pub fn try_kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

/// Boot parameters.
pub struct BootConfig<'a> {
    /// Physical memory map.
    pub regions: &'a [PhysMemoryRegion],
    /// Direct-map window offset (virtual = offset + physical).
    pub dmap_offset: u64,
    /// Logical CPUs to dispatch on.
    pub ncpu: u32,
}

/// Brings the kernel up. Idempotent: a second call returns the existing
/// singleton.
///
/// # Safety
///
/// `cfg.dmap_offset + pa` must be valid writable memory for every byte of
/// every usable region, for the lifetime of the kernel.
///
/// # Errors
///
/// [`Errno::Nomem`] when the frame allocator cannot be built.
pub unsafe fn kernel_init(cfg: &BootConfig<'_>) -> Result<&'static Kernel, Errno> {
    let _init = INIT_LOCK.lock();
    if let Some(k) = KERNEL.get() {
        return Ok(k);
    }

    klog::init();
    cpu::set_cpu_count(cfg.ncpu);

    // SAFETY: Forwarded from the caller.
    let pmm = Arc::new(unsafe { Pmm::new(cfg.regions, cfg.dmap_offset)? });

    // Root filesystem: a tmpfs with the canonical mount points, then the
    // pseudo filesystems over them.
    let ns = Namespace::new();
    let root = Tmpfs::new_root();
    ns.set_root(Arc::clone(&root));
    for dir in ["tmp", "dev", "ctl", "proc", "etc", "usr"] {
        root.vop_create(dir, VnodeType::Dir)?;
    }

    let tmp_cover = root.vop_lookup("tmp")?;
    ns.mount_fs("tmp", &Tmpfs, Some(tmp_cover))?;

    let devfs_mount = DevfsMount::new();
    let devfs = devfs_mount.instance();
    ns.mount_fs("dev", &devfs_mount, Some(root.vop_lookup("dev")?))?;

    let ctlfs_mount = CtlfsMount::new();
    let ctlfs = ctlfs_mount.instance();
    ns.mount_fs("ctl", &ctlfs_mount, Some(root.vop_lookup("ctl")?))?;

    let procfs_mount = ProcfsMount::new();
    let procfs = procfs_mount.instance();
    ns.mount_fs("proc", &procfs_mount, Some(root.vop_lookup("proc")?))?;

    let sched = Scheduler::new(cfg.ncpu as usize);
    ipi::shootdown_init()?;

    let k = Kernel {
        pmm,
        ns,
        devfs,
        ctlfs,
        procfs,
        devtab: Arc::new(DevTable::new()),
        drivers: DriverRegistry::new(),
        sched,
    };
    let _ = KERNEL.set(k);
    let k = kernel();

    // Dispatch wiring: the reschedule IPI, the scheduler's remote-kick
    // and the core yield hook (the clock driver installs the timer hook
    // when it claims the hardware below).
    ksched::init()?;

    // Built-in drivers, ordered — the clock first, since every quantum
    // after this point comes from it; the deferred set runs on a kernel
    // thread once the scheduler is ticking (`finish_boot`).
    k.drivers.register(Driver {
        name: "clock",
        init: dev::clock::init,
        deferred: false,
    });
    k.drivers.register(Driver {
        name: "fbdev",
        init: dev::fbdev::init,
        deferred: false,
    });
    k.drivers.register(Driver {
        name: "random",
        init: dev::random::init,
        deferred: false,
    });
    k.drivers.register(Driver {
        name: "rtc",
        init: dev::rtc::init,
        deferred: false,
    });
    k.drivers.register(Driver {
        name: "beep",
        init: dev::beep::init,
        deferred: false,
    });
    k.drivers.register(Driver {
        name: "dmi",
        init: dev::dmi::init,
        deferred: false,
    });
    k.drivers.register(Driver {
        name: "ramdisk",
        init: dev::ramdisk::init,
        deferred: true,
    });
    k.drivers.drivers_init();

    accnt::register()?;

    log::info!(
        target: "boot",
        "muon up: {} MiB usable, {} CPUs",
        k.pmm.mem_total() / (1024 * 1024),
        cfg.ncpu
    );
    Ok(k)
}

/// Completes boot: runs the deferred driver set and seals the blacklist.
///
/// On hardware this is the body of the kernel thread the boot entry
/// spawns once the scheduler is ticking (the `drivers_sched` analog);
/// hosted harnesses call it directly. Returns how many deferred drivers
/// came up.
pub fn finish_boot() -> usize {
    let k = kernel();
    let ran = k.drivers.drivers_sched();
    crate::driver::seal_blacklist();
    log::info!(target: "boot", "deferred drivers up ({ran}), blacklist sealed");
    ran
}

/// Hosted bring-up: leaks an aligned arena of `pages` pages as "RAM" and
/// boots over it. Returns the existing kernel on repeat calls.
pub fn kernel_init_hosted(pages: usize) -> &'static Kernel {
    if let Some(k) = KERNEL.get() {
        return k;
    }
    let bytes = pages * PAGE_SIZE;
    let layout = Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    // SAFETY: Non-zero layout; the block is leaked so it lives forever.
    let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
    assert!(!base.is_null());

    let regions: Vec<PhysMemoryRegion> = alloc::vec![PhysMemoryRegion {
        start: PhysAddr::zero(),
        size: bytes as u64,
        usable: true,
    }];
    let cfg = BootConfig {
        regions: &regions,
        dmap_offset: base as u64,
        ncpu: 2,
    };
    // SAFETY: The leaked arena really is writable at dmap_offset + pa.
    unsafe { kernel_init(&cfg) }.expect("hosted kernel_init")
}
