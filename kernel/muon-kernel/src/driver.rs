//! Driver registry and name blacklist.
//!
//! Drivers are `{name, init fn, deferred flag}` entries in an explicit
//! ordered registry. `drivers_init` runs the non-deferred set in
//! registration order during boot; the deferred set runs later on a
//! spawned kernel thread once the scheduler is up (`drivers_sched`).
//!
//! The blacklist is an FNV-1 hashed name table with collision chains,
//! consulted before each init. It is mutable only while the kernel is
//! still booting; afterwards additions report `Again`.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use muon_core::errno::Errno;
use muon_core::hash::fnv1;
use muon_core::sync::SpinLock;

use crate::config::BLACKLIST_SIZE;

/// One registered driver.
pub struct Driver {
    /// Driver name, matched against the blacklist.
    pub name: &'static str,
    /// Initialization entry point.
    pub init: fn() -> Result<(), Errno>,
    /// Run on the deferred thread after boot instead of at boot.
    pub deferred: bool,
}

/// The ordered driver registry.
pub struct DriverRegistry {
    drivers: SpinLock<Vec<Driver>>,
}

/// Name blacklist: fixed buckets, chained on collision.
struct Blacklist {
    buckets: [Vec<String>; BLACKLIST_SIZE],
    sealed: bool,
}

static BLACKLIST: SpinLock<Blacklist> = SpinLock::new(Blacklist {
    buckets: [const { Vec::new() }; BLACKLIST_SIZE],
    sealed: false,
});

/// Whether boot has finished (seals the blacklist).
static BOOT_DONE: AtomicBool = AtomicBool::new(false);

impl DriverRegistry {
    /// An empty registry.
    pub const fn new() -> Self {
        Self {
            drivers: SpinLock::new(Vec::new()),
        }
    }

    /// Appends a driver; order of registration is order of initialization.
    pub fn register(&self, driver: Driver) {
        self.drivers.lock().push(driver);
    }

    /// Runs every non-deferred driver in order, skipping blacklisted
    /// names. Returns how many drivers ran successfully.
    pub fn drivers_init(&self) -> usize {
        self.run(false)
    }

    /// Runs the deferred set. The boot path spawns a kernel thread whose
    /// entry calls this.
    pub fn drivers_sched(&self) -> usize {
        self.run(true)
    }

    fn run(&self, deferred: bool) -> usize {
        // Snapshot names + fns so no lock is held across driver inits.
        let batch: Vec<(&'static str, fn() -> Result<(), Errno>)> = self
            .drivers
            .lock()
            .iter()
            .filter(|d| d.deferred == deferred)
            .map(|d| (d.name, d.init))
            .collect();

        let mut ran = 0;
        for (name, init) in batch {
            if driver_blacklist_check(name) {
                log::info!(target: "driver", "{name}: blacklisted, skipping");
                continue;
            }
            match init() {
                Ok(()) => {
                    ran += 1;
                    log::debug!(target: "driver", "{name}: up");
                }
                Err(e) => log::warn!(target: "driver", "{name}: init failed: {e}"),
            }
        }
        ran
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the end of boot: the blacklist becomes immutable.
pub fn seal_blacklist() {
    BOOT_DONE.store(true, Ordering::Release);
    BLACKLIST.lock().sealed = true;
}

/// Adds `name` to the blacklist.
///
/// # Errors
///
/// [`Errno::Again`] once boot completed, [`Errno::Inval`] for an empty
/// name.
pub fn driver_blacklist(name: &str) -> Result<(), Errno> {
    if name.is_empty() {
        return Err(Errno::Inval);
    }
    let mut bl = BLACKLIST.lock();
    if bl.sealed {
        return Err(Errno::Again);
    }
    let bucket = fnv1(name) as usize % BLACKLIST_SIZE;
    let chain = &mut bl.buckets[bucket];
    if !chain.iter().any(|n| n == name) {
        chain.push(name.to_string());
    }
    Ok(())
}

/// Whether `name` is blacklisted.
pub fn driver_blacklist_check(name: &str) -> bool {
    let bl = BLACKLIST.lock();
    let bucket = fnv1(name) as usize % BLACKLIST_SIZE;
    bl.buckets[bucket].iter().any(|n| n == name)
}
