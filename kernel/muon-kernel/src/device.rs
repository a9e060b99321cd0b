//! Device framework: major/minor numbering and devsw tables.
//!
//! Major numbers come from a boot-time monotonic counter; within a major,
//! minors count up as instances appear. The switch table is two-level —
//! a per-major table allocated on first registration — and resolution is
//! `dev_get(major, minor)`. Character devices that implement `mmap`
//! plug into the VM device pager through [`DevPagerAdapter`].

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use muon_core::addr::PhysAddr;
use muon_core::errno::Errno;
use muon_core::sync::SpinLock;
use muon_fs::devfs::DevSw;
use muon_mm::DevMmap;

use crate::config::{MAX_MAJOR, MAX_MINOR};

struct MajorEntry {
    /// Lazily allocated minor table.
    devsw: BTreeMap<u32, DevSw>,
    /// Minors handed out so far.
    count: u32,
}

/// The device number space.
pub struct DevTable {
    majors: SpinLock<BTreeMap<u32, MajorEntry>>,
    next_major: SpinLock<u32>,
}

impl DevTable {
    /// An empty table. Major 0 is never handed out.
    pub const fn new() -> Self {
        Self {
            majors: SpinLock::new(BTreeMap::new()),
            next_major: SpinLock::new(1),
        }
    }

    /// Allocates the next device major. Returns 0 once the space is
    /// exhausted.
    pub fn alloc_major(&self) -> u32 {
        let mut next = self.next_major.lock();
        if *next as usize > MAX_MAJOR {
            return 0;
        }
        let major = *next;
        *next += 1;
        major
    }

    /// Allocates the next minor under `major`. Returns 0 on a bad major
    /// or an exhausted minor space (minor 0 is reserved as "none").
    pub fn alloc_minor(&self, major: u32) -> u32 {
        if major == 0 || major as usize > MAX_MAJOR {
            return 0;
        }
        let mut majors = self.majors.lock();
        let entry = majors.entry(major).or_insert_with(|| MajorEntry {
            devsw: BTreeMap::new(),
            count: 0,
        });
        if entry.count as usize >= MAX_MINOR {
            return 0;
        }
        entry.count += 1;
        entry.count
    }

    /// Stores `sw` at `(major, minor)`.
    ///
    /// # Errors
    ///
    /// [`Errno::Inval`] for numbers that were never allocated.
    pub fn register(&self, major: u32, minor: u32, sw: DevSw) -> Result<(), Errno> {
        let mut majors = self.majors.lock();
        let entry = majors.get_mut(&major).ok_or(Errno::Inval)?;
        if minor == 0 || minor > entry.count {
            return Err(Errno::Inval);
        }
        entry.devsw.insert(minor, sw);
        Ok(())
    }

    /// Resolves `(major, minor)` to its switch.
    pub fn get(&self, major: u32, minor: u32) -> Option<DevSw> {
        self.majors.lock().get(&major)?.devsw.get(&minor).cloned()
    }
}

impl Default for DevTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges a registered character device into the VM device pager: the
/// pager asks for physical addresses page by page through the cdev's
/// `mmap` hook.
pub struct DevPagerAdapter {
    major: u32,
    minor: u32,
    table: Arc<DevTable>,
}

impl DevPagerAdapter {
    /// An adapter for `(major, minor)` resolved through `table`.
    pub fn new(table: Arc<DevTable>, major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            table,
        }
    }
}

impl DevMmap for DevPagerAdapter {
    fn dev_mmap(&self, off: u64) -> Option<PhysAddr> {
        match self.table.get(self.major, self.minor)? {
            DevSw::Chr(c) => c.mmap(off),
            DevSw::Blk(_) => None,
        }
    }
}
