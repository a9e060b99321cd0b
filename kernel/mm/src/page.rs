//! `VmPage`: one resident page of a VM object.

use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::addr::PhysAddr;
use muon_core::sync::SpinLock;

/// Page is initialized and safe to map.
pub const PG_VALID: u32 = 1 << 0;
/// Page has not been written since the last writeback.
pub const PG_CLEAN: u32 = 1 << 1;
/// Someone is waiting on this page's I/O.
pub const PG_REQ: u32 = 1 << 2;
/// The frame belongs to a device, not the frame allocator.
pub const PG_DEVICE: u32 = 1 << 3;

/// A single resident page.
///
/// Owned by exactly one [`VmObject`](crate::obj::VmObject), which keys it by
/// `offset` in its page tree. The object outlives its pages by construction,
/// so the page carries no back-reference; teardown is driven from the
/// object side.
#[derive(Debug)]
pub struct VmPage {
    /// Backing physical frame.
    phys: PhysAddr,
    /// Byte offset within the owning object (page aligned).
    offset: u64,
    /// `PG_*` bits.
    flags: AtomicU32,
    /// Per-page busy lock; pagers hold it across I/O.
    pub(crate) busy: SpinLock<()>,
}

impl VmPage {
    pub(crate) fn new(phys: PhysAddr, offset: u64, flags: u32) -> Self {
        Self {
            phys,
            offset,
            flags: AtomicU32::new(flags),
            busy: SpinLock::new(()),
        }
    }

    /// The backing physical frame.
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Byte offset within the owning object.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Current `PG_*` bits.
    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    /// Sets the given `PG_*` bits.
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clears the given `PG_*` bits.
    pub fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Whether the frame came from a device rather than the allocator.
    #[inline]
    pub fn is_device(&self) -> bool {
        self.flags() & PG_DEVICE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_toggle() {
        let pg = VmPage::new(PhysAddr::new(0x1000), 0, PG_VALID | PG_CLEAN);
        assert_eq!(pg.flags() & PG_VALID, PG_VALID);
        pg.clear_flags(PG_CLEAN);
        assert_eq!(pg.flags() & PG_CLEAN, 0);
        pg.set_flags(PG_REQ);
        assert_ne!(pg.flags() & PG_REQ, 0);
        assert!(!pg.is_device());
    }
}
