//! Muon virtual-memory subsystem.
//!
//! Layered bottom-up:
//!
//! - [`pmm`] — bitmap physical frame allocator over boot-supplied RAM
//!   regions, addressed through a direct-map window.
//! - [`pmap`] — the machine-dependent page-table driver (4-level walker,
//!   per-address-space roots, TLB maintenance hooks).
//! - [`page`] / [`obj`] — `VmPage` and `VmObject`: named page collections
//!   with pluggable pagers (anonymous, backing-store, device).
//! - [`map`] — the per-process mmap ledger of live reservations.
//! - [`fault`] — demand paging and copy-on-write resolution.
//! - [`stat`] — counters feeding `/ctl/vm/stat` and `/proc/memstat`.
//!
//! Nothing in this crate owns a global: allocators and address spaces are
//! explicit values threaded through constructors (`Arc<Pmm>` everywhere),
//! which is also what makes the whole subsystem runnable on the host with a
//! heap arena standing in for RAM.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fault;
pub mod map;
pub mod obj;
pub mod page;
pub mod pmap;
pub mod pmm;
pub mod stat;

pub use map::{MAP_FAILED, MapFlags, MmapEntry, MmapLedger};
pub use obj::{DevMmap, Pager, PagerBackend, VmObject};
pub use page::VmPage;
pub use pmap::{CacheType, Prot, Vas};
pub use pmm::{PhysMemoryRegion, Pmm};

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared fixtures: an aligned heap arena standing in for RAM.

    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::alloc::Layout;

    use muon_core::PAGE_SIZE;
    use muon_core::addr::PhysAddr;

    use crate::pmm::{PhysMemoryRegion, Pmm};

    /// A page-aligned block of host memory posing as physical RAM.
    ///
    /// Frame numbers start at zero; the direct-map offset is simply the
    /// arena's base address.
    pub struct Arena {
        base: *mut u8,
        layout: Layout,
    }

    // SAFETY: The arena is plain memory; all access is mediated by the Pmm.
    unsafe impl Send for Arena {}
    unsafe impl Sync for Arena {}

    impl Arena {
        pub fn new(pages: usize) -> Self {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self { base, layout }
        }

        pub fn dmap_offset(&self) -> u64 {
            self.base as u64
        }

        pub fn regions(&self) -> Vec<PhysMemoryRegion> {
            alloc::vec![PhysMemoryRegion {
                start: PhysAddr::zero(),
                size: self.layout.size() as u64,
                usable: true,
            }]
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            // SAFETY: Allocated with the stored layout in `new`.
            unsafe { std::alloc::dealloc(self.base, self.layout) };
        }
    }

    /// Builds a Pmm over a fresh arena. The arena must outlive the Pmm, so
    /// both are returned together.
    pub fn pmm_fixture(pages: usize) -> (Arc<Arena>, Arc<Pmm>) {
        let arena = Arc::new(Arena::new(pages));
        // SAFETY: The arena really is readable/writable memory at
        // dmap_offset + phys for the whole region.
        let pmm = unsafe { Pmm::new(&arena.regions(), arena.dmap_offset()).unwrap() };
        (arena, Arc::new(pmm))
    }
}
